//! One Raft node: election, log replication, commit and apply.
//!
//! The node is a synchronous state machine. It never does I/O on the network
//! itself: [`RaftNode::tick`], [`RaftNode::step`] and [`RaftNode::propose`]
//! queue outgoing messages, which the owner collects with
//! [`RaftNode::take_messages`] and delivers. Disk writes happen inline,
//! before the messages that depend on them are queued.
//!
//! ## Rules
//!
//! | event                    | action                                                 |
//! |--------------------------|--------------------------------------------------------|
//! | election timeout         | term+1, vote for self, `RequestVote` to every peer     |
//! | strict majority of votes | become leader, append `Noop`, replicate                |
//! | higher term seen         | persist the term, step down to follower                |
//! | `Append` from leader     | check `prev`, overwrite conflicts, advance commit      |
//! | majority `match_index`   | commit, but only an entry of the leader's own term     |
//! | follower behind snapshot | `InstallSnapshot`                                      |
//! | leader hears no quorum   | step down after an election timeout                    |

use config::ConsensusConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::log::{LogEntry, RaftLog, Snapshot};
use crate::message::{Envelope, Message};
use crate::state::KvState;
use crate::storage::{HardState, NodeStorage};
use crate::{Command, ConsensusError, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

pub struct RaftNode {
    id: u64,
    peers: Vec<u64>,
    config: ConsensusConfig,
    storage: NodeStorage,
    hard: HardState,
    role: Role,
    leader: Option<u64>,
    log: RaftLog,
    commit: u64,
    applied: u64,
    state: KvState,
    last_snapshot: Option<Snapshot>,

    rng: StdRng,
    ticks: u64,
    election_elapsed: u32,
    election_timeout: u32,
    heartbeat_elapsed: u32,
    leader_contact: u64,

    votes: BTreeSet<u64>,
    next_index: BTreeMap<u64, u64>,
    match_index: BTreeMap<u64, u64>,
    last_ack: BTreeMap<u64, u64>,
    probe: u64,
    probe_acks: BTreeSet<u64>,

    /// Proposals made here that are not applied yet: index -> term.
    pending: BTreeMap<u64, u64>,
    outcomes: BTreeMap<u64, Outcome>,
    outbox: Vec<Envelope>,
}

impl RaftNode {
    /// Opens node `id` of the cluster `members` from `dir`.
    pub fn open(id: u64, members: &[u64], dir: &Path, config: ConsensusConfig) -> Result<Self, ConsensusError> {
        let (storage, recovered) = NodeStorage::open(dir, config.fsync)?;

        let mut log = RaftLog::new();
        let mut state = KvState::new(config.retained_changes);
        if let Some(snap) = &recovered.snapshot {
            state = KvState::decode(&snap.data, config.retained_changes)?;
            log.reset(snap.index, snap.term);
        }
        for e in recovered.entries {
            log.push(e);
        }
        let applied = log.snapshot_index();

        let seed = config.seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut node = Self {
            id,
            peers: members.iter().copied().filter(|m| *m != id).collect(),
            storage,
            hard: recovered.hard_state,
            role: Role::Follower,
            leader: None,
            log,
            commit: applied,
            applied,
            state,
            last_snapshot: recovered.snapshot,
            rng: StdRng::seed_from_u64(seed),
            ticks: 0,
            election_elapsed: 0,
            election_timeout: config.election_ticks.max(1),
            heartbeat_elapsed: 0,
            leader_contact: 0,
            votes: BTreeSet::new(),
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            last_ack: BTreeMap::new(),
            probe: 0,
            probe_acks: BTreeSet::new(),
            pending: BTreeMap::new(),
            outcomes: BTreeMap::new(),
            outbox: Vec::new(),
            config,
        };
        node.reset_election_timer();
        debug!(
            node = id,
            term = node.hard.term,
            last_index = node.log.last_index(),
            snapshot = node.log.snapshot_index(),
            "raft node opened"
        );
        Ok(node)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn term(&self) -> u64 {
        self.hard.term
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn leader(&self) -> Option<u64> {
        self.leader
    }

    #[must_use]
    pub fn commit_index(&self) -> u64 {
        self.commit
    }

    #[must_use]
    pub fn applied_index(&self) -> u64 {
        self.applied
    }

    #[must_use]
    pub fn last_index(&self) -> u64 {
        self.log.last_index()
    }

    #[must_use]
    pub fn snapshot_index(&self) -> u64 {
        self.log.snapshot_index()
    }

    #[must_use]
    pub fn state(&self) -> &KvState {
        &self.state
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// `true` when this node may be serving stale data: it has no leader, has
    /// not heard from its leader for an election timeout, or (as leader) has
    /// lost contact with a quorum.
    #[must_use]
    pub fn is_lagging(&self) -> bool {
        match self.role {
            Role::Leader => !self.has_quorum_contact(),
            Role::Candidate => true,
            Role::Follower => {
                self.leader.is_none()
                    || self.ticks.saturating_sub(self.leader_contact) >= u64::from(self.config.election_ticks)
            }
        }
    }

    pub fn take_messages(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Result of a proposal made here, once it is applied.
    pub fn take_outcome(&mut self, index: u64) -> Option<Outcome> {
        self.outcomes.remove(&index)
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) -> Result<(), ConsensusError> {
        self.ticks += 1;
        self.election_elapsed += 1;
        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_ticks.max(1) {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_append(0);
                }
                if self.election_elapsed >= self.election_timeout {
                    self.election_elapsed = 0;
                    if !self.has_quorum_contact() {
                        warn!(node = self.id, term = self.hard.term, "leader lost contact with quorum, stepping down");
                        self.role = Role::Follower;
                        self.leader = None;
                        self.reset_election_timer();
                    }
                }
            }
            Role::Follower | Role::Candidate => {
                if self.election_elapsed >= self.election_timeout {
                    self.campaign()?;
                }
            }
        }
        Ok(())
    }

    /// Starts an election for the next term.
    pub fn campaign(&mut self) -> Result<(), ConsensusError> {
        self.hard = HardState {
            term: self.hard.term + 1,
            voted_for: Some(self.id),
        };
        self.storage.save_hard_state(self.hard)?;
        self.role = Role::Candidate;
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.reset_election_timer();
        debug!(node = self.id, term = self.hard.term, "starting election");

        if self.votes.len() >= self.quorum() {
            return self.become_leader();
        }
        let (last_log_index, last_log_term) = (self.log.last_index(), self.log.last_term());
        for &peer in &self.peers {
            self.outbox.push(Envelope {
                from: self.id,
                to: peer,
                msg: Message::RequestVote {
                    term: self.hard.term,
                    last_log_index,
                    last_log_term,
                },
            });
        }
        Ok(())
    }

    /// Appends `command` to the log. Only the leader accepts proposals.
    ///
    /// Returns the entry's index; it is committed once a majority stores it.
    pub fn propose(&mut self, command: Command) -> Result<u64, ConsensusError> {
        if self.role != Role::Leader {
            return Err(ConsensusError::NotLeader {
                node: self.id,
                hint: self.leader,
            });
        }
        let index = self.append_local(command)?;
        self.pending.insert(index, self.hard.term);
        self.broadcast_append(0);
        self.advance_commit()?;
        Ok(index)
    }

    /// Sends a heartbeat round whose replies are counted. Returns the probe id.
    pub fn begin_probe(&mut self) -> u64 {
        self.probe += 1;
        self.probe_acks.clear();
        self.probe_acks.insert(self.id);
        self.broadcast_append(self.probe);
        self.probe
    }

    /// Nodes (this one included) that answered the latest probe.
    #[must_use]
    pub fn probe_acks(&self) -> usize {
        self.probe_acks.len()
    }

    /// Sends `peer` whatever it is missing.
    pub fn replicate_to(&mut self, peer: u64) {
        if self.role == Role::Leader && self.peers.contains(&peer) {
            self.send_append(peer, 0);
        }
    }

    /// Handles one message from `from`.
    pub fn step(&mut self, from: u64, msg: Message) -> Result<(), ConsensusError> {
        if msg.term() > self.hard.term {
            let leader = match msg {
                Message::Append { .. } | Message::InstallSnapshot { .. } => Some(from),
                _ => None,
            };
            if self.role == Role::Leader {
                info!(node = self.id, term = msg.term(), "newer term seen, stepping down");
            }
            self.hard = HardState {
                term: msg.term(),
                voted_for: None,
            };
            self.storage.save_hard_state(self.hard)?;
            self.role = Role::Follower;
            self.leader = leader;
        }

        match msg {
            Message::RequestVote {
                term,
                last_log_index,
                last_log_term,
            } => {
                let up_to_date = (last_log_term, last_log_index) >= (self.log.last_term(), self.log.last_index());
                let granted = term == self.hard.term
                    && self.role == Role::Follower
                    && self.hard.voted_for.map_or(true, |v| v == from)
                    && up_to_date;
                if granted {
                    self.hard.voted_for = Some(from);
                    self.storage.save_hard_state(self.hard)?;
                    self.reset_election_timer();
                }
                self.send(from, Message::Vote {
                    term: self.hard.term,
                    granted,
                });
            }
            Message::Vote { term, granted } => {
                if self.role == Role::Candidate && term == self.hard.term && granted {
                    self.votes.insert(from);
                    if self.votes.len() >= self.quorum() {
                        self.become_leader()?;
                    }
                }
            }
            Message::Append {
                term,
                prev_index,
                prev_term,
                entries,
                commit,
                probe,
            } => self.handle_append(from, term, prev_index, prev_term, entries, commit, probe)?,
            Message::AppendReply {
                term,
                success,
                match_index,
                probe,
            } => {
                if self.role != Role::Leader || term != self.hard.term {
                    return Ok(());
                }
                self.last_ack.insert(from, self.ticks);
                if probe != 0 && probe == self.probe {
                    self.probe_acks.insert(from);
                }
                if success {
                    let m = self.match_index.entry(from).or_insert(0);
                    *m = (*m).max(match_index);
                    let next = *m + 1;
                    self.next_index.insert(from, next);
                    self.advance_commit()?;
                    if next <= self.log.last_index() {
                        self.send_append(from, 0);
                    }
                } else {
                    let next = self.next_index.get(&from).copied().unwrap_or(1);
                    let retry = next.saturating_sub(1).min(match_index + 1).max(1);
                    self.next_index.insert(from, retry);
                    self.send_append(from, 0);
                }
            }
            Message::InstallSnapshot { term, snapshot } => self.handle_snapshot(from, term, snapshot)?,
            Message::SnapshotReply { term, last_index } => {
                if self.role != Role::Leader || term != self.hard.term {
                    return Ok(());
                }
                self.last_ack.insert(from, self.ticks);
                let m = self.match_index.entry(from).or_insert(0);
                *m = (*m).max(last_index);
                let next = *m + 1;
                self.next_index.insert(from, next);
                self.advance_commit()?;
                if next <= self.log.last_index() {
                    self.send_append(from, 0);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append(
        &mut self,
        from: u64,
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        probe: u64,
    ) -> Result<(), ConsensusError> {
        if term < self.hard.term {
            self.send(from, Message::AppendReply {
                term: self.hard.term,
                success: false,
                match_index: self.log.last_index(),
                probe,
            });
            return Ok(());
        }
        self.follow(from);

        // Entries up to the snapshot are committed, so they match by definition.
        let matched = prev_index <= self.log.snapshot_index() || self.log.term_at(prev_index) == Some(prev_term);
        if !matched {
            self.send(from, Message::AppendReply {
                term: self.hard.term,
                success: false,
                match_index: self.log.last_index().min(prev_index.saturating_sub(1)),
                probe,
            });
            return Ok(());
        }

        let last_new = prev_index + entries.len() as u64;
        let mut fresh: Vec<LogEntry> = Vec::new();
        for e in entries {
            if e.index <= self.log.snapshot_index() {
                continue;
            }
            if !fresh.is_empty() {
                fresh.push(e);
                continue;
            }
            match self.log.term_at(e.index) {
                Some(t) if t == e.term => {}
                Some(_) => {
                    debug!(node = self.id, from_index = e.index, "truncating conflicting log suffix");
                    self.log.truncate_from(e.index);
                    self.storage.truncate_from(e.index)?;
                    fresh.push(e);
                }
                None => fresh.push(e),
            }
        }
        if !fresh.is_empty() {
            self.storage.append(&fresh)?;
            for e in fresh {
                self.log.push(e);
            }
        }

        let target = leader_commit.min(last_new.max(self.log.snapshot_index()));
        if target > self.commit {
            self.commit = target;
            self.apply_committed()?;
        }
        self.send(from, Message::AppendReply {
            term: self.hard.term,
            success: true,
            match_index: last_new.max(self.log.snapshot_index()),
            probe,
        });
        Ok(())
    }

    fn handle_snapshot(&mut self, from: u64, term: u64, snapshot: Snapshot) -> Result<(), ConsensusError> {
        if term < self.hard.term {
            self.send(from, Message::SnapshotReply {
                term: self.hard.term,
                last_index: self.log.last_index(),
            });
            return Ok(());
        }
        self.follow(from);

        if snapshot.index > self.commit {
            self.state = KvState::decode(&snapshot.data, self.config.retained_changes)?;
            if self.log.term_at(snapshot.index) == Some(snapshot.term) {
                self.log.compact_to(snapshot.index, snapshot.term);
            } else {
                self.log.reset(snapshot.index, snapshot.term);
            }
            self.storage.save_snapshot(&snapshot, self.hard, self.log.entries())?;
            self.commit = snapshot.index;
            self.applied = snapshot.index;
            info!(node = self.id, index = snapshot.index, "installed snapshot from leader");
            self.last_snapshot = Some(snapshot);
        }
        self.send(from, Message::SnapshotReply {
            term: self.hard.term,
            last_index: self.commit,
        });
        Ok(())
    }

    fn follow(&mut self, leader: u64) {
        if self.role != Role::Follower || self.leader != Some(leader) {
            debug!(node = self.id, leader, term = self.hard.term, "following leader");
        }
        self.role = Role::Follower;
        self.leader = Some(leader);
        self.leader_contact = self.ticks;
        self.reset_election_timer();
    }

    fn become_leader(&mut self) -> Result<(), ConsensusError> {
        info!(node = self.id, term = self.hard.term, "became leader");
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.heartbeat_elapsed = 0;
        self.election_elapsed = 0;
        let next = self.log.last_index() + 1;
        for &peer in &self.peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
            self.last_ack.insert(peer, self.ticks);
        }
        self.append_local(Command::Noop)?;
        self.broadcast_append(0);
        self.advance_commit()
    }

    fn append_local(&mut self, command: Command) -> Result<u64, ConsensusError> {
        let entry = LogEntry {
            index: self.log.last_index() + 1,
            term: self.hard.term,
            command,
        };
        self.storage.append(std::slice::from_ref(&entry))?;
        let index = entry.index;
        self.log.push(entry);
        Ok(index)
    }

    fn broadcast_append(&mut self, probe: u64) {
        for i in 0..self.peers.len() {
            let peer = self.peers[i];
            self.send_append(peer, probe);
        }
    }

    fn send_append(&mut self, peer: u64, probe: u64) {
        let next = self.next_index.get(&peer).copied().unwrap_or(1);
        if next <= self.log.snapshot_index() {
            if let Some(snapshot) = &self.last_snapshot {
                let msg = Message::InstallSnapshot {
                    term: self.hard.term,
                    snapshot: snapshot.clone(),
                };
                self.send(peer, msg);
                return;
            }
        }
        let prev_index = next - 1;
        let msg = Message::Append {
            term: self.hard.term,
            prev_index,
            prev_term: self.log.term_at(prev_index).unwrap_or(0),
            entries: self.log.slice(next, self.config.max_entries_per_message.max(1)),
            commit: self.commit,
            probe,
        };
        self.send(peer, msg);
    }

    fn send(&mut self, to: u64, msg: Message) {
        self.outbox.push(Envelope { from: self.id, to, msg });
    }

    fn has_quorum_contact(&self) -> bool {
        let window = u64::from(self.config.election_ticks);
        let recent = self
            .peers
            .iter()
            .filter(|p| {
                self.last_ack
                    .get(p)
                    .map_or(false, |&at| self.ticks.saturating_sub(at) <= window)
            })
            .count();
        recent + 1 >= self.quorum()
    }

    fn advance_commit(&mut self) -> Result<(), ConsensusError> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let mut n = self.log.last_index();
        let mut new_commit = self.commit;
        while n > self.commit {
            // Only entries of the current term are committed by counting replicas.
            if self.log.term_at(n) == Some(self.hard.term) {
                let replicas = 1 + self.match_index.values().filter(|&&m| m >= n).count();
                if replicas >= self.quorum() {
                    new_commit = n;
                    break;
                }
            }
            n -= 1;
        }
        if new_commit > self.commit {
            self.commit = new_commit;
            self.apply_committed()?;
            self.broadcast_append(0);
        }
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<(), ConsensusError> {
        while self.applied < self.commit {
            let index = self.applied + 1;
            let Some(entry) = self.log.get(index) else {
                return Err(ConsensusError::Corrupt(format!(
                    "node {}: committed entry {} missing from log",
                    self.id, index
                )));
            };
            let (term, command) = (entry.term, entry.command.clone());
            let outcome = self.state.apply(&command);
            self.applied = index;
            if let Some(proposed_term) = self.pending.remove(&index) {
                if proposed_term == term {
                    self.outcomes.insert(index, outcome);
                }
            }
        }
        self.maybe_snapshot()
    }

    fn maybe_snapshot(&mut self) -> Result<(), ConsensusError> {
        let every = self.config.snapshot_every;
        if every == 0 || self.applied - self.log.snapshot_index() < every {
            return Ok(());
        }
        let index = self.applied;
        let term = self.log.term_at(index).unwrap_or(self.hard.term);
        let snapshot = Snapshot {
            index,
            term,
            data: self.state.encode(),
        };
        self.log.compact_to(index, term);
        self.storage.save_snapshot(&snapshot, self.hard, self.log.entries())?;
        debug!(node = self.id, index, "took state machine snapshot");
        self.last_snapshot = Some(snapshot);
        Ok(())
    }

    fn reset_election_timer(&mut self) {
        let base = self.config.election_ticks.max(1);
        self.election_elapsed = 0;
        self.election_timeout = self.rng.gen_range(base..base * 2);
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("term", &self.hard.term)
            .field("leader", &self.leader)
            .field("last_index", &self.log.last_index())
            .field("commit", &self.commit)
            .field("applied", &self.applied)
            .finish()
    }
}
