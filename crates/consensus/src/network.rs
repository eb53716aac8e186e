//! In-process transport for a group of [`RaftNode`]s.
//!
//! All nodes live behind one mutex. Messages are queued and delivered in FIFO
//! order until the queue drains; a stopped node is simply absent, so messages
//! to and from it are dropped. Time only advances through [`LocalNetwork::tick`].

use config::ConsensusConfig;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::node::{RaftNode, Role};
use crate::state::ChangeBatch;
use crate::watch::Watch;
use crate::{Command, Committed, ConsensusError, Coordination, Envelope, ReadResult};

/// Upper bound on messages handled by one delivery pass.
const MAX_DELIVERIES: usize = 1_000_000;

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node: u64,
    pub role: Role,
    pub term: u64,
    pub leader: Option<u64>,
    pub last_index: u64,
    pub commit: u64,
    pub applied: u64,
    pub lagging: bool,
}

struct Inner {
    root: PathBuf,
    config: ConsensusConfig,
    members: Vec<u64>,
    nodes: BTreeMap<u64, Option<RaftNode>>,
    queue: VecDeque<Envelope>,
}

/// A cluster of consensus nodes wired together in memory.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl LocalNetwork {
    /// Opens nodes `1..=n` under `root/{id}` and elects a leader.
    pub fn start(root: &Path, n: usize, config: ConsensusConfig) -> Result<Self, ConsensusError> {
        let members: Vec<u64> = (1..=n as u64).collect();
        let mut nodes = BTreeMap::new();
        for &id in &members {
            let node = RaftNode::open(id, &members, &root.join(id.to_string()), config.clone())?;
            nodes.insert(id, Some(node));
        }
        let net = Self {
            inner: Arc::new(Mutex::new(Inner {
                root: root.to_path_buf(),
                config,
                members,
                nodes,
                queue: VecDeque::new(),
            })),
        };
        let leader = net.settle()?;
        info!(nodes = n, ?leader, "consensus group started");
        Ok(net)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, ConsensusError> {
        self.inner
            .lock()
            .map_err(|_| ConsensusError::Unavailable("consensus network lock poisoned".into()))
    }

    /// A client bound to node `id`.
    #[must_use]
    pub fn handle(&self, id: u64) -> ConsensusHandle {
        ConsensusHandle {
            net: self.clone(),
            node: id,
        }
    }

    #[must_use]
    pub fn members(&self) -> Vec<u64> {
        self.lock().map(|i| i.members.clone()).unwrap_or_default()
    }

    pub fn tick(&self) -> Result<(), ConsensusError> {
        self.lock()?.tick()
    }

    pub fn tick_n(&self, n: usize) -> Result<(), ConsensusError> {
        let mut inner = self.lock()?;
        for _ in 0..n {
            inner.tick()?;
        }
        Ok(())
    }

    /// Ticks until an online leader holds quorum contact and every online
    /// node has caught up with its commit index, or gives up.
    pub fn settle(&self) -> Result<Option<u64>, ConsensusError> {
        self.lock()?.settle()
    }

    #[must_use]
    pub fn leader(&self) -> Option<u64> {
        self.lock().ok().and_then(|i| i.leader())
    }

    #[must_use]
    pub fn is_online(&self, id: u64) -> bool {
        self.lock()
            .map(|i| matches!(i.nodes.get(&id), Some(Some(_))))
            .unwrap_or(false)
    }

    pub fn status(&self, id: u64) -> Result<NodeStatus, ConsensusError> {
        let inner = self.lock()?;
        inner.node(id).map(status_of)
    }

    /// Takes node `id` offline. Its on-disk state is kept.
    pub fn stop(&self, id: u64) -> Result<(), ConsensusError> {
        let mut inner = self.lock()?;
        match inner.nodes.get_mut(&id) {
            Some(slot) => {
                *slot = None;
                info!(node = id, "consensus node stopped");
                Ok(())
            }
            None => Err(ConsensusError::Unavailable(format!("unknown node {}", id))),
        }
    }

    /// Reopens node `id` from disk and lets the group bring it up to date.
    pub fn restart(&self, id: u64) -> Result<(), ConsensusError> {
        let mut inner = self.lock()?;
        if !inner.nodes.contains_key(&id) {
            return Err(ConsensusError::Unavailable(format!("unknown node {}", id)));
        }
        if matches!(inner.nodes.get(&id), Some(Some(_))) {
            return Ok(());
        }
        let dir = inner.root.join(id.to_string());
        let node = RaftNode::open(id, &inner.members, &dir, inner.config.clone())?;
        inner.nodes.insert(id, Some(node));
        info!(node = id, "consensus node restarted");
        inner.settle()?;
        Ok(())
    }

    /// Proposes directly at node `id`, without following leader hints.
    pub fn propose_at(&self, id: u64, command: Command) -> Result<u64, ConsensusError> {
        let mut inner = self.lock()?;
        let index = inner.node_mut(id)?.propose(command)?;
        inner.collect(id);
        inner.deliver()?;
        Ok(index)
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.lock() {
            Ok(inner) => f
                .debug_struct("LocalNetwork")
                .field("members", &inner.members)
                .field("leader", &inner.leader())
                .finish(),
            Err(_) => f.debug_struct("LocalNetwork").finish_non_exhaustive(),
        }
    }
}

impl Inner {
    fn node(&self, id: u64) -> Result<&RaftNode, ConsensusError> {
        match self.nodes.get(&id) {
            Some(Some(node)) => Ok(node),
            Some(None) => Err(ConsensusError::Unavailable(format!("node {} is offline", id))),
            None => Err(ConsensusError::Unavailable(format!("unknown node {}", id))),
        }
    }

    fn node_mut(&mut self, id: u64) -> Result<&mut RaftNode, ConsensusError> {
        match self.nodes.get_mut(&id) {
            Some(Some(node)) => Ok(node),
            Some(None) => Err(ConsensusError::Unavailable(format!("node {} is offline", id))),
            None => Err(ConsensusError::Unavailable(format!("unknown node {}", id))),
        }
    }

    fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn online(&self) -> usize {
        self.nodes.values().filter(|n| n.is_some()).count()
    }

    /// The online leader with the highest term.
    fn leader(&self) -> Option<u64> {
        self.nodes
            .values()
            .flatten()
            .filter(|n| n.role() == Role::Leader)
            .max_by_key(|n| n.term())
            .map(RaftNode::id)
    }

    fn tick(&mut self) -> Result<(), ConsensusError> {
        let ids: Vec<u64> = self.nodes.keys().copied().collect();
        for id in ids {
            if let Some(Some(node)) = self.nodes.get_mut(&id) {
                node.tick()?;
            }
            self.collect(id);
        }
        self.deliver()
    }

    fn collect(&mut self, id: u64) {
        if let Some(Some(node)) = self.nodes.get_mut(&id) {
            self.queue.extend(node.take_messages());
        }
    }

    fn deliver(&mut self) -> Result<(), ConsensusError> {
        let mut handled = 0usize;
        while let Some(env) = self.queue.pop_front() {
            handled += 1;
            if handled > MAX_DELIVERIES {
                warn!(pending = self.queue.len(), "delivery budget exhausted");
                self.queue.clear();
                break;
            }
            let sender_online = matches!(self.nodes.get(&env.from), Some(Some(_)));
            let Some(Some(node)) = self.nodes.get_mut(&env.to) else {
                continue;
            };
            if !sender_online {
                continue;
            }
            node.step(env.from, env.msg)?;
            self.collect(env.to);
        }
        Ok(())
    }

    fn settled(&self) -> Option<u64> {
        let id = self.leader()?;
        let leader = self.node(id).ok()?;
        if leader.is_lagging() {
            return None;
        }
        let caught_up = self
            .nodes
            .values()
            .flatten()
            .all(|n| n.leader() == Some(id) && n.applied_index() >= leader.commit_index());
        caught_up.then_some(id)
    }

    fn settle(&mut self) -> Result<Option<u64>, ConsensusError> {
        let budget = u64::from(self.config.election_ticks.max(1)) * 40;
        for _ in 0..budget {
            if let Some(id) = self.settled() {
                return Ok(Some(id));
            }
            self.tick()?;
        }
        let leader = self.settled();
        if leader.is_none() {
            debug!(online = self.online(), "consensus group did not settle");
        }
        Ok(leader)
    }

    fn propose(&mut self, command: Command) -> Result<Committed, ConsensusError> {
        let needed = self.quorum();
        let leader = match self.leader() {
            Some(id) => id,
            None => match self.settle()? {
                Some(id) => id,
                None => {
                    return Err(ConsensusError::QuorumLost {
                        reachable: self.online(),
                        needed,
                    })
                }
            },
        };

        // Count who answers before appending anything.
        self.node_mut(leader)?.begin_probe();
        self.collect(leader);
        self.deliver()?;
        let reachable = self.node(leader)?.probe_acks();
        if reachable < needed {
            return Err(ConsensusError::QuorumLost { reachable, needed });
        }

        let index = self.node_mut(leader)?.propose(command)?;
        self.collect(leader);
        self.deliver()?;
        for _ in 0..self.config.election_ticks {
            if let Some(outcome) = self.node_mut(leader)?.take_outcome(index) {
                return Ok(Committed { index, outcome });
            }
            if self.node(leader)?.applied_index() >= index {
                break;
            }
            self.tick()?;
        }
        Err(ConsensusError::Unavailable(format!(
            "entry {} proposed at node {} was not committed",
            index, leader
        )))
    }
}

fn status_of(node: &RaftNode) -> NodeStatus {
    NodeStatus {
        node: node.id(),
        role: node.role(),
        term: node.term(),
        leader: node.leader(),
        last_index: node.last_index(),
        commit: node.commit_index(),
        applied: node.applied_index(),
        lagging: node.is_lagging(),
    }
}

/// A client of the coordination store bound to one node.
///
/// Reads are served by that node's state machine and may be stale; writes are
/// forwarded to the current leader.
#[derive(Clone)]
pub struct ConsensusHandle {
    net: LocalNetwork,
    node: u64,
}

impl ConsensusHandle {
    #[must_use]
    pub fn network(&self) -> &LocalNetwork {
        &self.net
    }
}

impl std::fmt::Debug for ConsensusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusHandle").field("node", &self.node).finish()
    }
}

impl Coordination for ConsensusHandle {
    fn node_id(&self) -> u64 {
        self.node
    }

    fn propose(&self, command: Command) -> Result<Committed, ConsensusError> {
        let mut inner = self.net.lock()?;
        inner.node(self.node)?;
        inner.propose(command)
    }

    fn read(&self, path: &str) -> Result<ReadResult, ConsensusError> {
        let inner = self.net.lock()?;
        let node = inner.node(self.node)?;
        let entry = node.state().get(path);
        Ok(ReadResult {
            value: entry.map(|v| v.value.clone()),
            version: entry.map_or(0, |v| v.version),
            lagging: node.is_lagging(),
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, ConsensusError> {
        let inner = self.net.lock()?;
        let node = inner.node(self.node)?;
        Ok(node
            .state()
            .list(prefix)
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect())
    }

    fn changes_since(&self, prefix: &str, after: u64) -> Result<ChangeBatch, ConsensusError> {
        let inner = self.net.lock()?;
        inner.node(self.node)?.state().changes_since(prefix, after)
    }

    fn watch(&self, prefix: &str, after: u64) -> Watch {
        Watch::new(Arc::new(self.clone()), prefix, after)
    }

    fn status(&self) -> Result<NodeStatus, ConsensusError> {
        self.net.status(self.node)
    }
}
