use crate::log::{LogEntry, Snapshot};

/// Raft messages exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestVote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    Vote {
        term: u64,
        granted: bool,
    },
    Append {
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit: u64,
        /// Non-zero when the leader is counting replies for a quorum probe.
        probe: u64,
    },
    AppendReply {
        term: u64,
        success: bool,
        /// On success the last matching index; on failure the follower's
        /// last index, as a hint for where to retry.
        match_index: u64,
        probe: u64,
    },
    InstallSnapshot {
        term: u64,
        snapshot: Snapshot,
    },
    SnapshotReply {
        term: u64,
        last_index: u64,
    },
}

impl Message {
    #[must_use]
    pub fn term(&self) -> u64 {
        match self {
            Message::RequestVote { term, .. }
            | Message::Vote { term, .. }
            | Message::Append { term, .. }
            | Message::AppendReply { term, .. }
            | Message::InstallSnapshot { term, .. }
            | Message::SnapshotReply { term, .. } => *term,
        }
    }
}

/// A message in flight.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: u64,
    pub to: u64,
    pub msg: Message,
}
