use thiserror::Error;
use wal::WalError;

/// Failures reported by the consensus service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// The node cannot accept proposals; `hint` names the leader it knows of.
    #[error("node {node} is not the leader (leader hint: {hint:?})")]
    NotLeader { node: u64, hint: Option<u64> },

    /// Fewer than a quorum of nodes answered the leader. Nothing was appended.
    #[error("quorum lost: {reachable} of {needed} required nodes reachable")]
    QuorumLost { reachable: usize, needed: usize },

    /// The node is offline, or a proposal could not be confirmed.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Persisting the raft log or a snapshot failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Changes after `requested` are no longer retained for watchers.
    #[error("changes after revision {requested} were compacted (oldest available: {oldest})")]
    Compacted { requested: u64, oldest: u64 },

    #[error("corrupt data: {0}")]
    Corrupt(String),
}

impl From<WalError> for ConsensusError {
    fn from(e: WalError) -> Self {
        ConsensusError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for ConsensusError {
    fn from(e: std::io::Error) -> Self {
        ConsensusError::Storage(e.to_string())
    }
}
