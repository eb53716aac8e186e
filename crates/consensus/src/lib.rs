//! # Consensus
//!
//! A small linearizable key-value store replicated with Raft. Replicas use it
//! for everything they must agree on: the replication log, block number
//! counters, table metadata and published log pointers.
//!
//! ```text
//!   ConsensusHandle ──propose──► leader RaftNode ──Append──► followers
//!        │                           │  wal + fsync               │ wal + fsync
//!        │                           ◄────────AppendReply─────────┘
//!        │                        commit (majority, current term)
//!        │                           │
//!        └──read/list/watch──► local KvState ◄── apply committed entries
//! ```
//!
//! Nodes are deterministic state machines driven by ticks; [`LocalNetwork`]
//! routes their messages in memory. Every node persists its term, vote and
//! log entries to a [`wal`] file before answering, and periodically replaces
//! the log prefix with a snapshot of the state machine.
//!
//! A proposal first probes the followers: if fewer than a quorum answer,
//! it fails with [`ConsensusError::QuorumLost`] and nothing is appended.

mod command;
mod error;
mod log;
mod message;
mod network;
mod node;
mod state;
mod storage;
mod watch;

pub use command::{Command, Outcome};
pub use error::ConsensusError;
pub use log::{LogEntry, RaftLog, Snapshot};
pub use message::{Envelope, Message};
pub use network::{ConsensusHandle, LocalNetwork, NodeStatus};
pub use node::{RaftNode, Role};
pub use state::{Change, ChangeBatch, ChangeKind, KvState, Versioned};
pub use storage::{HardState, NodeStorage, Recovered, SNAPSHOT_FILENAME, WAL_FILENAME};
pub use watch::Watch;

/// A committed proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// Raft log index of the entry.
    pub index: u64,
    pub outcome: Outcome,
}

/// A value read from one node's state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub value: Option<Vec<u8>>,
    /// 0 when the path does not exist.
    pub version: u64,
    /// The serving node may be behind the leader.
    pub lagging: bool,
}

/// The coordination service as seen by a replica.
pub trait Coordination: Send + Sync {
    /// Consensus node this client is bound to.
    fn node_id(&self) -> u64;

    /// Commits `command` through the leader and returns its outcome.
    fn propose(&self, command: Command) -> Result<Committed, ConsensusError>;

    fn read(&self, path: &str) -> Result<ReadResult, ConsensusError>;

    /// Paths starting with `prefix` and their values, in path order.
    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, ConsensusError>;

    fn changes_since(&self, prefix: &str, after: u64) -> Result<ChangeBatch, ConsensusError>;

    fn watch(&self, prefix: &str, after: u64) -> Watch;

    fn status(&self) -> Result<NodeStatus, ConsensusError>;
}

#[cfg(test)]
mod tests;
