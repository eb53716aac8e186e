use consensus::ConsensusError;
use engine::StoreError;
use thiserror::Error;

/// Failures surfaced by replicas and their queues.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// No peer could deliver a part right now. Retried with backoff.
    #[error("fetching part {part} failed: {reason}")]
    TransientFetch { part: String, reason: String },

    /// A transferred or local part does not match the announced checksum.
    #[error("checksum mismatch for part {part}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { part: String, expected: u32, actual: u32 },

    /// Recomputing a merge locally gave a different part than the one
    /// announced. The entry is left failed.
    #[error("merge into {output} diverged: announced {expected:#010x}, computed {actual:#010x}")]
    DivergentMergeResult { output: String, expected: u32, actual: u32 },

    #[error("{0}")]
    QuorumLost(ConsensusError),

    /// Disk budget spent or disk full. Nothing was written.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("coordination: {0}")]
    Coordination(ConsensusError),

    #[error("replication log entry {seq} is corrupt: {reason}")]
    CorruptEntry { seq: u64, reason: String },

    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ConsensusError> for ReplicationError {
    fn from(e: ConsensusError) -> Self {
        match e {
            ConsensusError::QuorumLost { .. } => ReplicationError::QuorumLost(e),
            other => ReplicationError::Coordination(other),
        }
    }
}

impl ReplicationError {
    /// Lifts the store errors replicas react to out of an `anyhow` chain.
    pub fn from_store(err: anyhow::Error) -> Self {
        match StoreError::find(&err) {
            Some(StoreError::ResourceExhausted(msg)) => ReplicationError::ResourceExhausted(msg.clone()),
            Some(StoreError::ChecksumMismatch {
                part,
                expected,
                actual,
            }) => ReplicationError::ChecksumMismatch {
                part: part.clone(),
                expected: *expected,
                actual: *actual,
            },
            _ => ReplicationError::Other(err),
        }
    }

    /// `false` for failures that another attempt cannot fix.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ReplicationError::DivergentMergeResult { .. } | ReplicationError::CorruptEntry { .. }
        )
    }
}
