use consensus::{Command, Coordination, Outcome};
use std::sync::Arc;
use tracing::debug;

use crate::entry::LogEntry;
use crate::paths::TablePaths;
use crate::ReplicationError;

/// The ordered, replicated log of one table.
///
/// Entries are sequential nodes in the coordination store, so sequence
/// numbers are assigned by consensus: strictly increasing, without gaps, and
/// never reused.
#[derive(Clone)]
pub struct ReplicationLog {
    coord: Arc<dyn Coordination>,
    paths: TablePaths,
}

impl ReplicationLog {
    pub fn new(coord: Arc<dyn Coordination>, paths: TablePaths) -> Self {
        Self { coord, paths }
    }

    /// Appends `entry` and returns its sequence number.
    pub fn append(&self, entry: &LogEntry) -> Result<u64, ReplicationError> {
        let value = entry.encode()?;
        let committed = self.coord.propose(Command::CreateSequential {
            prefix: self.paths.log_prefix(),
            value,
        })?;
        match committed.outcome {
            Outcome::Sequential { seq, .. } => {
                debug!(log = %self.paths.base(), seq, op = entry.op.kind(), "log entry appended");
                Ok(seq)
            }
            other => Err(ReplicationError::Other(anyhow::anyhow!(
                "unexpected outcome for log append: {:?}",
                other
            ))),
        }
    }

    /// Highest sequence number visible to this replica; 0 for an empty log.
    pub fn head(&self) -> Result<u64, ReplicationError> {
        let entries = self.coord.list(&self.paths.log_prefix())?;
        Ok(entries
            .iter()
            .filter_map(|(path, _)| self.paths.seq_of(path))
            .max()
            .unwrap_or(0))
    }

    /// Entries after `from_seq`, up to the head as of now.
    pub fn tail(&self, from_seq: u64) -> Result<LogTail, ReplicationError> {
        Ok(LogTail {
            log: self.clone(),
            next: from_seq + 1,
            head: self.head()?,
        })
    }

    pub fn read(&self, seq: u64) -> Result<Option<LogEntry>, ReplicationError> {
        match self.coord.read(&self.paths.log_entry(seq))?.value {
            Some(bytes) => LogEntry::decode(seq, &bytes).map(Some),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for ReplicationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationLog").field("base", &self.paths.base()).finish()
    }
}

/// Lazy iterator over a fixed range of log entries.
#[derive(Debug)]
pub struct LogTail {
    log: ReplicationLog,
    next: u64,
    head: u64,
}

impl LogTail {
    /// Last sequence number this tail will yield.
    #[must_use]
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Starts over after `from_seq`, keeping the same head.
    pub fn restart(&mut self, from_seq: u64) {
        self.next = from_seq + 1;
    }
}

impl Iterator for LogTail {
    type Item = Result<LogEntry, ReplicationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.head {
            return None;
        }
        let seq = self.next;
        self.next += 1;
        Some(match self.log.read(seq) {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => Err(ReplicationError::CorruptEntry {
                seq,
                reason: "entry missing from log".into(),
            }),
            Err(e) => Err(e),
        })
    }
}
