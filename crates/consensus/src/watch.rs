use std::collections::VecDeque;
use std::sync::Arc;

use crate::state::Change;
use crate::{ConsensusError, Coordination};

/// Follows changes under a path prefix.
///
/// A watch never ends: when nothing new is available the iterator returns
/// `None`, and a later call picks up whatever arrived since. It can be
/// restarted from any revision that is still retained.
pub struct Watch {
    source: Arc<dyn Coordination>,
    prefix: String,
    after: u64,
    buffer: VecDeque<Change>,
}

impl Watch {
    pub fn new(source: Arc<dyn Coordination>, prefix: &str, after: u64) -> Self {
        Self {
            source,
            prefix: prefix.to_string(),
            after,
            buffer: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Revision up to which changes have been fetched.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.after
    }

    /// Everything that is available now, buffered changes first.
    pub fn poll(&mut self) -> Result<Vec<Change>, ConsensusError> {
        self.fill()?;
        Ok(self.buffer.drain(..).collect())
    }

    /// Forgets buffered changes and resumes after `revision`.
    pub fn restart(&mut self, revision: u64) {
        self.buffer.clear();
        self.after = revision;
    }

    fn fill(&mut self) -> Result<(), ConsensusError> {
        let batch = self.source.changes_since(&self.prefix, self.after)?;
        self.after = self.after.max(batch.revision);
        self.buffer.extend(batch.changes);
        Ok(())
    }
}

impl Iterator for Watch {
    type Item = Result<Change, ConsensusError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if let Err(e) = self.fill() {
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("prefix", &self.prefix)
            .field("after", &self.after)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
