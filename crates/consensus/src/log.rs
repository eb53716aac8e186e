use crate::Command;

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

/// State machine image at a log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Last log index folded into `data`.
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

/// In-memory raft log: the entries after the last snapshot.
///
/// Index 0 is a sentinel with term 0; real entries start at 1.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    snapshot_index: u64,
    snapshot_term: u64,
    entries: Vec<LogEntry>,
}

impl RaftLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    #[must_use]
    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    #[must_use]
    pub fn last_index(&self) -> u64 {
        self.entries.last().map_or(self.snapshot_index, |e| e.index)
    }

    #[must_use]
    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(self.snapshot_term, |e| e.term)
    }

    /// Term of the entry at `index`, or `None` if it is unknown (compacted
    /// below the snapshot or past the end).
    #[must_use]
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    #[must_use]
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Up to `max` entries starting at `from`.
    #[must_use]
    pub fn slice(&self, from: u64, max: usize) -> Vec<LogEntry> {
        if from <= self.snapshot_index {
            return Vec::new();
        }
        let start = (from - self.snapshot_index - 1) as usize;
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Appends an entry; its index must be `last_index() + 1`.
    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Drops entries with `index >= from`.
    pub fn truncate_from(&mut self, from: u64) {
        if from <= self.snapshot_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((from - self.snapshot_index - 1) as usize);
    }

    /// Forgets entries up to and including `index`, now covered by a snapshot.
    pub fn compact_to(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        let keep_from = (index - self.snapshot_index) as usize;
        if keep_from >= self.entries.len() {
            self.entries.clear();
        } else {
            self.entries.drain(..keep_from);
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replaces the whole log with an installed snapshot.
    pub fn reset(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }
}
