//! The replicated key-value state machine.
//!
//! Paths are plain strings (`/tables/01/hits/log/log-0000000003`); there is
//! no directory tree, prefixes are matched textually. Every mutation bumps a
//! global revision and is recorded as a [`Change`] so watchers can follow
//! along. Only the most recent changes are kept; older ones are compacted.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeMap, VecDeque};

use crate::command::{read_blob, read_str, write_blob, write_str};
use crate::{Command, ConsensusError, Outcome};

const SNAPSHOT_MAGIC: u32 = 0x4B56_5331; // "KVS1"

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    /// 1 on creation, +1 on every write.
    pub version: u64,
    /// Revision of the last write.
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One mutation, as seen by watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub revision: u64,
    pub path: String,
    pub kind: ChangeKind,
}

/// Changes under a prefix plus the revision they were read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    pub revision: u64,
}

#[derive(Debug, Clone)]
pub struct KvState {
    entries: BTreeMap<String, Versioned>,
    sequences: BTreeMap<String, u64>,
    revision: u64,
    changes: VecDeque<Change>,
    /// Changes at or below this revision are gone.
    compacted_through: u64,
    retained: usize,
}

impl KvState {
    #[must_use]
    pub fn new(retained: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            sequences: BTreeMap::new(),
            revision: 0,
            changes: VecDeque::new(),
            compacted_through: 0,
            retained: retained.max(1),
        }
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Versioned> {
        self.entries.get(path)
    }

    /// Entries whose path starts with `prefix`, in path order.
    pub fn list<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a Versioned)> + 'a {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes under `prefix` with a revision above `after`.
    pub fn changes_since(&self, prefix: &str, after: u64) -> Result<ChangeBatch, ConsensusError> {
        if after < self.compacted_through {
            return Err(ConsensusError::Compacted {
                requested: after,
                oldest: self.compacted_through,
            });
        }
        let changes = self
            .changes
            .iter()
            .filter(|c| c.revision > after && c.path.starts_with(prefix))
            .cloned()
            .collect();
        Ok(ChangeBatch {
            changes,
            revision: self.revision,
        })
    }

    pub fn apply(&mut self, cmd: &Command) -> Outcome {
        match cmd {
            Command::Noop => Outcome::Noop,
            Command::Put { path, value } => {
                let version = self.write(path, value.clone());
                Outcome::Written { version }
            }
            Command::Delete { path } => {
                let existed = self.entries.remove(path).is_some();
                if existed {
                    self.record(path, ChangeKind::Deleted);
                }
                Outcome::Deleted { existed }
            }
            Command::CompareAndSet { path, expected, value } => {
                let current = self.entries.get(path).map(|v| v.version);
                if current == *expected {
                    let version = self.write(path, value.clone());
                    Outcome::Swapped { ok: true, version }
                } else {
                    Outcome::Swapped {
                        ok: false,
                        version: current.unwrap_or(0),
                    }
                }
            }
            Command::Increment { path, by } => {
                let old = self
                    .entries
                    .get(path)
                    .and_then(|v| v.value.as_slice().try_into().ok())
                    .map(u64::from_le_bytes)
                    .unwrap_or(0);
                let value = old.wrapping_add(*by);
                self.write(path, value.to_le_bytes().to_vec());
                Outcome::Counter { value }
            }
            Command::CreateSequential { prefix, value } => {
                let seq = self.sequences.get(prefix).copied().unwrap_or(0) + 1;
                self.sequences.insert(prefix.clone(), seq);
                let path = format!("{}{:010}", prefix, seq);
                self.write(&path, value.clone());
                Outcome::Sequential { path, seq }
            }
        }
    }

    fn write(&mut self, path: &str, value: Vec<u8>) -> u64 {
        let revision = self.revision + 1;
        let (version, kind) = match self.entries.get_mut(path) {
            Some(v) => {
                v.value = value;
                v.version += 1;
                v.modified = revision;
                (v.version, ChangeKind::Updated)
            }
            None => {
                self.entries.insert(
                    path.to_string(),
                    Versioned {
                        value,
                        version: 1,
                        modified: revision,
                    },
                );
                (1, ChangeKind::Created)
            }
        };
        self.record(path, kind);
        version
    }

    fn record(&mut self, path: &str, kind: ChangeKind) {
        self.revision += 1;
        self.changes.push_back(Change {
            revision: self.revision,
            path: path.to_string(),
            kind,
        });
        while self.changes.len() > self.retained {
            if let Some(old) = self.changes.pop_front() {
                self.compacted_through = old.revision;
            }
        }
    }

    /// Serializes entries, sequence counters and the revision. Retained
    /// changes are not part of a snapshot.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.entries.len() * 48);
        let _ = self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u32::<LittleEndian>(SNAPSHOT_MAGIC)?;
        buf.write_u64::<LittleEndian>(self.revision)?;
        buf.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for (path, v) in &self.entries {
            write_str(buf, path)?;
            write_blob(buf, &v.value)?;
            buf.write_u64::<LittleEndian>(v.version)?;
            buf.write_u64::<LittleEndian>(v.modified)?;
        }
        buf.write_u32::<LittleEndian>(self.sequences.len() as u32)?;
        for (prefix, seq) in &self.sequences {
            write_str(buf, prefix)?;
            buf.write_u64::<LittleEndian>(*seq)?;
        }
        Ok(())
    }

    /// Rebuilds a state from [`encode`](Self::encode) output. Watchers can
    /// resume only from the snapshot's revision onwards.
    pub fn decode(mut bytes: &[u8], retained: usize) -> Result<Self, ConsensusError> {
        let corrupt = |e: std::io::Error| ConsensusError::Corrupt(format!("kv snapshot: {}", e));
        let r = &mut bytes;
        if r.read_u32::<LittleEndian>().map_err(corrupt)? != SNAPSHOT_MAGIC {
            return Err(ConsensusError::Corrupt("kv snapshot: bad magic".into()));
        }
        let revision = r.read_u64::<LittleEndian>().map_err(corrupt)?;
        let n = r.read_u32::<LittleEndian>().map_err(corrupt)?;
        let mut entries = BTreeMap::new();
        for _ in 0..n {
            let path = read_str(r)?;
            let value = read_blob(r)?;
            let version = r.read_u64::<LittleEndian>().map_err(corrupt)?;
            let modified = r.read_u64::<LittleEndian>().map_err(corrupt)?;
            entries.insert(path, Versioned { value, version, modified });
        }
        let n = r.read_u32::<LittleEndian>().map_err(corrupt)?;
        let mut sequences = BTreeMap::new();
        for _ in 0..n {
            let prefix = read_str(r)?;
            sequences.insert(prefix, r.read_u64::<LittleEndian>().map_err(corrupt)?);
        }
        Ok(Self {
            entries,
            sequences,
            revision,
            changes: VecDeque::new(),
            compacted_through: revision,
            retained: retained.max(1),
        })
    }
}
