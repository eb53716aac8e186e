//! On-disk state of one consensus node.
//!
//! ```text
//! raft/{node}/
//!   raft.wal       hard state + log entries after the snapshot (wal crate)
//!   snapshot.bin   [magic "SNP1"][index u64][term u64][crc u32][len u32][kv state]
//! ```
//!
//! The snapshot is installed first (tmp + rename), then the WAL is rewritten
//! to hold only the entries after it. A crash between the two leaves extra
//! entries in the WAL that recovery skips.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use wal::{WalRecord, WalWriter};

use crate::log::{LogEntry, Snapshot};
use crate::{Command, ConsensusError};

pub const WAL_FILENAME: &str = "raft.wal";
pub const SNAPSHOT_FILENAME: &str = "snapshot.bin";
const SNAPSHOT_MAGIC: u32 = 0x534E_5031; // "SNP1"

/// Term and vote, persisted before any reply that depends on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<u64>,
}

/// What a node finds on disk at startup.
#[derive(Debug, Default)]
pub struct Recovered {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    /// Entries after the snapshot, in index order.
    pub entries: Vec<LogEntry>,
}

pub struct NodeStorage {
    dir: PathBuf,
    wal: WalWriter,
    fsync: bool,
}

impl NodeStorage {
    /// Opens the node directory, replaying the snapshot and the WAL.
    pub fn open(dir: &Path, fsync: bool) -> Result<(Self, Recovered), ConsensusError> {
        fs::create_dir_all(dir)?;
        let snapshot = load_snapshot(&dir.join(SNAPSHOT_FILENAME))?;
        let floor = snapshot.as_ref().map_or(0, |s| s.index);

        let mut recovered = Recovered {
            snapshot,
            ..Recovered::default()
        };
        for record in wal::recover(dir.join(WAL_FILENAME))? {
            match record {
                WalRecord::HardState { term, voted_for } => {
                    recovered.hard_state = HardState { term, voted_for };
                }
                WalRecord::Entry { index, term, payload } => {
                    if index <= floor {
                        continue;
                    }
                    recovered.entries.retain(|e| e.index < index);
                    let expected = recovered.entries.last().map_or(floor + 1, |e| e.index + 1);
                    if index != expected {
                        return Err(ConsensusError::Corrupt(format!(
                            "raft log gap: expected entry {}, found {}",
                            expected, index
                        )));
                    }
                    recovered.entries.push(LogEntry {
                        index,
                        term,
                        command: Command::decode(&payload)?,
                    });
                }
                WalRecord::Truncate { from_index } => {
                    recovered.entries.retain(|e| e.index < from_index);
                }
            }
        }

        let wal = WalWriter::create(dir.join(WAL_FILENAME), fsync)?;
        Ok((
            Self {
                dir: dir.to_path_buf(),
                wal,
                fsync,
            },
            recovered,
        ))
    }

    pub fn save_hard_state(&mut self, hs: HardState) -> Result<(), ConsensusError> {
        self.wal.append(&WalRecord::HardState {
            term: hs.term,
            voted_for: hs.voted_for,
        })?;
        Ok(())
    }

    pub fn append(&mut self, entries: &[LogEntry]) -> Result<(), ConsensusError> {
        let records: Vec<WalRecord> = entries.iter().map(entry_record).collect();
        self.wal.append_batch(&records)?;
        Ok(())
    }

    pub fn truncate_from(&mut self, from_index: u64) -> Result<(), ConsensusError> {
        self.wal.append(&WalRecord::Truncate { from_index })?;
        Ok(())
    }

    /// Installs `snapshot` and rewrites the WAL to `hs` + `remaining`.
    pub fn save_snapshot(
        &mut self,
        snapshot: &Snapshot,
        hs: HardState,
        remaining: &[LogEntry],
    ) -> Result<(), ConsensusError> {
        let path = self.dir.join(SNAPSHOT_FILENAME);
        let tmp = path.with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&encode_snapshot(snapshot))?;
            if self.fsync {
                f.sync_all()?;
            }
        }
        fs::rename(&tmp, &path)?;

        let mut records = Vec::with_capacity(remaining.len() + 1);
        records.push(WalRecord::HardState {
            term: hs.term,
            voted_for: hs.voted_for,
        });
        records.extend(remaining.iter().map(entry_record));
        let wal_path = self.dir.join(WAL_FILENAME);
        wal::rewrite(&wal_path, &records, self.fsync)?;
        self.wal = WalWriter::create(&wal_path, self.fsync)?;
        Ok(())
    }
}

impl std::fmt::Debug for NodeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStorage").field("dir", &self.dir).finish()
    }
}

fn entry_record(e: &LogEntry) -> WalRecord {
    WalRecord::Entry {
        index: e.index,
        term: e.term,
        payload: e.command.encode(),
    }
}

fn encode_snapshot(s: &Snapshot) -> Vec<u8> {
    let mut buf = Vec::with_capacity(28 + s.data.len());
    let mut hasher = Crc32::new();
    hasher.update(&s.data);
    // Writes into a Vec cannot fail.
    let _ = buf.write_u32::<LittleEndian>(SNAPSHOT_MAGIC);
    let _ = buf.write_u64::<LittleEndian>(s.index);
    let _ = buf.write_u64::<LittleEndian>(s.term);
    let _ = buf.write_u32::<LittleEndian>(hasher.finalize());
    let _ = buf.write_u32::<LittleEndian>(s.data.len() as u32);
    buf.extend_from_slice(&s.data);
    buf
}

fn load_snapshot(path: &Path) -> Result<Option<Snapshot>, ConsensusError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let corrupt = |e: std::io::Error| ConsensusError::Corrupt(format!("{}: {}", path.display(), e));
    let mut r = bytes.as_slice();
    if r.read_u32::<LittleEndian>().map_err(corrupt)? != SNAPSHOT_MAGIC {
        return Err(ConsensusError::Corrupt(format!("{}: bad magic", path.display())));
    }
    let index = r.read_u64::<LittleEndian>().map_err(corrupt)?;
    let term = r.read_u64::<LittleEndian>().map_err(corrupt)?;
    let crc = r.read_u32::<LittleEndian>().map_err(corrupt)?;
    let len = r.read_u32::<LittleEndian>().map_err(corrupt)? as usize;
    if r.len() != len {
        return Err(ConsensusError::Corrupt(format!("{}: truncated", path.display())));
    }
    let mut hasher = Crc32::new();
    hasher.update(r);
    if hasher.finalize() != crc {
        return Err(ConsensusError::Corrupt(format!("{}: checksum mismatch", path.display())));
    }
    Ok(Some(Snapshot {
        index,
        term,
        data: r.to_vec(),
    }))
}
