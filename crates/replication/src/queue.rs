//! The per-table replication queue of one replica.
//!
//! ```text
//!            fetch ok           apply ok
//!   Idle ──► Fetching ──► Applying ──► Idle      (last_applied_seq = seq)
//!     ▲          │             │
//!     │          └── error ────┴──► attempts < max: back off, stay Idle
//!     │                              attempts = max or not retryable: Failed
//!     └── retry_failed() ◄── Failed ──► skip_failed() drops the entry
//! ```
//!
//! Entries are applied strictly in sequence order; a failed entry blocks the
//! ones behind it. The last applied sequence is persisted after every entry,
//! so a restarted replica resumes exactly where it stopped.
//!
//! State file `queue/{table}.state`:
//! `[magic "RQS1": u32][last_applied_seq: u64][crc32: u32]`.

use anyhow::{ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use config::ReplicationConfig;
use crc32fast::Hasher as Crc32;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::entry::LogEntry;
use crate::log::ReplicationLog;
use crate::ReplicationError;

const STATE_MAGIC: u32 = 0x5251_5331; // "RQS1"

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Idle,
    Fetching,
    Applying,
    Failed,
}

/// The entry a queue is stuck on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedEntry {
    pub seq: u64,
    pub attempts: u32,
    pub error: String,
}

/// Executes log entries against local state.
pub trait EntryApplier {
    /// Makes every part `entry` needs available locally.
    fn fetch(&self, entry: &LogEntry) -> Result<(), ReplicationError>;

    /// Applies `entry`. Must be idempotent.
    fn apply(&self, entry: &LogEntry) -> Result<(), ReplicationError>;
}

/// What one [`ReplicationQueue::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunReport {
    pub applied: usize,
    pub remaining: usize,
    pub failed: bool,
}

pub struct ReplicationQueue {
    table: String,
    state_path: PathBuf,
    fsync: bool,
    config: ReplicationConfig,
    last_applied: u64,
    state: QueueState,
    pending: VecDeque<LogEntry>,
    attempts: u32,
    retry_at: Option<Instant>,
    failed: Option<FailedEntry>,
}

impl ReplicationQueue {
    /// Opens the queue state for `table` under `dir`, starting at 0 if none
    /// was persisted.
    pub fn open(dir: &Path, table: &str, config: ReplicationConfig, fsync: bool) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let state_path = dir.join(format!("{}.state", table));
        let last_applied = if state_path.exists() {
            load_state(&state_path)?
        } else {
            0
        };
        debug!(table, last_applied, "replication queue opened");
        Ok(Self {
            table: table.to_string(),
            state_path,
            fsync,
            config,
            last_applied,
            state: QueueState::Idle,
            pending: VecDeque::new(),
            attempts: 0,
            retry_at: None,
            failed: None,
        })
    }

    #[must_use]
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    #[must_use]
    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Entries fetched from the log and not applied yet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn failed(&self) -> Option<&FailedEntry> {
        self.failed.as_ref()
    }

    /// Highest sequence number queued or applied.
    #[must_use]
    pub fn last_queued(&self) -> u64 {
        self.pending.back().map_or(self.last_applied, |e| e.seq)
    }

    /// Queues entries the log holds beyond what is already queued.
    pub fn pull(&mut self, log: &ReplicationLog) -> Result<usize, ReplicationError> {
        let mut added = 0;
        for entry in log.tail(self.last_queued())? {
            self.pending.push_back(entry?);
            added += 1;
        }
        if added > 0 {
            debug!(table = %self.table, added, queued = self.pending.len(), "queue pulled log");
        }
        Ok(added)
    }

    /// Applies queued entries in order until the queue is empty, an entry
    /// waits for its backoff, or an entry fails for good.
    pub fn run(&mut self, applier: &dyn EntryApplier, now: Instant) -> Result<RunReport, ReplicationError> {
        let mut report = RunReport::default();
        while let Some(entry) = self.pending.front() {
            if self.state == QueueState::Failed {
                break;
            }
            if self.retry_at.map_or(false, |at| now < at) {
                break;
            }
            if entry.seq <= self.last_applied {
                self.pending.pop_front();
                continue;
            }
            let entry = entry.clone();

            self.state = QueueState::Fetching;
            let result = applier.fetch(&entry).and_then(|()| {
                self.state = QueueState::Applying;
                applier.apply(&entry)
            });
            match result {
                Ok(()) => {
                    self.last_applied = entry.seq;
                    self.save()?;
                    self.pending.pop_front();
                    self.attempts = 0;
                    self.retry_at = None;
                    self.state = QueueState::Idle;
                    report.applied += 1;
                    debug!(table = %self.table, seq = entry.seq, op = entry.op.kind(), "entry applied");
                }
                Err(e) => {
                    self.attempts += 1;
                    if e.is_retryable() && self.attempts < self.config.max_attempts {
                        let delay = self.backoff(self.attempts);
                        warn!(
                            table = %self.table,
                            seq = entry.seq,
                            attempt = self.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "entry failed, will retry"
                        );
                        self.state = QueueState::Idle;
                        self.retry_at = Some(now + delay);
                    } else {
                        warn!(
                            table = %self.table,
                            seq = entry.seq,
                            attempts = self.attempts,
                            error = %e,
                            "entry failed, queue stopped"
                        );
                        self.state = QueueState::Failed;
                        self.failed = Some(FailedEntry {
                            seq: entry.seq,
                            attempts: self.attempts,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        report.remaining = self.pending.len();
        report.failed = self.state == QueueState::Failed;
        Ok(report)
    }

    /// Delay before attempt `attempt + 1`: `base * 2^(attempt - 1)`, capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.config
            .backoff_base
            .checked_mul(factor)
            .unwrap_or(self.config.backoff_max)
            .min(self.config.backoff_max)
    }

    /// Clears a failure so the next run tries the entry again.
    pub fn retry_failed(&mut self) -> Option<u64> {
        let failed = self.failed.take()?;
        self.state = QueueState::Idle;
        self.attempts = 0;
        self.retry_at = None;
        info!(table = %self.table, seq = failed.seq, "retrying failed entry");
        Some(failed.seq)
    }

    /// Gives up on the failed entry and moves past it.
    pub fn skip_failed(&mut self) -> Result<Option<u64>, ReplicationError> {
        let Some(failed) = self.failed.take() else {
            return Ok(None);
        };
        if self.pending.front().map(|e| e.seq) == Some(failed.seq) {
            self.pending.pop_front();
        }
        self.last_applied = self.last_applied.max(failed.seq);
        self.save()?;
        self.state = QueueState::Idle;
        self.attempts = 0;
        self.retry_at = None;
        warn!(table = %self.table, seq = failed.seq, error = %failed.error, "failed entry skipped");
        Ok(Some(failed.seq))
    }

    fn save(&self) -> Result<()> {
        let mut buf = Vec::with_capacity(16);
        buf.write_u32::<LittleEndian>(STATE_MAGIC)?;
        buf.write_u64::<LittleEndian>(self.last_applied)?;
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.write_u32::<LittleEndian>(hasher.finalize())?;

        let tmp = self.state_path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
            f.write_all(&buf)?;
            if self.fsync {
                f.sync_all()?;
            }
        }
        fs::rename(&tmp, &self.state_path)
            .with_context(|| format!("installing {}", self.state_path.display()))?;
        Ok(())
    }
}

impl std::fmt::Debug for ReplicationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationQueue")
            .field("table", &self.table)
            .field("last_applied", &self.last_applied)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("failed", &self.failed)
            .finish()
    }
}

fn load_state(path: &Path) -> Result<u64> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    ensure!(bytes.len() == 16, "{}: expected 16 bytes, found {}", path.display(), bytes.len());
    let mut hasher = Crc32::new();
    hasher.update(&bytes[..12]);
    let r = &mut &bytes[..];
    ensure!(r.read_u32::<LittleEndian>()? == STATE_MAGIC, "{}: bad magic", path.display());
    let last_applied = r.read_u64::<LittleEndian>()?;
    ensure!(
        r.read_u32::<LittleEndian>()? == hasher.finalize(),
        "{}: checksum mismatch",
        path.display()
    );
    Ok(last_applied)
}
