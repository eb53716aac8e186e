//! # Engine - Part Store
//!
//! Owns the parts of one table on one replica: writes new parts, tracks
//! their lifecycle, merges them, and serves range reads over the active set.
//!
//! ## Architecture
//!
//! ```text
//!  insert batch                 replication queue              merge scheduler
//!       |                              |                              |
//!       v                              v                              v
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               PART STORE                                 │
//! │                                                                          │
//! │ write.rs   add_part() ──▶ Prepared ──activate()──▶ Active                │
//! │            import_part() (bytes from a peer) ──▶ Prepared                │
//! │                                                                          │
//! │ merge.rs   prepare_merge() ──▶ Prepared output                           │
//! │            commit_merge()  ──▶ output Active, inputs Outdated (one swap) │
//! │            drop_part(), collect_garbage()                                │
//! │                                                                          │
//! │ read.rs    scan() ──▶ RowScan over an Arc snapshot of the active set     │
//! │                                                                          │
//! │ select.rs  MergeSelector: which adjacent parts to merge next             │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                                  |
//! |----------------|----------------------------------------------------------|
//! | [`lib.rs`]     | `PartStore` struct, open, accessors, `Debug`             |
//! | [`recovery`]   | tmp/orphan cleanup, checksum verification on open        |
//! | [`write`]      | `add_part`, `activate`, `import_part`, `export_part`     |
//! | [`read`]       | `scan`, `RowScan`, `ScanCursor`, `active_parts`          |
//! | [`merge`]      | merge preparation/commit, claims, drops, garbage         |
//! | [`select`]     | merge candidate selection                                |
//! | [`manifest`]   | persistent part states (atomic file ops)                 |
//!
//! ## Concurrency
//!
//! All methods take `&self`. Part bookkeeping sits behind one `Mutex`; the
//! active set is an `Arc<ActiveSet>` replaced wholesale under an `RwLock`, so
//! a reader clones the `Arc` and never waits for a merge. Parts are deleted
//! only when no snapshot still references them.

mod error;
mod manifest;
mod merge;
mod read;
mod recovery;
mod select;
mod write;

pub use error::StoreError;
pub use manifest::{Manifest, PartState, MANIFEST_FILENAME};
pub use merge::MergeClaim;
pub use read::{RowScan, ScanCursor};
pub use select::{MergeCandidate, MergeSelector};

use anyhow::{anyhow, Context, Result};
use config::EngineConfig;
use part::{PartName, PartReader};
use rows::codec::{decode_table_def, encode_table_def};
use rows::TableDef;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// File holding the table definition the store currently applies.
pub const TABLE_DEF_FILENAME: &str = "table.def";

/// An open part plus its lifecycle state.
pub(crate) struct PartSlot {
    pub(crate) reader: Arc<PartReader>,
    pub(crate) state: PartState,
    /// Bytes on disk, counted against the budget.
    pub(crate) bytes: u64,
}

/// Mutable bookkeeping, guarded by one mutex.
pub(crate) struct StoreState {
    pub(crate) parts: BTreeMap<PartName, PartSlot>,
    pub(crate) manifest: Manifest,
}

/// Immutable snapshot of the active parts, ordered by part name
/// (partition, then block range).
#[derive(Debug, Default)]
pub struct ActiveSet {
    pub(crate) parts: Vec<Arc<PartReader>>,
}

impl ActiveSet {
    #[must_use]
    pub fn parts(&self) -> &[Arc<PartReader>] {
        &self.parts
    }

    #[must_use]
    pub fn rows(&self) -> u64 {
        self.parts.iter().map(|p| p.rows()).sum()
    }
}

/// The parts of one table on one replica.
pub struct PartStore {
    pub(crate) table_dir: PathBuf,
    pub(crate) def: RwLock<Arc<TableDef>>,
    pub(crate) config: EngineConfig,
    pub(crate) state: Mutex<StoreState>,
    pub(crate) active: RwLock<Arc<ActiveSet>>,
    pub(crate) claims: Arc<Mutex<HashSet<PartName>>>,
    pub(crate) bytes_used: AtomicU64,
    pub(crate) granules_read: Arc<AtomicU64>,
}

impl std::fmt::Debug for PartStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active = self.snapshot();
        f.debug_struct("PartStore")
            .field("table_dir", &self.table_dir)
            .field("active_parts", &active.parts.len())
            .field("active_rows", &active.rows())
            .field("bytes_used", &self.bytes_used.load(Ordering::Relaxed))
            .field("max_bytes", &self.config.max_bytes)
            .finish()
    }
}

impl PartStore {
    /// Opens the store in `table_dir`, creating it with `def` if it is new.
    ///
    /// An existing store keeps the definition it last applied (`table.def`);
    /// `def` is only used on first open.
    ///
    /// # Recovery Steps
    ///
    /// 1. Create the table directory if it does not exist.
    /// 2. Load or write `table.def`.
    /// 3. Remove leftover `*.tmp` part directories.
    /// 4. Open and verify every part in the manifest; adopt verified orphans
    ///    as `Prepared`; detach broken parts; delete `Outdated` parts.
    /// 5. Build the active set.
    pub fn open(table_dir: impl AsRef<Path>, def: &TableDef, config: EngineConfig) -> Result<Self> {
        let table_dir = table_dir.as_ref().to_path_buf();
        fs::create_dir_all(&table_dir)
            .with_context(|| format!("creating table directory {}", table_dir.display()))?;

        let def_path = table_dir.join(TABLE_DEF_FILENAME);
        let def = if def_path.exists() {
            decode_table_def(&fs::read(&def_path)?)
                .with_context(|| format!("reading {}", def_path.display()))?
        } else {
            def.validate()?;
            write_atomic(&def_path, &encode_table_def(def)?, config.fsync)?;
            def.clone()
        };

        let manifest = Manifest::load_or_create(&table_dir, config.fsync)?;
        let store = Self {
            table_dir,
            def: RwLock::new(Arc::new(def)),
            config,
            state: Mutex::new(StoreState {
                parts: BTreeMap::new(),
                manifest,
            }),
            active: RwLock::new(Arc::new(ActiveSet::default())),
            claims: Arc::new(Mutex::new(HashSet::new())),
            bytes_used: AtomicU64::new(0),
            granules_read: Arc::new(AtomicU64::new(0)),
        };
        store.recover()?;
        Ok(store)
    }

    #[must_use]
    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    /// The table definition currently applied.
    #[must_use]
    pub fn def(&self) -> Arc<TableDef> {
        match self.def.read() {
            Ok(d) => Arc::clone(&d),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replaces the table definition (an applied alteration).
    pub fn set_def(&self, next: &TableDef) -> Result<()> {
        self.def().check_alter(next)?;
        write_atomic(
            &self.table_dir.join(TABLE_DEF_FILENAME),
            &encode_table_def(next)?,
            self.config.fsync,
        )?;
        let mut guard = self.def.write().map_err(|e| anyhow!("lock poisoned: {}", e))?;
        *guard = Arc::new(next.clone());
        tracing::info!(table = %next.name, "table definition replaced");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bytes on disk over all parts the store tracks, in any state.
    #[must_use]
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Relaxed)
    }

    /// Granules decoded by scans since the store was opened.
    #[must_use]
    pub fn granules_read(&self) -> u64 {
        self.granules_read.load(Ordering::Relaxed)
    }

    /// The current active set. Holding the `Arc` pins those parts on disk.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ActiveSet> {
        match self.active.read() {
            Ok(a) => Arc::clone(&a),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// State of a part, if the store knows it.
    #[must_use]
    pub fn part_state(&self, name: &PartName) -> Option<PartState> {
        self.lock_state().ok()?.parts.get(name).map(|s| s.state)
    }

    /// Checksum of a part the store holds in any state.
    pub fn part_checksum(&self, name: &PartName) -> Result<u32> {
        let st = self.lock_state()?;
        st.parts
            .get(name)
            .map(|s| s.reader.checksum())
            .ok_or_else(|| StoreError::PartNotFound(name.clone()).into())
    }

    /// Row count of a part the store holds in any state.
    pub fn part_rows(&self, name: &PartName) -> Result<u64> {
        let st = self.lock_state()?;
        st.parts
            .get(name)
            .map(|s| s.reader.rows())
            .ok_or_else(|| StoreError::PartNotFound(name.clone()).into())
    }

    /// Every part the store tracks with its state, in name order.
    pub fn parts(&self) -> Result<Vec<(PartName, PartState)>> {
        let st = self.lock_state()?;
        Ok(st.parts.iter().map(|(n, s)| (n.clone(), s.state)).collect())
    }

    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|e| anyhow!("lock poisoned: {}", e))
    }

    /// Rebuilds the active set from `st` and publishes it.
    pub(crate) fn publish(&self, st: &StoreState) -> Result<()> {
        let parts: Vec<Arc<PartReader>> = st
            .parts
            .values()
            .filter(|s| s.state == PartState::Active)
            .map(|s| Arc::clone(&s.reader))
            .collect();
        let mut guard = self.active.write().map_err(|e| anyhow!("lock poisoned: {}", e))?;
        *guard = Arc::new(ActiveSet { parts });
        Ok(())
    }

    /// Fails with `ResourceExhausted` if `extra` more bytes would exceed the budget.
    pub(crate) fn ensure_capacity(&self, extra: u64) -> Result<()> {
        let limit = self.config.max_bytes;
        if limit == 0 {
            return Ok(());
        }
        let used = self.bytes_used();
        if used.saturating_add(extra) > limit {
            return Err(StoreError::ResourceExhausted(format!(
                "{} bytes used + {} needed exceeds budget of {}",
                used, extra, limit
            ))
            .into());
        }
        Ok(())
    }

    pub(crate) fn release_bytes(&self, n: u64) {
        let _ = self
            .bytes_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |u| Some(u.saturating_sub(n)));
    }

    /// `true` if the disk budget is already spent.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.config.max_bytes != 0 && self.bytes_used() >= self.config.max_bytes
    }
}

/// Writes `bytes` to `path` through a tmp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], fsync: bool) -> Result<()> {
    use std::io::Write;
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(bytes)?;
        if fsync {
            f.sync_all()?;
        }
    }
    fs::rename(&tmp, path).with_context(|| format!("installing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests;
