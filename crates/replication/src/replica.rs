use anyhow::{anyhow, Context};
use config::{ClusterConfig, ReplicaIdentity};
use consensus::{ChangeKind, Command, ConsensusError, Coordination, Outcome, Role, Watch};
use engine::{MergeSelector, PartStore, RowScan, ScanCursor};
use part::PartName;
use rows::codec::{decode_table_def, encode_table_def};
use rows::{KeyRange, Row, TableDef};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::apply::TableApplier;
use crate::entry::{LogEntry, LogOp};
use crate::exchange::PartExchange;
use crate::log::ReplicationLog;
use crate::paths::TablePaths;
use crate::pool::MergePool;
use crate::queue::{FailedEntry, QueueState, ReplicationQueue, RunReport};
use crate::ReplicationError;

/// One table as held by one replica.
pub(crate) struct TableReplica {
    pub(crate) name: String,
    pub(crate) paths: TablePaths,
    pub(crate) store: Arc<PartStore>,
    pub(crate) log: ReplicationLog,
    queue: Mutex<ReplicationQueue>,
    /// Log pointer last written to the coordination store.
    published: AtomicU64,
}

impl TableReplica {
    pub(crate) fn lock_queue(&self) -> Result<MutexGuard<'_, ReplicationQueue>, ReplicationError> {
        self.queue
            .lock()
            .map_err(|_| ReplicationError::Other(anyhow!("replication queue of {} poisoned", self.name)))
    }

    /// Writes `applied` as this replica's log pointer if it moved. A failed
    /// write is retried on the next sync.
    fn publish(&self, coord: &dyn Coordination, replica: &str, applied: u64) {
        if self.published.load(Ordering::Relaxed) == applied {
            return;
        }
        let put = Command::Put {
            path: self.paths.log_pointer(replica),
            value: applied.to_le_bytes().to_vec(),
        };
        match coord.propose(put) {
            Ok(_) => self.published.store(applied, Ordering::Relaxed),
            Err(e) => warn!(table = %self.name, replica, applied, error = %e, "log pointer not published"),
        }
    }
}

/// Replication status of one table on one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaHealth {
    pub table: String,
    pub replica: String,
    pub is_leader: bool,
    pub active_replica_count: usize,
    /// Log entries not applied yet, whether already pulled or not.
    pub queue_size: usize,
    /// Log head minus the last applied sequence number.
    pub lag: u64,
    pub last_applied_seq: u64,
    pub failed_entries: Vec<FailedEntry>,
    pub queue_state: QueueState,
    /// The local consensus node has lost contact with the leader.
    pub lagging_coordination: bool,
    pub active_parts: usize,
    pub rows: u64,
}

/// A replica: the part stores and replication queues of every table it
/// holds, bound to one consensus node.
///
/// All methods take `&self`; tables are attached as their definitions
/// appear in the coordination store.
pub struct Replica {
    identity: ReplicaIdentity,
    config: ClusterConfig,
    dir: PathBuf,
    root: String,
    pub(crate) coord: Arc<dyn Coordination>,
    pub(crate) exchange: Arc<dyn PartExchange>,
    pub(crate) selector: MergeSelector,
    pub(crate) pool: MergePool,
    tables: RwLock<BTreeMap<String, Arc<TableReplica>>>,
    ddl: Mutex<Watch>,
}

impl Replica {
    /// Opens the replica's data directory and attaches every table whose
    /// definition lists it.
    pub fn open(
        identity: ReplicaIdentity,
        config: ClusterConfig,
        coord: Arc<dyn Coordination>,
        exchange: Arc<dyn PartExchange>,
    ) -> Result<Self, ReplicationError> {
        let dir = config.data_dir.join(&identity.replica);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let root = TablePaths::root(&identity, &config.replication.table_path);
        let pool = MergePool::new(config.replication.merge_workers).context("starting merge workers")?;

        // Revision first, then the listing: a table created in between shows
        // up in both and attaching twice is harmless.
        let revision = coord.changes_since(&root, u64::MAX)?.revision;
        let ddl = Mutex::new(coord.watch(&root, revision));

        let replica = Self {
            selector: MergeSelector::new(config.merge.clone()),
            identity,
            config,
            dir,
            root,
            coord,
            exchange,
            pool,
            tables: RwLock::new(BTreeMap::new()),
            ddl,
        };
        replica.attach_listed()?;
        info!(
            replica = %replica.identity.replica,
            node = replica.identity.node_id,
            tables = replica.tables().len(),
            "replica opened"
        );
        Ok(replica)
    }

    #[must_use]
    pub fn identity(&self) -> &ReplicaIdentity {
        &self.identity
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    /// Names of the attached tables.
    #[must_use]
    pub fn tables(&self) -> Vec<String> {
        self.tables
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn store(&self, table: &str) -> Result<Arc<PartStore>, ReplicationError> {
        Ok(Arc::clone(&self.table(table)?.store))
    }

    /// `true` if the co-located consensus node leads. Only the leader
    /// assigns merges.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.coord
            .status()
            .map(|s| s.role == Role::Leader)
            .unwrap_or(false)
    }

    pub(crate) fn table(&self, name: &str) -> Result<Arc<TableReplica>, ReplicationError> {
        self.tables
            .read()
            .ok()
            .and_then(|t| t.get(name).cloned())
            .ok_or_else(|| ReplicationError::UnknownTable(name.to_string()))
    }

    fn attach_listed(&self) -> Result<(), ReplicationError> {
        for (path, value) in self.coord.list(&self.root)? {
            if TablePaths::table_of_metadata(&self.root, &path).is_some() {
                self.attach_encoded(&value)?;
            }
        }
        Ok(())
    }

    fn attach_encoded(&self, bytes: &[u8]) -> Result<(), ReplicationError> {
        let def = decode_table_def(bytes)?;
        if def.has_replica(&self.identity.replica) {
            self.attach(&def)?;
        }
        Ok(())
    }

    fn attach(&self, def: &TableDef) -> Result<(), ReplicationError> {
        if self.table(&def.name).is_ok() {
            return Ok(());
        }
        let paths = TablePaths::new(&self.identity, &self.config.replication.table_path, &def.name);
        let store = Arc::new(PartStore::open(
            self.dir.join("tables").join(&def.name),
            def,
            self.config.engine.clone(),
        )?);
        let queue = ReplicationQueue::open(
            &self.dir.join("queue"),
            &def.name,
            self.config.replication.clone(),
            self.config.engine.fsync,
        )?;
        let last_applied = queue.last_applied();
        let table = Arc::new(TableReplica {
            name: def.name.clone(),
            log: ReplicationLog::new(Arc::clone(&self.coord), paths.clone()),
            paths,
            store: Arc::clone(&store),
            queue: Mutex::new(queue),
            published: AtomicU64::new(u64::MAX),
        });

        self.exchange.serve(&self.identity.replica, &def.name, store);
        self.set_active(&table, true);
        table.publish(self.coord.as_ref(), &self.identity.replica, last_applied);

        self.tables
            .write()
            .map_err(|_| anyhow!("table registry poisoned"))?
            .insert(def.name.clone(), table);
        info!(table = %def.name, replica = %self.identity.replica, last_applied, "table attached");
        Ok(())
    }

    fn set_active(&self, table: &TableReplica, active: bool) {
        let put = Command::Put {
            path: table.paths.is_active(&self.identity.replica),
            value: if active { b"1".to_vec() } else { b"0".to_vec() },
        };
        if let Err(e) = self.coord.propose(put) {
            warn!(table = %table.name, replica = %self.identity.replica, active, error = %e, "is_active not written");
        }
    }

    /// Attaches tables created since the last call.
    pub fn refresh_tables(&self) -> Result<usize, ReplicationError> {
        let before = self.tables().len();
        let changes = {
            let mut ddl = self.ddl.lock().map_err(|_| anyhow!("ddl watch poisoned"))?;
            match ddl.poll() {
                Ok(changes) => changes,
                Err(ConsensusError::Compacted { oldest, .. }) => {
                    warn!(replica = %self.identity.replica, oldest, "ddl watch compacted, relisting");
                    let revision = self.coord.changes_since(&self.root, u64::MAX)?.revision;
                    ddl.restart(revision);
                    drop(ddl);
                    self.attach_listed()?;
                    return Ok(self.tables().len() - before);
                }
                Err(e) => return Err(e.into()),
            }
        };
        for change in changes {
            if change.kind == ChangeKind::Deleted {
                continue;
            }
            let Some(table) = TablePaths::table_of_metadata(&self.root, &change.path) else {
                continue;
            };
            if self.table(table).is_ok() {
                continue;
            }
            if let Some(bytes) = self.coord.read(&change.path)?.value {
                self.attach_encoded(&bytes)?;
            }
        }
        Ok(self.tables().len() - before)
    }

    /// Registers `def` in the coordination store. Every replica it lists
    /// attaches the table on its next refresh.
    ///
    /// Creating a table that exists with the same definition succeeds.
    pub fn create_table(&self, def: &TableDef) -> Result<(), ReplicationError> {
        def.validate()?;
        let paths = TablePaths::new(&self.identity, &self.config.replication.table_path, &def.name);
        let committed = self.coord.propose(Command::CompareAndSet {
            path: paths.metadata(),
            expected: None,
            value: encode_table_def(def)?,
        })?;
        if let Outcome::Swapped { ok: false, .. } = committed.outcome {
            let existing = self
                .coord
                .read(&paths.metadata())?
                .value
                .map(|b| decode_table_def(&b))
                .transpose()?;
            if existing.as_ref() != Some(def) {
                return Err(anyhow!("table {} already exists with a different definition", def.name).into());
            }
            debug!(table = %def.name, "table already exists");
        } else {
            info!(table = %def.name, replica = %self.identity.replica, "table created");
        }
        self.refresh_tables()?;
        Ok(())
    }

    /// Replaces the definition of an attached table. Columns, sort key and
    /// partitioning must stay the same.
    pub fn alter_table(&self, def: &TableDef) -> Result<(), ReplicationError> {
        let table = self.table(&def.name)?;
        table.store.def().check_alter(def)?;
        self.coord.propose(Command::Put {
            path: table.paths.metadata(),
            value: encode_table_def(def)?,
        })?;
        let seq = table.log.append(&LogEntry::new(
            self.identity.replica.as_str(),
            LogOp::AlterTable { def: def.clone() },
        ))?;
        info!(table = %def.name, seq, "table altered");
        self.sync(&def.name)?;
        Ok(())
    }

    /// Writes `rows` as one new part per partition and announces them.
    ///
    /// Rows are sorted first if they are not in sort-key order. Each part
    /// gets a block number from the shared counter, is written `Prepared`,
    /// and becomes visible when its `AddPart` entry is applied.
    ///
    /// # Errors
    ///
    /// - [`ReplicationError::ResourceExhausted`] when the disk budget is spent.
    /// - [`ReplicationError::QuorumLost`] when the write cannot be committed.
    ///   The prepared part is discarded.
    pub fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<PartName>, ReplicationError> {
        let t = self.table(table)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let def = t.store.def();
        for row in &rows {
            def.validate_row(row)?;
        }
        if t.store.is_exhausted() {
            return Err(ReplicationError::ResourceExhausted(format!(
                "table {}: disk budget of {} bytes spent",
                table,
                t.store.config().max_bytes
            )));
        }

        let key = def.sort_key()?;
        let mut rows = rows;
        if !key.is_sorted(&rows) {
            key.sort(&mut rows);
        }
        let mut by_partition: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        for row in rows {
            by_partition.entry(def.partition_of(&row)?).or_default().push(row);
        }

        let mut names = Vec::with_capacity(by_partition.len());
        for (partition, rows) in by_partition {
            let block = self.allocate_block(&t)?;
            let meta = t.store.add_part(rows, block).map_err(ReplicationError::from_store)?;
            let entry = LogEntry::new(
                self.identity.replica.as_str(),
                LogOp::AddPart {
                    part: meta.name.clone(),
                    checksum: meta.checksum,
                    rows: meta.rows,
                },
            );
            match t.log.append(&entry) {
                Ok(seq) => {
                    debug!(table, %partition, part = %meta.name, seq, rows = meta.rows, "part announced");
                    names.push(meta.name);
                }
                Err(e) => {
                    t.store.discard_prepared(&meta.name)?;
                    warn!(table, part = %meta.name, error = %e, "insert rejected");
                    return Err(e);
                }
            }
        }
        self.sync(table)?;
        self.maintain(table);
        Ok(names)
    }

    fn allocate_block(&self, table: &TableReplica) -> Result<u64, ReplicationError> {
        let committed = self.coord.propose(Command::Increment {
            path: table.paths.block_numbers(),
            by: 1,
        })?;
        match committed.outcome {
            Outcome::Counter { value } => Ok(value),
            other => Err(anyhow!("unexpected outcome for block allocation: {:?}", other).into()),
        }
    }

    /// Pulls new log entries for `table` and applies as many as possible.
    pub fn sync(&self, table: &str) -> Result<RunReport, ReplicationError> {
        let t = self.table(table)?;
        let applier = TableApplier {
            replica: &self.identity.replica,
            table: &t.name,
            paths: &t.paths,
            log: &t.log,
            store: &t.store,
            coord: self.coord.as_ref(),
            exchange: self.exchange.as_ref(),
        };
        let (report, applied) = {
            let mut queue = t.lock_queue()?;
            queue.pull(&t.log)?;
            let report = queue.run(&applier, Instant::now())?;
            (report, queue.last_applied())
        };
        t.publish(self.coord.as_ref(), &self.identity.replica, applied);
        Ok(report)
    }

    /// Refreshes the table list, syncs every table and runs background
    /// upkeep on it. Returns the number of entries applied, counting the
    /// merges the upkeep announced and applied here.
    pub fn sync_all(&self) -> Result<usize, ReplicationError> {
        self.refresh_tables()?;
        let mut applied = 0;
        for table in self.tables() {
            applied += self.sync(&table)?.applied;
            applied += self.maintain(&table);
        }
        Ok(applied)
    }

    pub fn scan(&self, table: &str, range: &KeyRange) -> Result<RowScan, ReplicationError> {
        Ok(self.table(table)?.store.scan(range)?)
    }

    pub fn resume(&self, table: &str, cursor: ScanCursor) -> Result<RowScan, ReplicationError> {
        Ok(self.table(table)?.store.resume(cursor)?)
    }

    pub fn health(&self, table: &str) -> Result<ReplicaHealth, ReplicationError> {
        let t = self.table(table)?;
        let status = self.coord.status()?;
        let active_replica_count = self
            .coord
            .list(&t.paths.replicas())?
            .iter()
            .filter(|(path, value)| path.ends_with("/is_active") && value.as_slice() == b"1")
            .count();
        let head = t.log.head()?;
        let queue = t.lock_queue()?;
        let unpulled = usize::try_from(head.saturating_sub(queue.last_queued())).unwrap_or(usize::MAX);
        Ok(ReplicaHealth {
            table: t.name.clone(),
            replica: self.identity.replica.clone(),
            is_leader: status.role == Role::Leader,
            active_replica_count,
            queue_size: queue.len().saturating_add(unpulled),
            lag: head.saturating_sub(queue.last_applied()),
            last_applied_seq: queue.last_applied(),
            failed_entries: queue.failed().cloned().into_iter().collect(),
            queue_state: queue.state(),
            lagging_coordination: status.lagging,
            active_parts: t.store.active_parts(None).len(),
            rows: t.store.row_count(),
        })
    }

    /// Announces the removal of every active part of `partition`.
    pub fn drop_partition(&self, table: &str, partition: &str) -> Result<Vec<PartName>, ReplicationError> {
        let t = self.table(table)?;
        let parts = t.store.active_parts(Some(partition));
        for part in &parts {
            let seq = t.log.append(&LogEntry::new(
                self.identity.replica.as_str(),
                LogOp::DropPart { part: part.clone() },
            ))?;
            debug!(table, %part, seq, "part drop announced");
        }
        if !parts.is_empty() {
            info!(table, partition, parts = parts.len(), "partition dropped");
        }
        self.sync(table)?;
        Ok(parts)
    }

    /// Clears the failure of `table`'s queue and tries the entry again.
    pub fn retry_failed(&self, table: &str) -> Result<Option<u64>, ReplicationError> {
        let seq = self.table(table)?.lock_queue()?.retry_failed();
        if seq.is_some() {
            self.sync(table)?;
        }
        Ok(seq)
    }

    /// Drops the failed entry of `table`'s queue. The only way an entry is
    /// ever skipped.
    pub fn skip_failed(&self, table: &str) -> Result<Option<u64>, ReplicationError> {
        let seq = self.table(table)?.lock_queue()?.skip_failed()?;
        if seq.is_some() {
            self.sync(table)?;
        }
        Ok(seq)
    }

    /// Deletes outdated parts once every registered replica has applied
    /// everything this one has, so no peer still needs to fetch them.
    pub fn collect_garbage(&self, table: &str) -> Result<usize, ReplicationError> {
        let t = self.table(table)?;
        let applied = t.lock_queue()?.last_applied();
        let slowest = self
            .coord
            .list(&t.paths.replicas())?
            .into_iter()
            .filter(|(path, _)| path.ends_with("/log_pointer"))
            .map(|(_, value)| value.as_slice().try_into().map(u64::from_le_bytes).unwrap_or(0))
            .min()
            .unwrap_or(0);
        if slowest < applied {
            debug!(table, slowest, applied, "garbage collection deferred");
            return Ok(0);
        }
        Ok(t.store.collect_garbage()?)
    }

    /// Marks every table inactive and stops serving parts.
    pub fn shutdown(&self) {
        let tables: Vec<Arc<TableReplica>> = self
            .tables
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        for table in &tables {
            self.set_active(table, false);
        }
        self.exchange.withdraw(&self.identity.replica);
        info!(replica = %self.identity.replica, "replica shut down");
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("identity", &self.identity)
            .field("dir", &self.dir)
            .field("tables", &self.tables())
            .field("pool", &self.pool)
            .finish()
    }
}
