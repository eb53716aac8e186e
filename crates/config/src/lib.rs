//! # Config - Tidepool cluster configuration
//!
//! Plain, immutable configuration values. Every component receives the slice
//! of configuration it needs at construction time; nothing here is global.
//!
//! ## Environment variables
//!
//! [`ClusterConfig::from_env`] reads the following (all optional):
//!
//! ```text
//! TIDEPOOL_DATA_DIR         root data directory          (default: "data")
//! TIDEPOOL_REPLICAS         replicas in the local cluster (default: 3)
//! TIDEPOOL_SHARD            shard name                    (default: "01")
//! TIDEPOOL_GRANULE_ROWS     rows per granule              (default: 8192)
//! TIDEPOOL_MAX_BYTES        part store disk budget, 0=off (default: 0)
//! TIDEPOOL_FSYNC            fsync part files and raft log (default: "true")
//! TIDEPOOL_MAX_MERGE_ROWS   max rows in one merge         (default: 1048576)
//! TIDEPOOL_MAX_MERGE_PARTS  max parts in one merge        (default: 10)
//! TIDEPOOL_MIN_MERGE_PARTS  min active parts to merge     (default: 2)
//! TIDEPOOL_AUTO_MERGE_PARTS active parts that trigger a merge, 0=off (default: 8)
//! TIDEPOOL_ELECTION_TICKS   raft election timeout, ticks  (default: 10)
//! TIDEPOOL_HEARTBEAT_TICKS  raft heartbeat interval       (default: 3)
//! TIDEPOOL_SNAPSHOT_EVERY   applied entries per snapshot  (default: 1000)
//! TIDEPOOL_FETCH_ATTEMPTS   fetch attempts before failing (default: 5)
//! TIDEPOOL_BACKOFF_MS       base retry backoff in ms      (default: 100)
//! TIDEPOOL_MERGE_WORKERS    merge worker threads          (default: 2)
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Default number of rows per granule.
pub const DEFAULT_GRANULE_ROWS: usize = 8192;

/// Default coordination path template for a replicated table.
pub const DEFAULT_TABLE_PATH: &str = "/tables/{shard}/{table}";

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Identity of one replica: which shard it serves and its own name.
///
/// Passed explicitly into every component that builds coordination paths,
/// so two replicas in the same process never share identity state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaIdentity {
    pub shard: String,
    pub replica: String,
    /// Id of the consensus node embedded in this replica's process.
    pub node_id: u64,
}

impl ReplicaIdentity {
    pub fn new(shard: impl Into<String>, replica: impl Into<String>, node_id: u64) -> Self {
        Self {
            shard: shard.into(),
            replica: replica.into(),
            node_id,
        }
    }

    /// Substitutes `{shard}`, `{replica}` and `{table}` in `template`.
    ///
    /// ```
    /// use config::ReplicaIdentity;
    ///
    /// let id = ReplicaIdentity::new("01", "r2", 2);
    /// assert_eq!(id.expand("/tables/{shard}/{table}/replicas/{replica}", "hits"),
    ///            "/tables/01/hits/replicas/r2");
    /// ```
    #[must_use]
    pub fn expand(&self, template: &str, table: &str) -> String {
        template
            .replace("{shard}", &self.shard)
            .replace("{replica}", &self.replica)
            .replace("{table}", table)
    }
}

/// Part store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rows per granule for newly written parts.
    pub granule_rows: usize,
    /// Disk budget for one replica's part store, in bytes. `0` disables the check.
    pub max_bytes: u64,
    /// If `true`, part files and directories are fsynced before they become visible.
    pub fsync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            granule_rows: DEFAULT_GRANULE_ROWS,
            max_bytes: 0,
            fsync: true,
        }
    }
}

/// Merge candidate selection thresholds.
///
/// These are tunable policy, not part of the replication protocol: replicas
/// never need to agree on them because merge decisions travel through the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePolicy {
    /// Upper bound on the combined row count of one merge.
    pub max_merge_rows: u64,
    /// Upper bound on the number of parts in one merge.
    pub max_parts_per_merge: usize,
    /// Partitions with fewer active parts than this are left alone.
    pub min_parts_to_merge: usize,
    /// Active parts in one partition that make the leader merge on its own
    /// after an insert or sync. `0` leaves merging to explicit calls.
    pub auto_merge_parts: usize,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            max_merge_rows: 1 << 20,
            max_parts_per_merge: 10,
            min_parts_to_merge: 2,
            auto_merge_parts: 8,
        }
    }
}

/// Raft timing and persistence settings for one consensus node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusConfig {
    /// Base election timeout in ticks. The effective timeout is drawn
    /// uniformly from `[election_ticks, 2 * election_ticks)`.
    pub election_ticks: u32,
    /// Leader heartbeat interval in ticks. Must be below `election_ticks`.
    pub heartbeat_ticks: u32,
    /// Take a state machine snapshot every N applied entries.
    pub snapshot_every: u64,
    /// Changes kept in memory for watchers.
    pub retained_changes: usize,
    /// Maximum entries carried by one append message.
    pub max_entries_per_message: usize,
    /// Seed for election jitter; each node mixes in its own id.
    pub seed: u64,
    /// fsync the raft log on every append.
    pub fsync: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_ticks: 10,
            heartbeat_ticks: 3,
            snapshot_every: 1000,
            retained_changes: 10_000,
            max_entries_per_message: 256,
            seed: 0x7469_6465,
            fsync: true,
        }
    }
}

/// Replication queue and fetch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Attempts for one log entry before it is marked failed.
    pub max_attempts: u32,
    /// First retry delay; doubled on every further attempt.
    pub backoff_base: Duration,
    /// Ceiling for the retry delay.
    pub backoff_max: Duration,
    /// Coordination path template for tables (see [`ReplicaIdentity::expand`]).
    pub table_path: String,
    /// Worker threads in the background merge pool.
    pub merge_workers: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
            table_path: DEFAULT_TABLE_PATH.to_string(),
            merge_workers: 2,
        }
    }
}

/// Everything needed to start a local cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub data_dir: PathBuf,
    pub shard: String,
    pub replicas: usize,
    pub engine: EngineConfig,
    pub merge: MergePolicy,
    pub consensus: ConsensusConfig,
    pub replication: ReplicationConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            shard: "01".to_string(),
            replicas: 3,
            engine: EngineConfig::default(),
            merge: MergePolicy::default(),
            consensus: ConsensusConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Builds a configuration from `TIDEPOOL_*` environment variables.
    ///
    /// Unparseable values fall back to the default for that setting.
    pub fn from_env() -> Self {
        let d = Self::default();
        let engine = EngineConfig {
            granule_rows: env_or("TIDEPOOL_GRANULE_ROWS", "8192")
                .parse()
                .unwrap_or(d.engine.granule_rows),
            max_bytes: env_or("TIDEPOOL_MAX_BYTES", "0").parse().unwrap_or(0),
            fsync: env_or("TIDEPOOL_FSYNC", "true").parse().unwrap_or(true),
        };
        let merge = MergePolicy {
            max_merge_rows: env_or("TIDEPOOL_MAX_MERGE_ROWS", "1048576")
                .parse()
                .unwrap_or(d.merge.max_merge_rows),
            max_parts_per_merge: env_or("TIDEPOOL_MAX_MERGE_PARTS", "10")
                .parse()
                .unwrap_or(d.merge.max_parts_per_merge),
            min_parts_to_merge: env_or("TIDEPOOL_MIN_MERGE_PARTS", "2")
                .parse()
                .unwrap_or(d.merge.min_parts_to_merge),
            auto_merge_parts: env_or("TIDEPOOL_AUTO_MERGE_PARTS", "8")
                .parse()
                .unwrap_or(d.merge.auto_merge_parts),
        };
        let consensus = ConsensusConfig {
            election_ticks: env_or("TIDEPOOL_ELECTION_TICKS", "10")
                .parse()
                .unwrap_or(d.consensus.election_ticks),
            heartbeat_ticks: env_or("TIDEPOOL_HEARTBEAT_TICKS", "3")
                .parse()
                .unwrap_or(d.consensus.heartbeat_ticks),
            snapshot_every: env_or("TIDEPOOL_SNAPSHOT_EVERY", "1000")
                .parse()
                .unwrap_or(d.consensus.snapshot_every),
            fsync: engine.fsync,
            ..d.consensus
        };
        let backoff_ms: u64 = env_or("TIDEPOOL_BACKOFF_MS", "100").parse().unwrap_or(100);
        let replication = ReplicationConfig {
            max_attempts: env_or("TIDEPOOL_FETCH_ATTEMPTS", "5")
                .parse()
                .unwrap_or(d.replication.max_attempts),
            backoff_base: Duration::from_millis(backoff_ms),
            merge_workers: env_or("TIDEPOOL_MERGE_WORKERS", "2")
                .parse()
                .unwrap_or(d.replication.merge_workers),
            ..d.replication
        };

        Self {
            data_dir: PathBuf::from(env_or("TIDEPOOL_DATA_DIR", "data")),
            shard: env_or("TIDEPOOL_SHARD", "01"),
            replicas: env_or("TIDEPOOL_REPLICAS", "3").parse().unwrap_or(3),
            engine,
            merge,
            consensus,
            replication,
        }
    }

    /// Identity of the `n`-th replica (1-based), co-located with consensus node `n`.
    #[must_use]
    pub fn identity(&self, n: u64) -> ReplicaIdentity {
        ReplicaIdentity::new(self.shard.clone(), format!("r{}", n), n)
    }

    /// A configuration suited to tests: small granules, no fsync, no backoff delay.
    #[must_use]
    pub fn for_tests(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            engine: EngineConfig {
                granule_rows: 4,
                max_bytes: 0,
                fsync: false,
            },
            consensus: ConsensusConfig {
                fsync: false,
                ..ConsensusConfig::default()
            },
            replication: ReplicationConfig {
                max_attempts: 3,
                backoff_base: Duration::ZERO,
                backoff_max: Duration::ZERO,
                ..ReplicationConfig::default()
            },
            ..Self::default()
        }
    }
}
