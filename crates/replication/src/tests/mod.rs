mod entry_tests;
mod exchange_tests;

use anyhow::Result;
use config::{EngineConfig, ReplicaIdentity, ReplicationConfig, DEFAULT_TABLE_PATH};
use consensus::{Coordination, LocalNetwork};
use engine::PartStore;
use rows::{Column, Row, TableDef};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::paths::TablePaths;

pub(crate) fn identity(replica: &str) -> ReplicaIdentity {
    ReplicaIdentity::new("01", replica, 1)
}

pub(crate) fn paths(table: &str) -> TablePaths {
    TablePaths::new(&identity("r1"), DEFAULT_TABLE_PATH, table)
}

pub(crate) fn replication_config() -> ReplicationConfig {
    ReplicationConfig {
        max_attempts: 3,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
        ..ReplicationConfig::default()
    }
}

/// A one-node consensus group; it elects itself.
pub(crate) fn single_node(dir: &Path) -> Result<(LocalNetwork, Arc<dyn Coordination>)> {
    let net = LocalNetwork::start(
        dir,
        1,
        config::ConsensusConfig {
            fsync: false,
            ..config::ConsensusConfig::default()
        },
    )?;
    let coord: Arc<dyn Coordination> = Arc::new(net.handle(1));
    Ok((net, coord))
}

pub(crate) fn kv_table() -> TableDef {
    TableDef::new("kv", vec![Column::int("k"), Column::int("v")]).with_granule_rows(4)
}

pub(crate) fn kv_rows(pairs: &[(i64, i64)]) -> Vec<Row> {
    pairs.iter().map(|&(k, v)| rows::row![k, v]).collect()
}

pub(crate) fn open_store(dir: &Path) -> Result<PartStore> {
    PartStore::open(
        dir,
        &kv_table(),
        EngineConfig {
            granule_rows: 4,
            max_bytes: 0,
            fsync: false,
        },
    )
}
