#![allow(dead_code)]

use anyhow::{Context, Result};
use config::ClusterConfig;
use replication::{LocalCluster, Replica};
use rows::{Column, Row, TableDef};
use std::path::Path;

pub fn start(dir: &Path) -> Result<LocalCluster> {
    Ok(LocalCluster::start(ClusterConfig::for_tests(dir))?)
}

/// `(k, v)` table sorted by `k`, 4-row granules.
pub fn kv_table(name: &str) -> TableDef {
    TableDef::new(name, vec![Column::int("k"), Column::int("v")]).with_granule_rows(4)
}

pub fn kv_rows(pairs: &[(i64, i64)]) -> Vec<Row> {
    pairs.iter().map(|&(k, v)| rows::row![k, v]).collect()
}

pub fn replica(cluster: &LocalCluster, n: u64) -> Result<&Replica> {
    cluster.replica(n).with_context(|| format!("replica {} is not running", n))
}

pub fn leader(cluster: &LocalCluster) -> Result<&Replica> {
    cluster.network().settle()?;
    cluster.leader().context("no leader")
}

/// Creates `def` and waits until every running replica attached it.
pub fn create(cluster: &LocalCluster, def: &TableDef) -> Result<()> {
    replica(cluster, 1)?.create_table(def)?;
    cluster.sync_all()?;
    Ok(())
}

pub fn all_rows(replica: &Replica, table: &str) -> Result<Vec<Row>> {
    replica.store(table)?.read_all()
}

/// Active part names with their checksums.
pub fn fingerprint(replica: &Replica, table: &str) -> Result<Vec<(String, u32)>> {
    let store = replica.store(table)?;
    store
        .active_parts(None)
        .into_iter()
        .map(|p| Ok((p.to_string(), store.part_checksum(&p)?)))
        .collect()
}

/// Asserts that every running replica has an empty queue and sees `active`
/// active replicas, and that they then all hold the same number of rows.
/// Returns that number.
pub fn assert_converged(cluster: &LocalCluster, table: &str, active: usize) -> Result<u64> {
    let mut rows = None;
    for r in cluster.replicas() {
        let health = r.health(table)?;
        assert_eq!(health.queue_size, 0, "{} has a backlog", health.replica);
        assert_eq!(health.active_replica_count, active, "as seen by {}", health.replica);
        let expected = *rows.get_or_insert(health.rows);
        assert_eq!(health.rows, expected, "{} disagrees on the row count", health.replica);
    }
    Ok(rows.unwrap_or(0))
}
