mod read_tests;
mod write_tests;

use crate::PartStore;
use anyhow::Result;
use config::EngineConfig;
use rows::{Column, Row, TableDef, Transform};
use std::path::Path;

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        granule_rows: 4,
        max_bytes: 0,
        fsync: false,
    }
}

/// `(k, v)` table sorted by `k`, granules of 4 rows.
pub(crate) fn kv_table() -> TableDef {
    TableDef::new("kv", vec![Column::int("k"), Column::int("v")]).with_granule_rows(4)
}

pub(crate) fn kv_table_with(transform: Transform) -> TableDef {
    kv_table().with_transform(transform)
}

pub(crate) fn kv_rows(pairs: &[(i64, i64)]) -> Vec<Row> {
    pairs.iter().map(|&(k, v)| rows::row![k, v]).collect()
}

pub(crate) fn open_kv(dir: &Path) -> Result<PartStore> {
    PartStore::open(dir, &kv_table(), test_config())
}

/// Writes and activates one part per block.
pub(crate) fn insert_active(store: &PartStore, block: u64, pairs: &[(i64, i64)]) -> Result<part::PartName> {
    let meta = store.add_part(kv_rows(pairs), block)?;
    store.activate(&meta.name)?;
    Ok(meta.name)
}
