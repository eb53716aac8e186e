mod merge_tests;
mod reader_tests;

use rows::{Column, Row, TableDef};

/// `(k, v)` table sorted by `k`, granules of 4 rows.
pub(crate) fn kv_table() -> TableDef {
    TableDef::new("kv", vec![Column::int("k"), Column::int("v")]).with_granule_rows(4)
}

pub(crate) fn kv_rows(pairs: &[(i64, i64)]) -> Vec<Row> {
    pairs.iter().map(|&(k, v)| rows::row![k, v]).collect()
}
