use super::{kv_rows, kv_table};
use crate::*;
use anyhow::Result;
use rows::{row, Column, ResolvedTransform, Row, TableDef, Transform, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn write_open(dir: &Path, def: &TableDef, block: u64, rows: Vec<Row>) -> Result<Arc<PartReader>> {
    let meta = write_part(dir, PartName::new("all", block), def, rows, false)?;
    Ok(Arc::new(PartReader::open(&meta.name.dir_in(dir))?))
}

fn merged_rows(dir: &Path, def: &TableDef, inputs: &[Arc<PartReader>]) -> Result<Vec<Row>> {
    let meta = merge_parts(dir, inputs, def, false)?;
    PartReader::open(&meta.name.dir_in(dir))?.read_all()
}

// -------------------- MergeIterator --------------------

#[test]
fn merge_interleaves_by_key() -> Result<()> {
    let key = kv_table().sort_key()?;
    let a: Vec<Result<Row>> = kv_rows(&[(1, 0), (4, 0)]).into_iter().map(Ok).collect();
    let b: Vec<Result<Row>> = kv_rows(&[(2, 0), (3, 0), (5, 0)]).into_iter().map(Ok).collect();
    let merged: Vec<Row> = MergeIterator::new(vec![a.into_iter(), b.into_iter()], key)?
        .collect::<Result<_>>()?;
    let keys: Vec<i64> = merged.iter().filter_map(|r| r[0].as_int()).collect();
    assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn merge_ties_follow_source_order() -> Result<()> {
    let key = kv_table().sort_key()?;
    let a: Vec<Result<Row>> = kv_rows(&[(1, 10), (1, 11)]).into_iter().map(Ok).collect();
    let b: Vec<Result<Row>> = kv_rows(&[(1, 20)]).into_iter().map(Ok).collect();
    let merged: Vec<Row> = MergeIterator::new(vec![b.into_iter(), a.into_iter()], key)?
        .collect::<Result<_>>()?;
    let vals: Vec<i64> = merged.iter().filter_map(|r| r[1].as_int()).collect();
    assert_eq!(vals, vec![20, 10, 11]);
    Ok(())
}

// -------------------- Transforms --------------------

#[test]
fn plain_merge_keeps_every_row() -> Result<()> {
    let dir = tempdir()?;
    let def = kv_table();
    let p1 = write_open(dir.path(), &def, 1, kv_rows(&[(1, 1), (3, 3)]))?;
    let p2 = write_open(dir.path(), &def, 2, kv_rows(&[(1, 2), (2, 2)]))?;
    let out = merged_rows(dir.path(), &def, &[p1, p2])?;
    assert_eq!(out, kv_rows(&[(1, 1), (1, 2), (2, 2), (3, 3)]));
    Ok(())
}

#[test]
fn dedup_keeps_highest_version() -> Result<()> {
    let dir = tempdir()?;
    let def = TableDef::new("d", vec![Column::int("k"), Column::int("ver"), Column::string("val")])
        .with_transform(Transform::Dedup {
            version: "ver".into(),
        });
    let p1 = write_open(dir.path(), &def, 1, vec![row![1, 1, "v1"], row![2, 5, "keep"]])?;
    let p2 = write_open(dir.path(), &def, 2, vec![row![1, 2, "v2"], row![2, 3, "old"]])?;
    let out = merged_rows(dir.path(), &def, &[p1, p2])?;
    assert_eq!(out, vec![row![1, 2, "v2"], row![2, 5, "keep"]]);
    Ok(())
}

#[test]
fn dedup_version_tie_prefers_later_row() {
    let t = ResolvedTransform::Dedup { version: 1 };
    let out = fold_run(&t, vec![row![1, 7, "first"], row![1, 7, "second"]]);
    assert_eq!(out, vec![row![1, 7, "second"]]);
}

#[test]
fn sum_adds_columns_and_keeps_first_for_others() -> Result<()> {
    let dir = tempdir()?;
    let def = TableDef::new("s", vec![Column::int("k"), Column::string("tag"), Column::int("n")])
        .with_transform(Transform::Sum {
            columns: vec!["n".into()],
        });
    let p1 = write_open(dir.path(), &def, 1, vec![row![1, "a", 5], row![2, "x", 1]])?;
    let p2 = write_open(dir.path(), &def, 2, vec![row![1, "b", 7]])?;
    let out = merged_rows(dir.path(), &def, &[p1, p2])?;
    assert_eq!(out, vec![row![1, "a", 12], row![2, "x", 1]]);
    Ok(())
}

#[test]
fn sum_wraps_on_overflow_and_keeps_zero_rows() {
    let t = ResolvedTransform::Sum { columns: vec![1] };
    assert_eq!(fold_run(&t, vec![row![1, i64::MAX], row![1, 1]]), vec![row![1, i64::MIN]]);
    assert_eq!(fold_run(&t, vec![row![1, 3], row![1, -3]]), vec![row![1, 0]]);
}

#[test]
fn collapse_cancels_pairs_and_keeps_unmatched() -> Result<()> {
    let dir = tempdir()?;
    let def = TableDef::new("c", vec![Column::int("k"), Column::int("sign"), Column::int("v")])
        .with_transform(Transform::Collapse {
            sign: "sign".into(),
        });
    let p1 = write_open(dir.path(), &def, 1, vec![row![1, 1, 100], row![2, 1, 200]])?;
    let p2 = write_open(dir.path(), &def, 2, vec![row![1, -1, 100], row![3, -1, 300]])?;
    let out = merged_rows(dir.path(), &def, &[p1, p2])?;
    assert_eq!(out, vec![row![2, 1, 200], row![3, -1, 300]]);
    Ok(())
}

#[test]
fn collapse_cancels_most_recent_opposite() {
    let t = ResolvedTransform::Collapse { sign: 1 };
    let out = fold_run(
        &t,
        vec![row![1, 1, "a"], row![1, 1, "b"], row![1, -1, "x"], row![1, -1, "y"], row![1, -1, "z"]],
    );
    assert_eq!(out, vec![row![1, -1, "z"]]);

    let out = fold_run(&t, vec![row![1, 1, "a"], row![1, 1, "b"], row![1, -1, "x"]]);
    assert_eq!(out, vec![row![1, 1, "a"]]);
}

#[test]
fn collapse_to_nothing_writes_empty_part() -> Result<()> {
    let dir = tempdir()?;
    let def = TableDef::new("c", vec![Column::int("k"), Column::int("sign")]).with_transform(
        Transform::Collapse {
            sign: "sign".into(),
        },
    );
    let p1 = write_open(dir.path(), &def, 1, vec![row![1, 1]])?;
    let p2 = write_open(dir.path(), &def, 2, vec![row![1, -1]])?;
    let meta = merge_parts(dir.path(), &[p1, p2], &def, false)?;
    assert_eq!(meta.rows, 0);
    assert_eq!(meta.name.to_string(), "all_1_2_1");
    Ok(())
}

#[test]
fn merge_is_deterministic_across_directories() -> Result<()> {
    let def = TableDef::new("d", vec![Column::int("k"), Column::int("ver")]).with_transform(
        Transform::Dedup {
            version: "ver".into(),
        },
    );
    let make = |dir: &Path| -> Result<PartMeta> {
        let mut inputs = Vec::new();
        for block in 1..=3u64 {
            let mut rows: Vec<Row> = (0..20i64).map(|i| row![i % 7, block as i64 * 100 + i]).collect();
            def.sort_key()?.sort(&mut rows);
            inputs.push(write_open(dir, &def, block, rows)?);
        }
        merge_parts(dir, &inputs, &def, false)
    };
    let a = tempdir()?;
    let b = tempdir()?;
    let ma = make(a.path())?;
    let mb = make(b.path())?;
    assert_eq!(ma.name, mb.name);
    assert_eq!(ma.checksum, mb.checksum);
    assert_eq!(ma.rows, 7);
    Ok(())
}

#[test]
fn merged_output_is_sorted() -> Result<()> {
    let dir = tempdir()?;
    let def = kv_table();
    let p1 = write_open(dir.path(), &def, 1, kv_rows(&[(5, 0), (6, 0), (9, 0)]))?;
    let p2 = write_open(dir.path(), &def, 2, kv_rows(&[(0, 0), (7, 0)]))?;
    let p3 = write_open(dir.path(), &def, 3, kv_rows(&[(3, 0)]))?;
    let out = merged_rows(dir.path(), &def, &[p1, p2, p3])?;
    assert!(def.sort_key()?.is_sorted(&out));
    assert_eq!(out.len(), 6);
    assert_eq!(out[0][0], Value::Int(0));
    Ok(())
}
