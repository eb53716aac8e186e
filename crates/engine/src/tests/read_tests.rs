use super::*;
use anyhow::Result;
use part::PartName;
use rows::{row, Column, KeyRange, PartitionBy, TableDef, Value};
use tempfile::tempdir;

fn keys(rows: &[rows::Row]) -> Vec<i64> {
    rows.iter().filter_map(|r| r[0].as_int()).collect()
}

#[test]
fn scan_merges_parts_in_key_order() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    insert_active(&store, 1, &[(1, 0), (4, 0), (7, 0)])?;
    insert_active(&store, 2, &[(2, 0), (5, 0), (8, 0)])?;
    insert_active(&store, 3, &[(3, 0), (6, 0), (9, 0)])?;

    let all: Vec<_> = store.scan(&KeyRange::all())?.collect::<Result<_>>()?;
    assert_eq!(keys(&all), (1..=9).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn equal_keys_come_out_in_block_order() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    insert_active(&store, 2, &[(1, 20)])?;
    insert_active(&store, 1, &[(1, 10)])?;
    assert_eq!(store.read_all()?, kv_rows(&[(1, 10), (1, 20)]));
    Ok(())
}

#[test]
fn range_bounds_are_respected() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    let pairs: Vec<(i64, i64)> = (0..20).map(|i| (i, i * 10)).collect();
    insert_active(&store, 1, &pairs)?;

    let between: Vec<_> = store
        .scan(&KeyRange::between(vec![Value::Int(5)], vec![Value::Int(8)]))?
        .collect::<Result<_>>()?;
    assert_eq!(keys(&between), vec![5, 6, 7, 8]);

    let until: Vec<_> = store.scan(&KeyRange::until(vec![Value::Int(3)]))?.collect::<Result<_>>()?;
    assert_eq!(keys(&until), vec![0, 1, 2]);

    let from: Vec<_> = store.scan(&KeyRange::from(vec![Value::Int(18)]))?.collect::<Result<_>>()?;
    assert_eq!(keys(&from), vec![18, 19]);

    let empty: Vec<_> = store
        .scan(&KeyRange::between(vec![Value::Int(100)], vec![Value::Int(200)]))?
        .collect::<Result<_>>()?;
    assert!(empty.is_empty());
    Ok(())
}

#[test]
fn selective_range_reads_fewer_granules() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    // 40 rows in granules of 4: 10 granules.
    let pairs: Vec<(i64, i64)> = (0..40).map(|i| (i, i)).collect();
    insert_active(&store, 1, &pairs)?;
    let total = store.snapshot().parts()[0].granule_count();
    assert_eq!(total, 10);

    let mut scan = store.scan(&KeyRange::between(vec![Value::Int(13)], vec![Value::Int(14)]))?;
    let got: Vec<_> = scan.by_ref().collect::<Result<_>>()?;
    assert_eq!(keys(&got), vec![13, 14]);
    assert!(scan.granules_read() < total);
    assert_eq!(scan.granules_read(), 1);
    drop(scan);
    assert_eq!(store.granules_read(), 1);
    Ok(())
}

#[test]
fn prefix_range_on_compound_key() -> Result<()> {
    let dir = tempdir()?;
    let def = TableDef::new(
        "hits",
        vec![Column::string("site"), Column::int("ts"), Column::int("n")],
    )
    .with_sort_key(&["site", "ts"])
    .with_granule_rows(2);
    let store = PartStore::open(dir.path(), &def, test_config())?;
    let meta = store.add_part(
        vec![
            row!["a", 1, 1],
            row!["a", 2, 1],
            row!["b", 1, 1],
            row!["b", 5, 1],
            row!["c", 3, 1],
        ],
        1,
    )?;
    store.activate(&meta.name)?;

    let got: Vec<_> = store
        .scan(&KeyRange::prefix(vec![Value::from("b")]))?
        .collect::<Result<_>>()?;
    assert_eq!(got, vec![row!["b", 1, 1], row!["b", 5, 1]]);
    Ok(())
}

#[test]
fn scan_only_sees_active_parts() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    insert_active(&store, 1, &[(1, 1)])?;
    store.add_part(kv_rows(&[(2, 2)]), 2)?;
    assert_eq!(store.read_all()?, kv_rows(&[(1, 1)]));
    Ok(())
}

#[test]
fn scan_keeps_its_snapshot_across_a_merge() -> Result<()> {
    let dir = tempdir()?;
    let store = PartStore::open(
        dir.path(),
        &kv_table_with(rows::Transform::Dedup { version: "v".into() }),
        test_config(),
    )?;
    let a = insert_active(&store, 1, &[(1, 1), (2, 1)])?;
    let b = insert_active(&store, 2, &[(1, 2), (2, 2)])?;

    let scan = store.scan(&KeyRange::all())?;
    let out = store.prepare_merge(&[a.clone(), b.clone()])?;
    store.commit_merge(&[a.clone(), b.clone()], &out.name)?;
    // The old parts are pinned by the scan and survive garbage collection.
    assert_eq!(store.collect_garbage()?, 0);

    let rows: Vec<_> = scan.collect::<Result<_>>()?;
    assert_eq!(rows.len(), 4);
    assert_eq!(store.read_all()?, kv_rows(&[(1, 2), (2, 2)]));
    assert_eq!(store.collect_garbage()?, 2);
    assert!(!a.dir_in(store.table_dir()).exists());
    Ok(())
}

#[test]
fn resume_continues_without_repeating_rows() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    insert_active(&store, 1, &[(1, 0), (2, 0), (2, 1), (3, 0)])?;
    insert_active(&store, 2, &[(2, 2), (4, 0)])?;
    let expected = store.read_all()?;

    let mut scan = store.scan(&KeyRange::all())?;
    let mut got = Vec::new();
    for _ in 0..3 {
        got.push(scan.next().transpose()?.unwrap_or_default());
    }
    let cursor = scan.cursor();
    drop(scan);
    assert_eq!(cursor.last_key(), Some(&[Value::Int(2)][..]));

    // Writes after the cursor was taken are invisible to the resumed scan.
    insert_active(&store, 3, &[(2, 9)])?;

    let rest: Vec<_> = store.resume(cursor)?.collect::<Result<_>>()?;
    got.extend(rest);
    assert_eq!(got, expected);
    Ok(())
}

#[test]
fn resume_from_untouched_cursor_restarts() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    insert_active(&store, 1, &[(1, 0), (2, 0)])?;
    let scan = store.scan(&KeyRange::all())?;
    let cursor = scan.cursor();
    drop(scan);
    let rows: Vec<_> = store.resume(cursor)?.collect::<Result<_>>()?;
    assert_eq!(rows, kv_rows(&[(1, 0), (2, 0)]));
    Ok(())
}

#[test]
fn active_parts_filters_by_partition() -> Result<()> {
    let dir = tempdir()?;
    let def = TableDef::new("ev", vec![Column::int("day"), Column::int("v")])
        .with_partition(PartitionBy::Column("day".into()));
    let store = PartStore::open(dir.path(), &def, test_config())?;
    for (block, day) in [(1u64, 1i64), (2, 2), (3, 1)] {
        let meta = store.add_part(vec![row![day, 0]], block)?;
        store.activate(&meta.name)?;
    }
    assert_eq!(
        store.active_parts(Some("1")),
        vec![PartName::new("1", 1), PartName::new("1", 3)]
    );
    assert_eq!(store.active_parts(None).len(), 3);
    assert_eq!(store.row_count(), 3);
    Ok(())
}
