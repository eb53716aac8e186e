use super::*;
use crate::{PartState, StoreError};
use anyhow::Result;
use config::EngineConfig;
use part::PartName;
use rows::{row, Column, PartitionBy, TableDef};
use tempfile::tempdir;

#[test]
fn add_part_is_prepared_until_activated() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;

    let meta = store.add_part(kv_rows(&[(1, 10), (2, 20)]), 1)?;
    assert_eq!(meta.name, PartName::new("all", 1));
    assert_eq!(meta.rows, 2);
    assert_eq!(store.part_state(&meta.name), Some(PartState::Prepared));
    assert_eq!(store.row_count(), 0);

    store.activate(&meta.name)?;
    assert_eq!(store.part_state(&meta.name), Some(PartState::Active));
    assert_eq!(store.read_all()?, kv_rows(&[(1, 10), (2, 20)]));
    Ok(())
}

#[test]
fn activate_twice_is_noop() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    let name = insert_active(&store, 1, &[(1, 1)])?;
    store.activate(&name)?;
    assert_eq!(store.active_parts(None), vec![name]);
    Ok(())
}

#[test]
fn activate_unknown_part_fails() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    let err = store.activate(&PartName::new("all", 9)).unwrap_err();
    assert!(matches!(StoreError::find(&err), Some(StoreError::PartNotFound(_))));
    Ok(())
}

#[test]
fn unsorted_rows_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    let err = store.add_part(kv_rows(&[(2, 0), (1, 0)]), 1).unwrap_err();
    assert!(matches!(StoreError::find(&err), Some(StoreError::UnsortedInput)));
    assert!(store.parts()?.is_empty());
    Ok(())
}

#[test]
fn duplicate_keys_are_accepted() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    insert_active(&store, 1, &[(1, 1), (1, 2), (2, 0)])?;
    assert_eq!(store.row_count(), 3);
    Ok(())
}

#[test]
fn empty_batch_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    assert!(store.add_part(Vec::new(), 1).is_err());
    Ok(())
}

#[test]
fn rows_from_two_partitions_rejected() -> Result<()> {
    let dir = tempdir()?;
    let def = TableDef::new("ev", vec![Column::int("day"), Column::int("v")])
        .with_partition(PartitionBy::Column("day".into()));
    let store = PartStore::open(dir.path(), &def, test_config())?;
    assert!(store.add_part(vec![row![1, 0], row![2, 0]], 1).is_err());

    let meta = store.add_part(vec![row![2, 0], row![2, 1]], 1)?;
    assert_eq!(meta.name.partition, "2");
    Ok(())
}

#[test]
fn existing_part_name_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    store.add_part(kv_rows(&[(1, 1)]), 1)?;
    assert!(store.add_part(kv_rows(&[(2, 2)]), 1).is_err());
    Ok(())
}

#[test]
fn budget_exceeded_is_resource_exhausted() -> Result<()> {
    let dir = tempdir()?;
    let config = EngineConfig {
        max_bytes: 64,
        ..test_config()
    };
    let store = PartStore::open(dir.path(), &kv_table(), config)?;
    let pairs: Vec<(i64, i64)> = (0..32).map(|i| (i, i)).collect();
    let err = store.add_part(kv_rows(&pairs), 1).unwrap_err();
    assert!(StoreError::is_resource_exhausted(&err));
    assert!(store.parts()?.is_empty());
    Ok(())
}

#[test]
fn export_import_between_stores() -> Result<()> {
    let dir = tempdir()?;
    let a = open_kv(&dir.path().join("a"))?;
    let b = open_kv(&dir.path().join("b"))?;

    let meta = a.add_part(kv_rows(&[(1, 1), (5, 5), (9, 9)]), 3)?;
    let bytes = a.export_part(&meta.name)?;

    let imported = b.import_part(&bytes, &meta.name, meta.checksum)?;
    assert_eq!(imported.checksum, meta.checksum);
    assert_eq!(b.part_state(&meta.name), Some(PartState::Prepared));
    b.activate(&meta.name)?;
    assert_eq!(b.read_all()?, kv_rows(&[(1, 1), (5, 5), (9, 9)]));

    // Importing again is a no-op.
    b.import_part(&bytes, &meta.name, meta.checksum)?;
    assert_eq!(b.part_state(&meta.name), Some(PartState::Active));
    Ok(())
}

#[test]
fn import_with_wrong_checksum_fails() -> Result<()> {
    let dir = tempdir()?;
    let a = open_kv(&dir.path().join("a"))?;
    let b = open_kv(&dir.path().join("b"))?;
    let meta = a.add_part(kv_rows(&[(1, 1)]), 1)?;
    let bytes = a.export_part(&meta.name)?;

    let err = b.import_part(&bytes, &meta.name, meta.checksum ^ 1).unwrap_err();
    assert!(StoreError::is_checksum_mismatch(&err));
    assert_eq!(b.part_state(&meta.name), None);
    Ok(())
}

#[test]
fn discard_prepared_only_touches_prepared() -> Result<()> {
    let dir = tempdir()?;
    let store = open_kv(dir.path())?;
    let prepared = store.add_part(kv_rows(&[(1, 1)]), 1)?.name;
    let active = insert_active(&store, 2, &[(2, 2)])?;

    assert!(store.discard_prepared(&prepared)?);
    assert!(!store.discard_prepared(&active)?);
    assert_eq!(store.part_state(&prepared), None);
    assert!(!prepared.dir_in(store.table_dir()).exists());
    Ok(())
}

#[test]
fn set_def_persists_and_rejects_key_changes() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = open_kv(dir.path())?;
        let next = kv_table().with_granule_rows(2);
        store.set_def(&next)?;

        let bad = kv_table().with_sort_key(&["v"]);
        assert!(store.set_def(&bad).is_err());
    }
    let store = open_kv(dir.path())?;
    assert_eq!(store.def().granule_rows, 2);
    Ok(())
}
