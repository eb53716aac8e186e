use super::{kv_rows, kv_table};
use crate::format::DATA_FILE;
use crate::*;
use anyhow::Result;
use rows::{KeyRange, Value};
use std::sync::Arc;
use tempfile::tempdir;

fn hundred(dir: &std::path::Path) -> Result<Arc<PartReader>> {
    let rows: Vec<(i64, i64)> = (0..100).map(|i| (i, i * 2)).collect();
    write_part(dir, PartName::new("all", 1), &kv_table(), kv_rows(&rows), false)?;
    Ok(Arc::new(PartReader::open(&dir.join("all").join("all_1_1_0"))?))
}

#[test]
fn open_reads_metadata() -> Result<()> {
    let dir = tempdir()?;
    let part = hundred(dir.path())?;
    assert_eq!(part.name().to_string(), "all_1_1_0");
    assert_eq!(part.rows(), 100);
    assert_eq!(part.granule_count(), 25);
    assert!(part.bytes() > 0);
    part.verify()?;
    Ok(())
}

#[test]
fn read_all_returns_rows_in_order() -> Result<()> {
    let dir = tempdir()?;
    let part = hundred(dir.path())?;
    let rows = part.read_all()?;
    assert_eq!(rows.len(), 100);
    assert_eq!(rows[42], rows::row![42, 84]);
    Ok(())
}

#[test]
fn cursor_reads_only_matching_granules() -> Result<()> {
    let dir = tempdir()?;
    let part = hundred(dir.path())?;
    let key = kv_table().sort_key()?;

    let mut cursor = part.cursor(&KeyRange::between(vec![Value::Int(10)], vec![Value::Int(13)]), &key);
    let rows: Vec<_> = cursor.by_ref().collect::<Result<_>>()?;
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0][0], Value::Int(10));
    assert!(cursor.granules_read() <= 2);

    let mut full = part.cursor(&KeyRange::all(), &key);
    assert_eq!(full.by_ref().count(), 100);
    assert_eq!(full.granules_read(), 25);
    Ok(())
}

#[test]
fn cursor_on_empty_range() -> Result<()> {
    let dir = tempdir()?;
    let part = hundred(dir.path())?;
    let key = kv_table().sort_key()?;
    let mut cursor = part.cursor(&KeyRange::from(vec![Value::Int(500)]), &key);
    assert!(cursor.next().is_none());
    Ok(())
}

#[test]
fn verify_detects_flipped_byte() -> Result<()> {
    let dir = tempdir()?;
    let part = hundred(dir.path())?;
    let path = part.dir().join(DATA_FILE);
    let mut bytes = std::fs::read(&path)?;
    bytes[10] ^= 0x40;
    std::fs::write(&path, &bytes)?;

    let err = part.verify().unwrap_err();
    assert!(matches!(err.downcast_ref::<PartError>(), Some(PartError::ChecksumMismatch { .. })));
    Ok(())
}

#[test]
fn open_rejects_truncated_data() -> Result<()> {
    let dir = tempdir()?;
    let part = hundred(dir.path())?;
    let path = part.dir().join(DATA_FILE);
    let bytes = std::fs::read(&path)?;
    std::fs::write(&path, &bytes[..bytes.len() - 5])?;
    assert!(PartReader::open(part.dir()).is_err());
    Ok(())
}

// -------------------- Export / import --------------------

#[test]
fn export_then_import_elsewhere() -> Result<()> {
    let src = tempdir()?;
    let dst = tempdir()?;
    let part = hundred(src.path())?;
    let bytes = export_part(part.dir(), part.name())?;

    let meta = import_part(&bytes, dst.path(), part.name(), part.checksum(), false)?;
    assert_eq!(meta.rows, 100);
    assert_eq!(meta.checksum, part.checksum());

    let copy = PartReader::open(&part.name().dir_in(dst.path()))?;
    assert_eq!(copy.read_all()?, part.read_all()?);
    Ok(())
}

#[test]
fn import_rejects_wrong_checksum() -> Result<()> {
    let src = tempdir()?;
    let dst = tempdir()?;
    let part = hundred(src.path())?;
    let bytes = export_part(part.dir(), part.name())?;

    let err = import_part(&bytes, dst.path(), part.name(), part.checksum() ^ 1, false).unwrap_err();
    assert!(matches!(err.downcast_ref::<PartError>(), Some(PartError::ChecksumMismatch { .. })));
    assert!(!part.name().dir_in(dst.path()).exists());
    Ok(())
}

#[test]
fn import_rejects_corrupted_stream() -> Result<()> {
    let src = tempdir()?;
    let dst = tempdir()?;
    let part = hundred(src.path())?;
    let mut bytes = export_part(part.dir(), part.name())?;
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    assert!(import_part(&bytes, dst.path(), part.name(), part.checksum(), false).is_err());
    Ok(())
}

#[test]
fn import_rejects_other_part() -> Result<()> {
    let src = tempdir()?;
    let dst = tempdir()?;
    let part = hundred(src.path())?;
    let bytes = export_part(part.dir(), part.name())?;
    let other = PartName::new("all", 2);
    assert!(import_part(&bytes, dst.path(), &other, part.checksum(), false).is_err());
    Ok(())
}
