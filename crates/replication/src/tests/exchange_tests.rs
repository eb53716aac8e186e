use super::{kv_rows, open_store};
use crate::exchange::{LocalExchange, PartExchange};
use crate::ReplicationError;
use anyhow::Result;
use engine::PartState;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn served_part_imports_on_a_peer() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(open_store(&dir.path().join("a"))?);
    let target = open_store(&dir.path().join("b"))?;
    let meta = source.add_part(kv_rows(&[(1, 1), (2, 2)]), 1)?;

    let exchange = LocalExchange::new();
    exchange.serve("r1", "kv", Arc::clone(&source));
    let bytes = exchange.fetch("r1", "kv", &meta.name)?;
    target.import_part(&bytes, &meta.name, meta.checksum)?;

    assert_eq!(target.part_state(&meta.name), Some(PartState::Prepared));
    assert_eq!(exchange.transfers(), 1);
    Ok(())
}

#[test]
fn unreachable_or_withdrawn_replica_fails_transiently() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(open_store(dir.path())?);
    let meta = source.add_part(kv_rows(&[(1, 1)]), 1)?;
    let exchange = LocalExchange::new();
    exchange.serve("r1", "kv", source);

    exchange.set_unreachable("r1", true);
    assert!(matches!(
        exchange.fetch("r1", "kv", &meta.name),
        Err(ReplicationError::TransientFetch { .. })
    ));
    exchange.set_unreachable("r1", false);
    assert!(exchange.fetch("r1", "kv", &meta.name).is_ok());

    exchange.withdraw("r1");
    assert!(matches!(
        exchange.fetch("r1", "kv", &meta.name),
        Err(ReplicationError::TransientFetch { .. })
    ));
    Ok(())
}

#[test]
fn corrupted_transfer_fails_the_checksum() -> Result<()> {
    let dir = tempdir()?;
    let source = Arc::new(open_store(&dir.path().join("a"))?);
    let target = open_store(&dir.path().join("b"))?;
    let meta = source.add_part(kv_rows(&[(1, 1), (2, 2), (3, 3)]), 1)?;
    let exchange = LocalExchange::new();
    exchange.serve("r1", "kv", source);
    exchange.set_corrupting("r1", true);

    let bytes = exchange.fetch("r1", "kv", &meta.name)?;
    let err = target
        .import_part(&bytes, &meta.name, meta.checksum)
        .map_err(ReplicationError::from_store)
        .unwrap_err();
    assert!(matches!(err, ReplicationError::ChecksumMismatch { .. }));
    assert_eq!(target.part_state(&meta.name), None);
    Ok(())
}
