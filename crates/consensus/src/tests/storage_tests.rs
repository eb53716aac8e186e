use super::put;
use crate::{ConsensusError, HardState, LogEntry, NodeStorage, Snapshot, SNAPSHOT_FILENAME};
use anyhow::Result;
use std::fs;
use tempfile::tempdir;

fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
    range
        .map(|index| LogEntry {
            index,
            term,
            command: put(&format!("/k{}", index), b"v"),
        })
        .collect()
}

#[test]
fn fresh_directory_recovers_nothing() -> Result<()> {
    let dir = tempdir()?;
    let (_storage, rec) = NodeStorage::open(dir.path(), false)?;
    assert_eq!(rec.hard_state, HardState::default());
    assert!(rec.snapshot.is_none());
    assert!(rec.entries.is_empty());
    Ok(())
}

#[test]
fn reopen_recovers_hard_state_and_entries() -> Result<()> {
    let dir = tempdir()?;
    {
        let (mut storage, _) = NodeStorage::open(dir.path(), false)?;
        storage.save_hard_state(HardState {
            term: 1,
            voted_for: Some(2),
        })?;
        storage.append(&entries(1..=3, 1))?;
        storage.save_hard_state(HardState {
            term: 2,
            voted_for: None,
        })?;
    }
    let (_storage, rec) = NodeStorage::open(dir.path(), false)?;
    assert_eq!(
        rec.hard_state,
        HardState {
            term: 2,
            voted_for: None
        }
    );
    assert_eq!(rec.entries, entries(1..=3, 1));
    Ok(())
}

#[test]
fn truncation_is_replayed() -> Result<()> {
    let dir = tempdir()?;
    {
        let (mut storage, _) = NodeStorage::open(dir.path(), false)?;
        storage.append(&entries(1..=3, 1))?;
        storage.truncate_from(2)?;
        storage.append(&entries(2..=2, 2))?;
    }
    let (_storage, rec) = NodeStorage::open(dir.path(), false)?;
    let terms: Vec<_> = rec.entries.iter().map(|e| (e.index, e.term)).collect();
    assert_eq!(terms, vec![(1, 1), (2, 2)]);
    Ok(())
}

#[test]
fn snapshot_replaces_log_prefix() -> Result<()> {
    let dir = tempdir()?;
    let hs = HardState {
        term: 3,
        voted_for: Some(1),
    };
    {
        let (mut storage, _) = NodeStorage::open(dir.path(), false)?;
        storage.append(&entries(1..=5, 3))?;
        let snap = Snapshot {
            index: 3,
            term: 3,
            data: b"state".to_vec(),
        };
        storage.save_snapshot(&snap, hs, &entries(4..=5, 3))?;
        storage.append(&entries(6..=6, 3))?;
    }
    let (_storage, rec) = NodeStorage::open(dir.path(), false)?;
    assert_eq!(rec.hard_state, hs);
    let snap = rec.snapshot.expect("snapshot");
    assert_eq!((snap.index, snap.term, snap.data.as_slice()), (3, 3, &b"state"[..]));
    assert_eq!(rec.entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![4, 5, 6]);
    Ok(())
}

#[test]
fn damaged_snapshot_is_reported() -> Result<()> {
    let dir = tempdir()?;
    {
        let (mut storage, _) = NodeStorage::open(dir.path(), false)?;
        let snap = Snapshot {
            index: 1,
            term: 1,
            data: b"abcdef".to_vec(),
        };
        storage.save_snapshot(&snap, HardState::default(), &[])?;
    }
    let path = dir.path().join(SNAPSHOT_FILENAME);
    let mut bytes = fs::read(&path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, bytes)?;

    assert!(matches!(
        NodeStorage::open(dir.path(), false),
        Err(ConsensusError::Corrupt(_))
    ));
    Ok(())
}
