use super::*;
use std::fs;
use std::io::Cursor;
use tempfile::tempdir;

// -------------------- Helpers --------------------

fn entry(index: u64, term: u64, payload: &[u8]) -> WalRecord {
    WalRecord::Entry {
        index,
        term,
        payload: payload.to_vec(),
    }
}

fn hard(term: u64, voted_for: Option<u64>) -> WalRecord {
    WalRecord::HardState { term, voted_for }
}

fn replay_all(path: &std::path::Path) -> Result<Vec<WalRecord>, WalError> {
    let mut reader = WalReader::open(path)?;
    let mut recs = Vec::new();
    reader.replay(|r| recs.push(r))?;
    Ok(recs)
}

fn replay_from_bytes(data: &[u8]) -> Result<Vec<WalRecord>, WalError> {
    let mut reader = WalReader::from_reader(Cursor::new(data.to_vec()));
    let mut recs = Vec::new();
    reader.replay(|r| recs.push(r))?;
    Ok(recs)
}

// -------------------- Basic write & replay --------------------

#[test]
fn write_and_replay_all_record_kinds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("raft.wal");

    {
        let mut w = WalWriter::create(&path, true).unwrap();
        w.append(&hard(1, Some(3))).unwrap();
        w.append(&entry(1, 1, b"noop")).unwrap();
        w.append(&entry(2, 1, b"put")).unwrap();
        w.append(&WalRecord::Truncate { from_index: 2 }).unwrap();
        w.append(&hard(2, None)).unwrap();
    }

    let recs = replay_all(&path).unwrap();
    assert_eq!(
        recs,
        vec![
            hard(1, Some(3)),
            entry(1, 1, b"noop"),
            entry(2, 1, b"put"),
            WalRecord::Truncate { from_index: 2 },
            hard(2, None),
        ]
    );
}

#[test]
fn batch_append_equals_single_appends() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.wal");
    let b = dir.path().join("b.wal");
    let recs = vec![entry(1, 1, b"x"), entry(2, 1, b"y"), hard(1, Some(1))];

    {
        let mut w = WalWriter::create(&a, false).unwrap();
        w.append_batch(&recs).unwrap();
        w.append_batch(&[]).unwrap();
    }
    {
        let mut w = WalWriter::create(&b, false).unwrap();
        for r in &recs {
            w.append(r).unwrap();
        }
    }
    assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    assert_eq!(replay_all(&a).unwrap(), recs);
}

#[test]
fn vote_for_node_zero_is_not_lost() {
    let recs = {
        let mut buf = Vec::new();
        encode_frame(&mut buf, &hard(4, Some(0))).unwrap();
        replay_from_bytes(&buf).unwrap()
    };
    assert_eq!(recs, vec![hard(4, Some(0))]);
}

#[test]
fn empty_payload_entry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("raft.wal");
    {
        let mut w = WalWriter::create(&path, true).unwrap();
        w.append(&entry(1, 1, b"")).unwrap();
    }
    assert_eq!(replay_all(&path).unwrap(), vec![entry(1, 1, b"")]);
}

// -------------------- Truncated tail tolerance --------------------

#[test]
fn truncated_tail_after_valid_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("raft.wal");

    {
        let mut w = WalWriter::create(&path, true).unwrap();
        w.append(&entry(1, 1, b"a")).unwrap();
        w.append(&entry(2, 1, b"b")).unwrap();
    }

    let mut data = fs::read(&path).unwrap();
    data.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]); // record_len = 32, nothing else
    fs::write(&path, &data).unwrap();

    let recs = replay_all(&path).unwrap();
    assert_eq!(recs, vec![entry(1, 1, b"a"), entry(2, 1, b"b")]);
}

#[test]
fn truncated_body_after_crc() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("raft.wal");
    {
        let mut w = WalWriter::create(&path, true).unwrap();
        w.append(&entry(1, 1, b"k")).unwrap();
    }
    let mut data = fs::read(&path).unwrap();
    data.extend_from_slice(&[0x20, 0x00, 0x00, 0x00]);
    data.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
    data.extend_from_slice(&[0x01, 0x02]);
    fs::write(&path, &data).unwrap();

    assert_eq!(replay_all(&path).unwrap(), vec![entry(1, 1, b"k")]);
}

#[test]
fn valid_len_stops_before_torn_tail() {
    let mut buf = Vec::new();
    encode_frame(&mut buf, &entry(1, 1, b"abc")).unwrap();
    let good = buf.len() as u64;
    buf.extend_from_slice(&[9, 0, 0, 0, 1]);

    let mut reader = WalReader::from_reader(Cursor::new(buf));
    let mut n = 0;
    reader.replay(|_| n += 1).unwrap();
    assert_eq!(n, 1);
    assert_eq!(reader.valid_len(), good);
}

#[test]
fn recover_cuts_torn_tail_so_appends_survive() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("raft.wal");
    {
        let mut w = WalWriter::create(&path, true).unwrap();
        w.append(&entry(1, 1, b"a")).unwrap();
    }
    let mut data = fs::read(&path).unwrap();
    data.extend_from_slice(&[0x40, 0x00, 0x00]);
    fs::write(&path, &data).unwrap();

    let recs = recover(&path).unwrap();
    assert_eq!(recs, vec![entry(1, 1, b"a")]);
    {
        let mut w = WalWriter::create(&path, true).unwrap();
        w.append(&entry(2, 1, b"b")).unwrap();
    }
    assert_eq!(replay_all(&path).unwrap(), vec![entry(1, 1, b"a"), entry(2, 1, b"b")]);
}

#[test]
fn recover_missing_file_is_empty() {
    let dir = tempdir().unwrap();
    assert!(recover(dir.path().join("nope.wal")).unwrap().is_empty());
}

// -------------------- Empty WAL --------------------

#[test]
fn replay_empty_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("raft.wal");
    fs::write(&path, b"").unwrap();
    assert!(replay_all(&path).unwrap().is_empty());
}

#[test]
fn open_non_existent_file_returns_error() {
    let dir = tempdir().unwrap();
    let result = WalReader::open(dir.path().join("missing.wal"));
    assert!(matches!(result, Err(WalError::Io(_))));
}

// -------------------- Corruption detection --------------------

#[test]
fn flipped_byte_is_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("raft.wal");
    {
        let mut w = WalWriter::create(&path, true).unwrap();
        w.append(&entry(1, 1, b"one")).unwrap();
        w.append(&entry(2, 1, b"two")).unwrap();
    }
    let mut data = fs::read(&path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    let first_len = {
        let mut buf = Vec::new();
        encode_frame(&mut buf, &entry(1, 1, b"one")).unwrap();
        buf.len() as u64
    };
    match replay_all(&path) {
        Err(WalError::Corrupt(at)) => assert_eq!(at, first_len),
        other => panic!("expected corruption, got {:?}", other),
    }
}

#[test]
fn unknown_op_is_corruption() {
    let body = [7u8, 0, 0, 0];
    let mut hasher = Crc32::new();
    hasher.update(&body);
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
    bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
    bytes.extend_from_slice(&body);
    assert!(matches!(replay_from_bytes(&bytes), Err(WalError::Corrupt(0))));
}

#[test]
fn corrupt_record_len_too_small() {
    assert!(matches!(replay_from_bytes(&[0, 0, 0, 0]), Err(WalError::Corrupt(0))));
    assert!(matches!(replay_from_bytes(&[3, 0, 0, 0]), Err(WalError::Corrupt(0))));
}

// -------------------- Rewrite --------------------

#[test]
fn rewrite_replaces_contents_atomically() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("raft.wal");
    {
        let mut w = WalWriter::create(&path, false).unwrap();
        for i in 1..=10 {
            w.append(&entry(i, 1, b"old")).unwrap();
        }
    }
    let keep = vec![hard(3, Some(1)), entry(9, 1, b"old"), entry(10, 1, b"old")];
    rewrite(&path, &keep, true).unwrap();

    assert_eq!(replay_all(&path).unwrap(), keep);
    assert!(!path.with_extension("tmp").exists());
}

// -------------------- Stress --------------------

#[test]
fn many_entries_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("raft.wal");
    let n = 5_000u64;
    {
        let mut w = WalWriter::create(&path, false).unwrap();
        for i in 1..=n {
            w.append(&entry(i, i / 100 + 1, format!("cmd{}", i).as_bytes()))
                .unwrap();
        }
        w.sync_to_disk().unwrap();
    }
    let recs = replay_all(&path).unwrap();
    assert_eq!(recs.len() as u64, n);
    assert_eq!(recs[4_999], entry(5_000, 51, b"cmd5000"));
}
