use super::*;
use std::ops::Bound;

fn int(v: i64) -> Vec<Value> {
    vec![Value::Int(v)]
}

/// Ten granules whose first keys are 0, 10, 20, ... 90.
fn tens() -> PrimaryIndex {
    let mut idx = PrimaryIndex::new();
    for i in 0..10u64 {
        idx.push(Mark {
            key: int(i as i64 * 10),
            offset: i * 100,
            rows: 10,
        });
    }
    idx
}

#[test]
fn full_range_reads_everything() {
    let idx = tens();
    assert_eq!(idx.granules_for(&KeyRange::all()), 0..10);
    assert_eq!(idx.total_rows(), 100);
}

#[test]
fn point_range_reads_one_or_two_granules() {
    let idx = tens();
    // 25 lives in granule 2 only.
    assert_eq!(idx.granules_for(&KeyRange::prefix(int(25))), 2..3);
    // 30 starts granule 3 but equal keys may also end granule 2.
    assert_eq!(idx.granules_for(&KeyRange::prefix(int(30))), 2..4);
}

#[test]
fn narrow_range_prunes_granules() {
    let idx = tens();
    let r = idx.granules_for(&KeyRange::between(int(42), int(57)));
    assert_eq!(r, 4..6);
    assert!(r.len() < idx.granule_count());
}

#[test]
fn range_outside_keys() {
    let idx = tens();
    assert_eq!(idx.granules_for(&KeyRange::until(int(0))).len(), 0);
    // Beyond the last mark only the last granule can match.
    assert_eq!(idx.granules_for(&KeyRange::from(int(1_000))), 9..10);
}

#[test]
fn empty_range_is_empty() {
    let idx = tens();
    let r = KeyRange {
        start: Bound::Included(int(50)),
        end: Bound::Excluded(int(20)),
    };
    assert!(idx.granules_for(&r).is_empty());
}

#[test]
fn empty_index() {
    let idx = PrimaryIndex::new();
    assert!(idx.is_empty());
    assert_eq!(idx.granules_for(&KeyRange::all()), 0..0);
}

#[test]
fn serialize_and_reload() -> Result<()> {
    let mut idx = PrimaryIndex::new();
    idx.push(Mark {
        key: vec![Value::Int(1), Value::from("a")],
        offset: 0,
        rows: 4,
    });
    idx.push(Mark {
        key: vec![Value::Int(1), Value::from("b")],
        offset: 77,
        rows: 2,
    });
    let mut buf = Vec::new();
    idx.write_to(&mut buf)?;
    let back = PrimaryIndex::read_from(&mut buf.as_slice())?;
    assert_eq!(back, idx);
    Ok(())
}

#[test]
fn corrupted_index_is_rejected() -> Result<()> {
    let mut buf = Vec::new();
    tens().write_to(&mut buf)?;
    let last = buf.len() - 1;
    buf[last] ^= 0xFF;
    assert!(PrimaryIndex::read_from(&mut buf.as_slice()).is_err());
    Ok(())
}
