use crate::entry::{LogEntry, LogOp};
use crate::ReplicationError;
use anyhow::Result;
use part::PartName;
use rows::Transform;

use super::kv_table;

#[test]
fn merge_entry_decodes_to_the_same_entry() -> Result<()> {
    let inputs = vec![PartName::new("all", 1), PartName::new("all", 2)];
    let entry = LogEntry::new(
        "r2",
        LogOp::MergeParts {
            output: PartName::merged(&inputs)?,
            inputs,
            checksum: 0xDEAD_BEEF,
        },
    );
    let decoded = LogEntry::decode(9, &entry.encode()?)?;
    assert_eq!(decoded.seq, 9);
    assert_eq!(decoded.origin, "r2");
    assert_eq!(decoded.op, entry.op);
    Ok(())
}

#[test]
fn alter_entry_carries_the_full_definition() -> Result<()> {
    let def = kv_table().with_transform(Transform::Sum {
        columns: vec!["v".into()],
    });
    let entry = LogEntry::new("r1", LogOp::AlterTable { def: def.clone() });
    match LogEntry::decode(1, &entry.encode()?)?.op {
        LogOp::AlterTable { def: decoded } => assert_eq!(decoded, def),
        other => panic!("unexpected op {:?}", other),
    }
    Ok(())
}

#[test]
fn flipped_byte_is_reported_as_corrupt() -> Result<()> {
    let entry = LogEntry::new(
        "r1",
        LogOp::AddPart {
            part: PartName::new("all", 3),
            checksum: 7,
            rows: 10,
        },
    );
    let mut bytes = entry.encode()?;
    bytes[6] ^= 0x01;
    match LogEntry::decode(3, &bytes) {
        Err(ReplicationError::CorruptEntry { seq, .. }) => assert_eq!(seq, 3),
        other => panic!("expected CorruptEntry, got {:?}", other),
    }
    Ok(())
}

#[test]
fn truncated_entry_is_corrupt() {
    let err = LogEntry::decode(1, &[1, 2, 3]).unwrap_err();
    assert!(!err.is_retryable());
}
