use crate::{Command, ConsensusError};

#[test]
fn compare_and_set_without_expected_survives_encoding() {
    let cmd = Command::CompareAndSet {
        path: "/tables/01/hits/metadata".into(),
        expected: None,
        value: b"def".to_vec(),
    };
    assert_eq!(Command::decode(&cmd.encode()).unwrap(), cmd);
}

#[test]
fn unknown_op_is_corrupt() {
    assert!(matches!(Command::decode(&[9]), Err(ConsensusError::Corrupt(_))));
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut bytes = Command::Noop.encode();
    bytes.push(0);
    assert!(matches!(Command::decode(&bytes), Err(ConsensusError::Corrupt(_))));
}

#[test]
fn truncated_path_is_rejected() {
    let bytes = Command::Delete { path: "/a/b".into() }.encode();
    assert!(Command::decode(&bytes[..bytes.len() - 1]).is_err());
}
