mod command_tests;
mod storage_tests;
mod watch_tests;

use config::ConsensusConfig;

pub(crate) fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        fsync: false,
        ..ConsensusConfig::default()
    }
}

pub(crate) fn put(path: &str, value: &[u8]) -> crate::Command {
    crate::Command::Put {
        path: path.to_string(),
        value: value.to_vec(),
    }
}
