//! Where a table's shared state lives in the coordination store.
//!
//! ```text
//! {base}/metadata                      table definition
//! {base}/block_numbers                 counter, one block per insert partition
//! {base}/log/log-0000000001            replication log entries
//! {base}/replicas/{replica}/is_active  "1" while the replica is up
//! {base}/replicas/{replica}/log_pointer  last applied sequence (u64 LE)
//! ```
//!
//! `base` comes from the configured template with the replica's identity and
//! the table name substituted. The template must end with `{table}`.

use config::ReplicaIdentity;

pub const LOG_PREFIX: &str = "log-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePaths {
    base: String,
}

impl TablePaths {
    pub fn new(identity: &ReplicaIdentity, template: &str, table: &str) -> Self {
        Self {
            base: identity.expand(template, table),
        }
    }

    /// Prefix under which every table of the shard lives.
    #[must_use]
    pub fn root(identity: &ReplicaIdentity, template: &str) -> String {
        let head = template.split("{table}").next().unwrap_or(template);
        identity.expand(head, "")
    }

    /// Table name for a `.../metadata` path under `root`.
    #[must_use]
    pub fn table_of_metadata<'a>(root: &str, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(root)?;
        let table = rest.strip_suffix("/metadata")?;
        (!table.is_empty() && !table.contains('/')).then_some(table)
    }

    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    #[must_use]
    pub fn metadata(&self) -> String {
        format!("{}/metadata", self.base)
    }

    #[must_use]
    pub fn block_numbers(&self) -> String {
        format!("{}/block_numbers", self.base)
    }

    /// Prefix handed to `CreateSequential` for log entries.
    #[must_use]
    pub fn log_prefix(&self) -> String {
        format!("{}/log/{}", self.base, LOG_PREFIX)
    }

    #[must_use]
    pub fn log_entry(&self, seq: u64) -> String {
        format!("{}{:010}", self.log_prefix(), seq)
    }

    /// Sequence number encoded in a log entry path.
    #[must_use]
    pub fn seq_of(&self, path: &str) -> Option<u64> {
        path.strip_prefix(&self.log_prefix())?.parse().ok()
    }

    #[must_use]
    pub fn replicas(&self) -> String {
        format!("{}/replicas/", self.base)
    }

    #[must_use]
    pub fn is_active(&self, replica: &str) -> String {
        format!("{}/replicas/{}/is_active", self.base, replica)
    }

    #[must_use]
    pub fn log_pointer(&self, replica: &str) -> String {
        format!("{}/replicas/{}/log_pointer", self.base, replica)
    }

    /// Replica name for a `replicas/{r}/...` path.
    #[must_use]
    pub fn replica_of<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(&self.replicas())?;
        rest.split('/').next().filter(|r| !r.is_empty())
    }
}
