//! # Replication
//!
//! Keeps the part stores of every replica of a shard identical. Replicas
//! never talk to each other directly except to copy part bytes; everything
//! they agree on goes through the consensus service.
//!
//! ```text
//!   insert(rows)                                       schedule_merges()
//!       │ sort, split by partition                          │ leader only
//!       │ Increment block_numbers                           │ claim, MergePool
//!       ▼                                                   ▼
//!   PartStore::add_part ──► Prepared            PartStore::prepare_merge
//!       │                                                   │
//!       └────── append AddPart ──► REPLICATION LOG ◄── append MergeParts
//!                                 (sequential nodes)
//!                                        │ tail(last_applied)
//!               ┌────────────────────────┼────────────────────────┐
//!               ▼                        ▼                        ▼
//!        queue on r1              queue on r2               queue on r3
//!     fetch ─► apply           fetch ─► apply            fetch ─► apply
//!               │  part bytes from the origin or any peer past the entry
//!               ▼
//!        publish log_pointer
//! ```
//!
//! Each queue applies entries strictly in sequence order and persists the
//! last applied sequence number, so applying is idempotent across restarts.
//! Merges are recomputed on every replica and checked against the checksum
//! the leader announced.
//!
//! ## Coordination layout
//!
//! See [`paths`] for the paths each table uses.

mod apply;
mod cluster;
mod entry;
mod error;
mod exchange;
mod log;
pub mod paths;
mod pool;
mod queue;
mod replica;
mod scheduler;

pub use cluster::LocalCluster;
pub use entry::{LogEntry, LogOp};
pub use error::ReplicationError;
pub use exchange::{LocalExchange, PartExchange};
pub use log::{LogTail, ReplicationLog};
pub use paths::TablePaths;
pub use pool::{MergeDone, MergeJob, MergePool};
pub use queue::{EntryApplier, FailedEntry, QueueState, ReplicationQueue, RunReport};
pub use replica::{Replica, ReplicaHealth};

#[cfg(test)]
mod tests;
