//! Merge assignment.
//!
//! Only the replica whose consensus node leads assigns merges, and only once
//! its own queue has caught up with the log. It claims disjoint candidates,
//! computes them on the [`MergePool`](crate::pool::MergePool), announces each
//! result with a `MergeParts` entry carrying the output checksum, and then
//! applies those entries through its own queue like every other replica.
//!
//! Merging starts by itself: [`Replica::insert`] and [`Replica::sync_all`]
//! end with an upkeep pass that merges crowded partitions and collects
//! garbage. `optimize` remains for merging everything on demand.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::entry::{LogEntry, LogOp};
use crate::pool::MergeJob;
use crate::{Replica, ReplicationError};

impl Replica {
    /// Runs one round of merge assignment for `table`. Returns the number of
    /// merges announced.
    pub fn schedule_merges(&self, table: &str) -> Result<usize, ReplicationError> {
        if !self.is_leader() {
            return Ok(0);
        }
        let t = self.table(table)?;
        let report = self.sync(table)?;
        if report.failed || report.remaining > 0 {
            debug!(table, remaining = report.remaining, failed = report.failed, "queue busy, no merges");
            return Ok(0);
        }
        if t.store.is_exhausted() {
            warn!(table, bytes = t.store.bytes_used(), "disk budget spent, merges paused");
            return Ok(0);
        }

        let mut jobs = Vec::new();
        while jobs.len() < self.pool.workers() {
            let Some(candidate) = t.store.select_merge(&self.selector) else {
                break;
            };
            let Some(claim) = t.store.try_claim(&candidate.parts) else {
                break;
            };
            debug!(table, parts = candidate.parts.len(), rows = candidate.rows, "merge claimed");
            jobs.push(MergeJob {
                store: Arc::clone(&t.store),
                claim,
            });
        }
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut announced = 0;
        let mut first_err = None;
        let mut claims = Vec::new();
        for done in self.pool.run(jobs) {
            match done.result {
                Ok(meta) => {
                    let entry = LogEntry::new(
                        self.identity().replica.as_str(),
                        LogOp::MergeParts {
                            inputs: done.claim.parts().to_vec(),
                            output: meta.name.clone(),
                            checksum: meta.checksum,
                        },
                    );
                    match t.log.append(&entry) {
                        Ok(seq) => {
                            info!(table, output = %meta.name, inputs = done.claim.parts().len(), seq, "merge announced");
                            announced += 1;
                        }
                        Err(e) => {
                            t.store.discard_prepared(&meta.name)?;
                            warn!(table, output = %meta.name, error = %e, "merge not announced");
                            first_err.get_or_insert(e);
                        }
                    }
                }
                Err(e) => match ReplicationError::from_store(e) {
                    ReplicationError::ResourceExhausted(msg) => {
                        warn!(table, reason = %msg, "merge hit the disk budget, merges paused");
                    }
                    other => {
                        warn!(table, error = %other, "merge failed");
                        first_err.get_or_insert(other);
                    }
                },
            }
            claims.push(done.claim);
        }

        // Claims stay held until the entries are applied locally.
        if announced > 0 {
            self.sync(table)?;
        }
        drop(claims);
        match first_err {
            Some(e) if announced == 0 => Err(e),
            _ => Ok(announced),
        }
    }

    /// Upkeep that runs after every insert and sync: the leader merges while
    /// some partition holds at least `auto_merge_parts` active parts, and
    /// every replica deletes the outdated parts no peer can still need.
    /// Failures are logged and left for the next run. Returns the number of
    /// merges announced.
    pub(crate) fn maintain(&self, table: &str) -> usize {
        let mut merged = 0;
        while self.needs_merge(table) {
            match self.schedule_merges(table) {
                Ok(0) => break,
                Ok(n) => merged += n,
                Err(e) => {
                    warn!(table, error = %e, "background merge failed");
                    break;
                }
            }
        }
        if merged > 0 {
            info!(table, merges = merged, "background merges announced");
        }
        match self.collect_garbage(table) {
            Ok(0) => {}
            Ok(n) => debug!(table, parts = n, "outdated parts collected"),
            Err(e) => warn!(table, error = %e, "garbage collection failed"),
        }
        merged
    }

    /// `true` if this replica leads and a partition of `table` crossed the
    /// automatic merge threshold.
    fn needs_merge(&self, table: &str) -> bool {
        let threshold = self.selector.policy().auto_merge_parts;
        if threshold == 0 || !self.is_leader() {
            return false;
        }
        let Ok(store) = self.store(table) else {
            return false;
        };
        let mut per_partition: HashMap<String, usize> = HashMap::new();
        for part in store.active_parts(None) {
            *per_partition.entry(part.partition).or_default() += 1;
        }
        per_partition.values().any(|&n| n >= threshold)
    }

    /// Merges `table` until no candidate is left. Leader only.
    pub fn optimize(&self, table: &str) -> Result<usize, ReplicationError> {
        let mut total = 0;
        loop {
            let n = self.schedule_merges(table)?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }
}
