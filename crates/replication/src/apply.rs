//! How one replica executes log entries of one table.

use consensus::Coordination;
use engine::{PartState, PartStore};
use part::PartName;
use tracing::{debug, warn};

use crate::entry::{LogEntry, LogOp};
use crate::exchange::PartExchange;
use crate::log::ReplicationLog;
use crate::paths::TablePaths;
use crate::queue::EntryApplier;
use crate::ReplicationError;

pub(crate) struct TableApplier<'a> {
    pub(crate) replica: &'a str,
    pub(crate) table: &'a str,
    pub(crate) paths: &'a TablePaths,
    pub(crate) log: &'a ReplicationLog,
    pub(crate) store: &'a PartStore,
    pub(crate) coord: &'a dyn Coordination,
    pub(crate) exchange: &'a dyn PartExchange,
}

impl TableApplier<'_> {
    /// Downloads `part` and installs it `Prepared`.
    ///
    /// Tries the replica that created it first, then every other replica
    /// whose published log pointer shows it applied entry `seq`.
    fn fetch_part(&self, part: &PartName, checksum: u32, origin: &str, seq: u64) -> Result<(), ReplicationError> {
        let mut candidates: Vec<String> = Vec::new();
        if origin != self.replica {
            candidates.push(origin.to_string());
        }
        for (replica, pointer) in self.peer_pointers()? {
            if replica != self.replica && replica != origin && pointer >= seq {
                candidates.push(replica);
            }
        }

        let mut last_err = None;
        for source in &candidates {
            let attempt = self.exchange.fetch(source, self.table, part).and_then(|bytes| {
                self.store
                    .import_part(&bytes, part, checksum)
                    .map_err(ReplicationError::from_store)
            });
            match attempt {
                Ok(_) => {
                    debug!(table = self.table, %part, from = %source, "part fetched");
                    return Ok(());
                }
                Err(e) => {
                    warn!(table = self.table, %part, from = %source, error = %e, "part fetch failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ReplicationError::TransientFetch {
            part: part.to_string(),
            reason: "no replica holds it yet".into(),
        }))
    }

    /// Published log pointers of every registered replica.
    fn peer_pointers(&self) -> Result<Vec<(String, u64)>, ReplicationError> {
        Ok(self
            .coord
            .list(&self.paths.replicas())?
            .into_iter()
            .filter(|(path, _)| path.ends_with("/log_pointer"))
            .filter_map(|(path, value)| {
                let replica = self.paths.replica_of(&path)?.to_string();
                let pointer = u64::from_le_bytes(value.as_slice().try_into().ok()?);
                Some((replica, pointer))
            })
            .collect())
    }

    fn is_outdated(&self, part: &PartName) -> bool {
        self.store.part_state(part) == Some(PartState::Outdated)
    }

    /// `true` if a larger active part already holds every block of `part`,
    /// as after replaying a log whose merges were applied and collected.
    fn is_superseded(&self, part: &PartName) -> bool {
        self.store
            .active_parts(Some(&part.partition))
            .iter()
            .any(|active| active != part && active.covers(part))
    }

    /// The entry before `before` that announced `part`, as
    /// `(checksum, origin, seq)`.
    fn announcement(&self, part: &PartName, before: u64) -> Result<Option<(u32, String, u64)>, ReplicationError> {
        let mut found = None;
        for entry in self.log.tail(0)? {
            let entry = entry?;
            if entry.seq >= before {
                break;
            }
            let checksum = match &entry.op {
                LogOp::AddPart { part: p, checksum, .. } if p == part => *checksum,
                LogOp::MergeParts { output, checksum, .. } if output == part => *checksum,
                _ => continue,
            };
            found = Some((checksum, entry.origin, entry.seq));
        }
        Ok(found)
    }

    /// Downloads every missing input of the merge announced at `seq`,
    /// checked against the checksums they were announced with.
    fn fetch_operands(&self, missing: &[&PartName], seq: u64) -> Result<(), ReplicationError> {
        for part in missing {
            let Some((checksum, origin, announced_at)) = self.announcement(part, seq)? else {
                return Err(ReplicationError::TransientFetch {
                    part: part.to_string(),
                    reason: "merge input was never announced".into(),
                });
            };
            self.fetch_part(part, checksum, &origin, announced_at)?;
        }
        Ok(())
    }

    fn apply_add(&self, part: &PartName, checksum: u32) -> Result<(), ReplicationError> {
        match self.store.part_state(part) {
            Some(PartState::Prepared) => {}
            Some(PartState::Active) | Some(PartState::Outdated) => return Ok(()),
            None if self.is_superseded(part) => return Ok(()),
            None => {
                return Err(ReplicationError::TransientFetch {
                    part: part.to_string(),
                    reason: "part not present locally".into(),
                })
            }
        }
        let actual = self.store.part_checksum(part).map_err(ReplicationError::from_store)?;
        if actual != checksum {
            self.store.discard_prepared(part)?;
            return Err(ReplicationError::ChecksumMismatch {
                part: part.to_string(),
                expected: checksum,
                actual,
            });
        }
        self.store.activate(part).map_err(ReplicationError::from_store)
    }

    fn apply_merge(&self, seq: u64, inputs: &[PartName], output: &PartName, checksum: u32) -> Result<(), ReplicationError> {
        let expected_name = PartName::merged(inputs).map_err(|e| ReplicationError::CorruptEntry {
            seq,
            reason: format!("{:#}", e),
        })?;
        if expected_name != *output {
            return Err(ReplicationError::CorruptEntry {
                seq,
                reason: format!("merge of {} inputs cannot produce {}", inputs.len(), output),
            });
        }
        match self.store.part_state(output) {
            Some(PartState::Active) | Some(PartState::Outdated) => return Ok(()),
            None if self.is_superseded(output) => return Ok(()),
            _ => {}
        }
        // An earlier entry already retired one of the inputs: this merge lost
        // the race and is skipped everywhere.
        if inputs.iter().any(|p| self.is_outdated(p)) {
            self.store.discard_prepared(output)?;
            debug!(table = self.table, seq, %output, "obsolete merge skipped");
            return Ok(());
        }

        // Inputs fetched for this merge arrive `Prepared`; they were checked
        // against their own announcements.
        for input in inputs {
            if self.store.part_state(input) == Some(PartState::Prepared) {
                self.store.activate(input).map_err(ReplicationError::from_store)?;
            }
        }

        let actual = match self.store.part_state(output) {
            Some(_) => self.store.part_checksum(output).map_err(ReplicationError::from_store)?,
            None => {
                self.store
                    .prepare_merge(inputs)
                    .map_err(ReplicationError::from_store)?
                    .checksum
            }
        };
        if actual != checksum {
            self.store.discard_prepared(output)?;
            return Err(ReplicationError::DivergentMergeResult {
                output: output.to_string(),
                expected: checksum,
                actual,
            });
        }
        self.store
            .commit_merge(inputs, output)
            .map_err(ReplicationError::from_store)
    }
}

impl EntryApplier for TableApplier<'_> {
    fn fetch(&self, entry: &LogEntry) -> Result<(), ReplicationError> {
        match &entry.op {
            LogOp::AddPart { part, checksum, .. } => {
                if self.store.part_state(part).is_some() || self.is_superseded(part) {
                    return Ok(());
                }
                self.fetch_part(part, *checksum, &entry.origin, entry.seq)
            }
            LogOp::MergeParts {
                inputs,
                output,
                checksum,
            } => {
                if self.store.part_state(output).is_some()
                    || self.is_superseded(output)
                    || inputs.iter().any(|p| self.is_outdated(p))
                {
                    return Ok(());
                }
                let missing: Vec<&PartName> = inputs.iter().filter(|p| self.store.part_state(p).is_none()).collect();
                if missing.is_empty() {
                    return Ok(());
                }
                match self.fetch_operands(&missing, entry.seq) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // No peer holds the inputs any more: the merged part
                        // is still checked against the announced checksum.
                        warn!(
                            table = self.table,
                            seq = entry.seq,
                            %output,
                            error = %e,
                            "merge inputs unavailable, fetching the merged part"
                        );
                        self.fetch_part(output, *checksum, &entry.origin, entry.seq)
                    }
                }
            }
            LogOp::DropPart { .. } | LogOp::AlterTable { .. } => Ok(()),
        }
    }

    fn apply(&self, entry: &LogEntry) -> Result<(), ReplicationError> {
        match &entry.op {
            LogOp::AddPart { part, checksum, .. } => self.apply_add(part, *checksum),
            LogOp::MergeParts {
                inputs,
                output,
                checksum,
            } => self.apply_merge(entry.seq, inputs, output, *checksum),
            LogOp::DropPart { part } => {
                self.store.drop_part(part)?;
                Ok(())
            }
            LogOp::AlterTable { def } => {
                if *self.store.def() != *def {
                    self.store.set_def(def)?;
                }
                Ok(())
            }
        }
    }
}
