/// Merges, drops and garbage collection.
///
/// A merge happens in two steps. [`PartStore::prepare_merge`] computes the
/// output part from the inputs and leaves it `Prepared`; nothing changes for
/// readers. [`PartStore::commit_merge`] then activates the output and marks
/// the inputs `Outdated` in a single swap of the active set. The replication
/// queue runs the second step when it applies the `MergeParts` entry.
use anyhow::{bail, ensure, Result};
use part::{merge_parts, PartMeta, PartName, PartReader};
use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::classify;
use crate::{PartState, PartStore, StoreError};

/// Exclusive hold on a set of parts while a merge of them is in flight.
///
/// Released on drop.
pub struct MergeClaim {
    names: Vec<PartName>,
    claims: Arc<Mutex<HashSet<PartName>>>,
}

impl MergeClaim {
    #[must_use]
    pub fn parts(&self) -> &[PartName] {
        &self.names
    }
}

impl Drop for MergeClaim {
    fn drop(&mut self) {
        if let Ok(mut claims) = self.claims.lock() {
            for n in &self.names {
                claims.remove(n);
            }
        }
    }
}

impl std::fmt::Debug for MergeClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeClaim").field("parts", &self.names).finish()
    }
}

impl PartStore {
    /// Claims every part in `names`, or none if any is already claimed.
    #[must_use]
    pub fn try_claim(&self, names: &[PartName]) -> Option<MergeClaim> {
        let mut claims = self.claims.lock().ok()?;
        if names.iter().any(|n| claims.contains(n)) {
            return None;
        }
        claims.extend(names.iter().cloned());
        Some(MergeClaim {
            names: names.to_vec(),
            claims: Arc::clone(&self.claims),
        })
    }

    /// Parts currently claimed by in-flight merges.
    #[must_use]
    pub fn claimed(&self) -> HashSet<PartName> {
        self.claims.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Computes the merge of `inputs` into a new `Prepared` part.
    ///
    /// Inputs are ordered by block range before merging, so callers may pass
    /// them in any order. If the output part already exists it is returned
    /// as is.
    pub fn prepare_merge(&self, inputs: &[PartName]) -> Result<PartMeta> {
        ensure!(!inputs.is_empty(), "merge without inputs");
        let mut sorted = inputs.to_vec();
        sorted.sort();
        sorted.dedup();
        let output = PartName::merged(&sorted)?;

        let readers: Vec<Arc<PartReader>> = {
            let st = self.lock_state()?;
            if let Some(slot) = st.parts.get(&output) {
                return Ok(PartMeta {
                    name: output,
                    rows: slot.reader.rows(),
                    checksum: slot.reader.checksum(),
                    bytes: slot.bytes,
                });
            }
            let mut readers = Vec::with_capacity(sorted.len());
            for name in &sorted {
                match st.parts.get(name) {
                    Some(slot) if slot.state != PartState::Prepared => readers.push(Arc::clone(&slot.reader)),
                    Some(_) => bail!("merge input {} is not active", name),
                    None => return Err(StoreError::PartNotFound(name.clone()).into()),
                }
            }
            readers
        };

        let needed: u64 = readers.iter().map(|r| r.bytes()).sum();
        self.ensure_capacity(needed)?;

        let def = self.def();
        let meta = merge_parts(&self.table_dir, &readers, &def, self.config.fsync).map_err(classify)?;
        self.register(&meta, PartState::Prepared)?;
        debug!(
            output = %meta.name,
            inputs = sorted.len(),
            rows = meta.rows,
            checksum = format_args!("{:08x}", meta.checksum),
            "prepared merge"
        );
        Ok(meta)
    }

    /// Activates `output` and retires `inputs` in one atomic swap.
    ///
    /// Inputs that are already outdated stay outdated; an output that is
    /// already active makes the call a no-op.
    pub fn commit_merge(&self, inputs: &[PartName], output: &PartName) -> Result<()> {
        let mut st = self.lock_state()?;
        match st.parts.get(output).map(|s| s.state) {
            Some(PartState::Prepared) => {}
            Some(PartState::Active) => return Ok(()),
            Some(PartState::Outdated) => bail!("merge output {} is outdated", output),
            None => return Err(StoreError::PartNotFound(output.clone()).into()),
        }
        for name in inputs {
            ensure!(output.covers(name), "merge output {} does not cover {}", output, name);
        }

        for name in inputs {
            if let Some(slot) = st.parts.get_mut(name) {
                slot.state = PartState::Outdated;
                st.manifest.set(name.clone(), PartState::Outdated);
            }
        }
        if let Some(slot) = st.parts.get_mut(output) {
            slot.state = PartState::Active;
        }
        st.manifest.set(output.clone(), PartState::Active);
        st.manifest.save()?;
        self.publish(&st)?;
        info!(output = %output, inputs = inputs.len(), "merge committed");
        Ok(())
    }

    /// Retires an active part. Returns `false` if it was not active.
    pub fn drop_part(&self, name: &PartName) -> Result<bool> {
        let mut st = self.lock_state()?;
        match st.parts.get_mut(name) {
            Some(slot) if slot.state == PartState::Active => slot.state = PartState::Outdated,
            _ => return Ok(false),
        }
        st.manifest.set(name.clone(), PartState::Outdated);
        st.manifest.save()?;
        self.publish(&st)?;
        info!(part = %name, "part dropped");
        Ok(true)
    }

    /// Deletes outdated parts no reader still holds. Returns how many went.
    pub fn collect_garbage(&self) -> Result<usize> {
        let mut st = self.lock_state()?;
        let doomed: Vec<PartName> = st
            .parts
            .iter()
            .filter(|(_, s)| s.state == PartState::Outdated && Arc::strong_count(&s.reader) == 1)
            .map(|(n, _)| n.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        for name in &doomed {
            if let Some(slot) = st.parts.remove(name) {
                self.release_bytes(slot.bytes);
            }
            st.manifest.remove(name);
            let _ = fs::remove_dir_all(name.dir_in(&self.table_dir));
        }
        st.manifest.save()?;
        debug!(parts = doomed.len(), "collected outdated parts");
        Ok(doomed.len())
    }
}
