/// Write path: new parts from inserts and from peers.
///
/// Both routes leave the part `Prepared`. It becomes readable only through
/// [`PartStore::activate`], which the replication queue calls when it applies
/// the log entry announcing the part.
use anyhow::{bail, ensure, Result};
use part::{write_part, PartMeta, PartName, PartReader};
use rows::{row_size, Row};
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::classify;
use crate::{PartSlot, PartState, PartStore, StoreError};

impl PartStore {
    /// Writes `rows` as a new `Prepared` part holding block `block`.
    ///
    /// Rows must already be sorted by the sort key and belong to a single
    /// partition.
    ///
    /// # Errors
    ///
    /// - [`StoreError::UnsortedInput`] if the rows are out of order.
    /// - [`StoreError::ResourceExhausted`] if the disk budget would be
    ///   exceeded or the disk is full. Nothing is written in either case.
    pub fn add_part(&self, rows: Vec<Row>, block: u64) -> Result<PartMeta> {
        ensure!(!rows.is_empty(), "refusing to write an empty part");
        let def = self.def();
        let key = def.sort_key()?;
        if !key.is_sorted(&rows) {
            return Err(StoreError::UnsortedInput.into());
        }
        let partition = def.partition_of(&rows[0])?;
        for row in &rows {
            def.validate_row(row)?;
            ensure!(
                def.partition_of(row)? == partition,
                "rows of one part must share a partition"
            );
        }

        let estimate: u64 = rows.iter().map(|r| row_size(r) as u64).sum();
        self.ensure_capacity(estimate)?;

        let name = PartName::new(partition, block);
        if self.part_state(&name).is_some() {
            bail!("part {} already exists", name);
        }
        let meta = write_part(&self.table_dir, name, &def, rows, self.config.fsync).map_err(classify)?;
        self.register(&meta, PartState::Prepared)?;
        debug!(part = %meta.name, rows = meta.rows, "wrote prepared part");
        Ok(meta)
    }

    /// Opens a freshly written part and records it in `state`.
    pub(crate) fn register(&self, meta: &PartMeta, state: PartState) -> Result<()> {
        let reader = PartReader::open(&meta.name.dir_in(&self.table_dir))?;
        let mut st = self.lock_state()?;
        st.parts.insert(
            meta.name.clone(),
            PartSlot {
                reader: Arc::new(reader),
                state,
                bytes: meta.bytes,
            },
        );
        st.manifest.set(meta.name.clone(), state);
        st.manifest.save()?;
        self.bytes_used.fetch_add(meta.bytes, Ordering::Relaxed);
        if state == PartState::Active {
            self.publish(&st)?;
        }
        Ok(())
    }

    /// Makes a `Prepared` part visible. Activating an active part is a no-op.
    pub fn activate(&self, name: &PartName) -> Result<()> {
        let mut st = self.lock_state()?;
        match st.parts.get(name).map(|s| s.state) {
            Some(PartState::Prepared) => {}
            Some(PartState::Active) => return Ok(()),
            Some(PartState::Outdated) => bail!("part {} is outdated", name),
            None => return Err(StoreError::PartNotFound(name.clone()).into()),
        }
        if let Some(slot) = st.parts.get_mut(name) {
            slot.state = PartState::Active;
        }
        st.manifest.set(name.clone(), PartState::Active);
        st.manifest.save()?;
        self.publish(&st)?;
        info!(part = %name, "part activated");
        Ok(())
    }

    /// Installs a part received from a peer as `Prepared`.
    ///
    /// If the store already holds the part with the same checksum the call
    /// succeeds without writing anything.
    ///
    /// # Errors
    ///
    /// [`StoreError::ChecksumMismatch`] if the bytes do not match
    /// `expected_checksum`; [`StoreError::ResourceExhausted`] when over budget.
    pub fn import_part(&self, bytes: &[u8], name: &PartName, expected_checksum: u32) -> Result<PartMeta> {
        {
            let st = self.lock_state()?;
            if let Some(slot) = st.parts.get(name) {
                let actual = slot.reader.checksum();
                if actual != expected_checksum {
                    return Err(StoreError::ChecksumMismatch {
                        part: name.to_string(),
                        expected: expected_checksum,
                        actual,
                    }
                    .into());
                }
                return Ok(PartMeta {
                    name: name.clone(),
                    rows: slot.reader.rows(),
                    checksum: actual,
                    bytes: slot.bytes,
                });
            }
        }
        self.ensure_capacity(bytes.len() as u64)?;
        let meta = part::import_part(bytes, &self.table_dir, name, expected_checksum, self.config.fsync)
            .map_err(classify)?;
        self.register(&meta, PartState::Prepared)?;
        debug!(part = %name, rows = meta.rows, "imported part");
        Ok(meta)
    }

    /// Serializes a part for a peer. Any state will do as long as the files
    /// are still on disk.
    pub fn export_part(&self, name: &PartName) -> Result<Vec<u8>> {
        let reader = {
            let st = self.lock_state()?;
            match st.parts.get(name) {
                Some(slot) => Arc::clone(&slot.reader),
                None => return Err(StoreError::PartNotFound(name.clone()).into()),
            }
        };
        part::export_part(reader.dir(), name)
    }

    /// Deletes a part that never got activated (for example when announcing
    /// it failed). Parts in other states are left alone.
    pub fn discard_prepared(&self, name: &PartName) -> Result<bool> {
        let mut st = self.lock_state()?;
        let Some(slot) = st.parts.get(name) else {
            return Ok(false);
        };
        if slot.state != PartState::Prepared {
            return Ok(false);
        }
        let bytes = slot.bytes;
        st.parts.remove(name);
        st.manifest.remove(name);
        st.manifest.save()?;
        let _ = fs::remove_dir_all(name.dir_in(&self.table_dir));
        self.release_bytes(bytes);
        debug!(part = %name, "discarded prepared part");
        Ok(true)
    }
}
