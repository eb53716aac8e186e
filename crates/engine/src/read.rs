/// Read path: range scans over a snapshot of the active set.
///
/// A scan pins the `Arc<ActiveSet>` it started from, so merges and drops that
/// commit while it runs stay invisible to it and the parts it reads are not
/// deleted underneath it. Rows come out in sort-key order across all parts;
/// no merge transform is applied at read time.
use anyhow::Result;
use part::{MergeIterator, PartCursor, PartName};
use rows::{KeyRange, Row, SortKey, Value};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{ActiveSet, PartStore};

/// Where a scan stopped. Feed it to [`PartStore::resume`] to continue.
#[derive(Debug, Clone)]
pub struct ScanCursor {
    snapshot: Arc<ActiveSet>,
    range: KeyRange,
    last_key: Option<Vec<Value>>,
    emitted_at_key: usize,
}

impl ScanCursor {
    /// Sort key of the last row returned, if any.
    #[must_use]
    pub fn last_key(&self) -> Option<&[Value]> {
        self.last_key.as_deref()
    }
}

/// Lazy iterator over the rows in a key range.
pub struct RowScan {
    snapshot: Arc<ActiveSet>,
    range: KeyRange,
    rows: MergeIterator<PartCursor>,
    key: SortKey,
    last_key: Option<Vec<Value>>,
    emitted_at_key: usize,
    skip: Option<(Vec<Value>, usize)>,
    store_counter: Arc<AtomicU64>,
}

impl RowScan {
    fn start(
        snapshot: Arc<ActiveSet>,
        range: KeyRange,
        key: SortKey,
        store_counter: Arc<AtomicU64>,
    ) -> Result<Self> {
        let cursors: Vec<PartCursor> = snapshot
            .parts
            .iter()
            .map(|p| p.cursor(&range, &key))
            .collect();
        let rows = MergeIterator::new(cursors, key.clone())?;
        Ok(Self {
            snapshot,
            range,
            rows,
            key,
            last_key: None,
            emitted_at_key: 0,
            skip: None,
            store_counter,
        })
    }

    /// Granules decoded by this scan so far.
    #[must_use]
    pub fn granules_read(&self) -> usize {
        self.rows.sources().iter().map(PartCursor::granules_read).sum()
    }

    /// Number of parts the scan reads from.
    #[must_use]
    pub fn part_count(&self) -> usize {
        self.snapshot.parts.len()
    }

    /// Position to restart from.
    #[must_use]
    pub fn cursor(&self) -> ScanCursor {
        ScanCursor {
            snapshot: Arc::clone(&self.snapshot),
            range: self.range.clone(),
            last_key: self.last_key.clone(),
            emitted_at_key: self.emitted_at_key,
        }
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            let Some(row) = self.rows.next_row()? else {
                return Ok(None);
            };
            let key = self.key.extract(&row);

            if let Some((skip_key, remaining)) = &mut self.skip {
                if *skip_key == key && *remaining > 0 {
                    *remaining -= 1;
                    self.emitted_at_key += 1;
                    continue;
                }
                self.skip = None;
            }

            if self.last_key.as_ref() == Some(&key) {
                self.emitted_at_key += 1;
            } else {
                self.last_key = Some(key);
                self.emitted_at_key = 1;
            }
            return Ok(Some(row));
        }
    }
}

impl Iterator for RowScan {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for RowScan {
    fn drop(&mut self) {
        self.store_counter
            .fetch_add(self.granules_read() as u64, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for RowScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowScan")
            .field("range", &self.range)
            .field("parts", &self.snapshot.parts.len())
            .field("granules_read", &self.granules_read())
            .finish()
    }
}

impl PartStore {
    /// Scans the rows of every active part whose keys fall in `range`.
    ///
    /// Only granules the primary index cannot rule out are read.
    pub fn scan(&self, range: &KeyRange) -> Result<RowScan> {
        let key = self.def().sort_key()?;
        RowScan::start(self.snapshot(), range.clone(), key, Arc::clone(&self.granules_read))
    }

    /// Continues a scan where `cursor` left off, on the same snapshot.
    pub fn resume(&self, cursor: ScanCursor) -> Result<RowScan> {
        let key = self.def().sort_key()?;
        let Some(last_key) = cursor.last_key else {
            return RowScan::start(cursor.snapshot, cursor.range, key, Arc::clone(&self.granules_read));
        };
        // Restart at the last key itself; rows already returned for it are skipped.
        let narrowed = KeyRange {
            start: Bound::Included(last_key.clone()),
            end: cursor.range.end.clone(),
        };
        let mut scan = RowScan::start(cursor.snapshot, narrowed, key, Arc::clone(&self.granules_read))?;
        scan.range = cursor.range;
        scan.skip = Some((last_key.clone(), cursor.emitted_at_key));
        scan.last_key = Some(last_key);
        scan.emitted_at_key = 0;
        Ok(scan)
    }

    /// Active parts, optionally of one partition, in block order.
    #[must_use]
    pub fn active_parts(&self, partition: Option<&str>) -> Vec<PartName> {
        self.snapshot()
            .parts
            .iter()
            .map(|p| p.name().clone())
            .filter(|n| partition.map_or(true, |p| n.partition == p))
            .collect()
    }

    /// Active parts with their row counts.
    #[must_use]
    pub fn active_part_rows(&self) -> Vec<(PartName, u64)> {
        self.snapshot()
            .parts
            .iter()
            .map(|p| (p.name().clone(), p.rows()))
            .collect()
    }

    /// Rows over all active parts.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.snapshot().rows()
    }

    /// Every active row in key order.
    pub fn read_all(&self) -> Result<Vec<Row>> {
        self.scan(&KeyRange::all())?.collect()
    }
}
