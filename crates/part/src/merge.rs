//! K-way merge of sorted row streams and the engine transforms.
//!
//! [`MergeIterator`] interleaves several sorted sources by sort key. On equal
//! keys the source with the lower index comes first, and rows of one source
//! keep their order, so the output is a pure function of the inputs and
//! their order. [`Transformed`] then folds each run of equal keys according
//! to the table's [`ResolvedTransform`].

use anyhow::Result;
use rows::{KeyRange, ResolvedTransform, Row, SortKey, TableDef, Value};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use crate::{PartCursor, PartMeta, PartName, PartReader, PartWriter};

/// A pending row from one source.
struct HeapEntry {
    key: Vec<Value>,
    source: usize,
    row: Row,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: reverse both so the smallest key, then lowest source, pops first.
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges sorted row sources into one sorted stream.
pub struct MergeIterator<I> {
    sources: Vec<I>,
    key: SortKey,
    heap: BinaryHeap<HeapEntry>,
}

impl<I> MergeIterator<I>
where
    I: Iterator<Item = Result<Row>>,
{
    /// Primes the heap with the first row of every source.
    pub fn new(mut sources: Vec<I>, key: SortKey) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, it) in sources.iter_mut().enumerate() {
            if let Some(row) = it.next() {
                let row = row?;
                heap.push(HeapEntry {
                    key: key.extract(&row),
                    source,
                    row,
                });
            }
        }
        Ok(Self { sources, key, heap })
    }

    /// Returns the next row in merge order, or `None` when every source is
    /// exhausted.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(next) = self.sources[top.source].next() {
            let row = next?;
            self.heap.push(HeapEntry {
                key: self.key.extract(&row),
                source: top.source,
                row,
            });
        }
        Ok(Some(top.row))
    }

    #[must_use]
    pub fn sources(&self) -> &[I] {
        &self.sources
    }
}

impl<I> Iterator for MergeIterator<I>
where
    I: Iterator<Item = Result<Row>>,
{
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

/// Folds one run of rows that share a full sort key, given in merge order.
#[must_use]
pub fn fold_run(transform: &ResolvedTransform, mut run: Vec<Row>) -> Vec<Row> {
    match transform {
        ResolvedTransform::Plain => run,
        ResolvedTransform::Dedup { version } => {
            let mut best = 0;
            for (i, row) in run.iter().enumerate().skip(1) {
                // `>=` keeps the later row on a version tie.
                if row[*version] >= run[best][*version] {
                    best = i;
                }
            }
            vec![run.swap_remove(best)]
        }
        ResolvedTransform::Sum { columns } => {
            let mut rows = run.into_iter();
            let Some(mut acc) = rows.next() else {
                return Vec::new();
            };
            for row in rows {
                for &c in columns {
                    if let (Value::Int(a), Value::Int(b)) = (&acc[c], &row[c]) {
                        acc[c] = Value::Int(a.wrapping_add(*b));
                    }
                }
            }
            vec![acc]
        }
        ResolvedTransform::Collapse { sign } => {
            // Unmatched rows always share one sign, so the most recent
            // opposite-sign row is the top of the stack.
            let mut unmatched: Vec<Row> = Vec::new();
            for row in run {
                let s = row[*sign].as_int().unwrap_or(0);
                let cancels = unmatched
                    .last()
                    .map_or(false, |top| top[*sign].as_int().unwrap_or(0) == -s);
                if cancels {
                    unmatched.pop();
                } else {
                    unmatched.push(row);
                }
            }
            unmatched
        }
    }
}

/// Applies a transform to a sorted stream, one equal-key run at a time.
pub struct Transformed<I> {
    inner: I,
    key: SortKey,
    transform: ResolvedTransform,
    pending: Option<Row>,
    out: VecDeque<Row>,
}

impl<I> Transformed<I>
where
    I: Iterator<Item = Result<Row>>,
{
    pub fn new(inner: I, key: SortKey, transform: ResolvedTransform) -> Self {
        Self {
            inner,
            key,
            transform,
            pending: None,
            out: VecDeque::new(),
        }
    }

    fn fill(&mut self) -> Result<bool> {
        while self.out.is_empty() {
            let first = match self.pending.take() {
                Some(row) => row,
                None => match self.inner.next() {
                    Some(row) => row?,
                    None => return Ok(false),
                },
            };
            let mut run = vec![first];
            for next in self.inner.by_ref() {
                let row = next?;
                if self.key.compare(&run[0], &row) == Ordering::Equal {
                    run.push(row);
                } else {
                    self.pending = Some(row);
                    break;
                }
            }
            self.out.extend(fold_run(&self.transform, run));
        }
        Ok(true)
    }
}

impl<I> Iterator for Transformed<I>
where
    I: Iterator<Item = Result<Row>>,
{
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.fill() {
            Ok(true) => self.out.pop_front().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Merges `inputs` (already ordered by block range) into a new part under
/// `table_dir`, applying the table's transform.
///
/// The output depends only on the inputs' rows and the table definition, so
/// two replicas merging the same parts produce byte-identical results.
pub fn merge_parts(
    table_dir: &Path,
    inputs: &[Arc<PartReader>],
    def: &TableDef,
    fsync: bool,
) -> Result<PartMeta> {
    let names: Vec<PartName> = inputs.iter().map(|p| p.name().clone()).collect();
    let output = PartName::merged(&names)?;
    let key = def.sort_key()?;
    let all = KeyRange::all();
    let cursors: Vec<PartCursor> = inputs.iter().map(|p| p.cursor(&all, &key)).collect();
    let merged = MergeIterator::new(cursors, key.clone())?;
    let transformed = Transformed::new(merged, key, def.resolved_transform()?);

    let mut writer = PartWriter::create(table_dir, output, def, fsync)?;
    for row in transformed {
        writer.push(row?)?;
    }
    writer.finish()
}
