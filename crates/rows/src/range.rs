use std::cmp::Ordering;
use std::ops::Bound;

use crate::Value;

/// A range over sort-key tuples.
///
/// Bounds may be *prefixes* of the sort key: with a key of `(site, ts)`, the
/// bound `Included([site=3])` compares only the first column, so
/// `KeyRange::prefix(vec![3.into()])` selects every row of site 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Vec<Value>>,
    pub end: Bound<Vec<Value>>,
}

impl KeyRange {
    /// The unbounded range.
    #[must_use]
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// `start <= key <= end` on the given prefixes.
    #[must_use]
    pub fn between(start: Vec<Value>, end: Vec<Value>) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Included(end),
        }
    }

    /// Every key whose leading columns equal `prefix`.
    #[must_use]
    pub fn prefix(prefix: Vec<Value>) -> Self {
        Self {
            start: Bound::Included(prefix.clone()),
            end: Bound::Included(prefix),
        }
    }

    /// `key >= start`.
    #[must_use]
    pub fn from(start: Vec<Value>) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Unbounded,
        }
    }

    /// `key < end`.
    #[must_use]
    pub fn until(end: Vec<Value>) -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Excluded(end),
        }
    }

    /// `true` if `key` sorts before every key in the range.
    #[must_use]
    pub fn before_start(&self, key: &[Value]) -> bool {
        match &self.start {
            Bound::Unbounded => false,
            Bound::Included(b) => cmp_prefix(key, b) == Ordering::Less,
            Bound::Excluded(b) => cmp_prefix(key, b) != Ordering::Greater,
        }
    }

    /// `true` if `key` sorts after every key in the range.
    #[must_use]
    pub fn after_end(&self, key: &[Value]) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(b) => cmp_prefix(key, b) == Ordering::Greater,
            Bound::Excluded(b) => cmp_prefix(key, b) != Ordering::Less,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &[Value]) -> bool {
        !self.before_start(key) && !self.after_end(key)
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Compares `key` with `bound` over the bound's columns only.
fn cmp_prefix(key: &[Value], bound: &[Value]) -> Ordering {
    for (k, b) in key.iter().zip(bound) {
        match k.cmp(b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
