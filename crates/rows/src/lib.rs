//! # Rows - values, rows and table definitions
//!
//! The smallest vocabulary shared by every other crate: a column [`Value`],
//! a [`Row`] (one value per column, in column order), the [`TableDef`] that
//! says how rows are ordered, partitioned and merged, and the [`KeyRange`]
//! predicate used by range reads.
//!
//! ## Ordering
//!
//! Rows inside a part are ordered by the table's sort key: the listed columns
//! compared left to right with [`Value`]'s total order (`Int` sorts before
//! `Str`, then natural order within a type). Rows with equal keys may repeat;
//! their relative order is preserved by every sort and merge so that the
//! result is a pure function of the input.
//!
//! ## Binary encoding
//!
//! [`codec`] writes values, rows and table definitions in little-endian with
//! explicit length prefixes, the same framing style used by the part files and
//! the replication log.

pub mod codec;
mod range;
mod table;

pub use range::KeyRange;
pub use table::{Column, ColumnType, PartitionBy, ResolvedTransform, SortKey, TableDef, Transform};

use std::fmt;

/// A single column value.
///
/// Variant order matters: the derived `Ord` places every `Int` before every
/// `Str`, giving one total order across both types.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    /// Returns the integer payload, or `None` for strings.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Str(_) => None,
        }
    }

    /// Returns the column type this value belongs to.
    #[must_use]
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Int(_) => ColumnType::Int,
            Value::Str(_) => ColumnType::Str,
        }
    }

    /// Approximate in-memory footprint, used for size accounting.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        match self {
            Value::Int(_) => 8,
            Value::Str(s) => 4 + s.len(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// One row: a value per column, in the table's column order.
pub type Row = Vec<Value>;

/// Builds a [`Row`] from a list of expressions convertible into [`Value`].
///
/// ```
/// use rows::{row, Value};
///
/// let r = row![1, "a", 7];
/// assert_eq!(r, vec![Value::Int(1), Value::Str("a".into()), Value::Int(7)]);
/// ```
#[macro_export]
macro_rules! row {
    ($($v:expr),* $(,)?) => {
        vec![$($crate::Value::from($v)),*]
    };
}

/// Approximate in-memory footprint of a row.
#[must_use]
pub fn row_size(row: &Row) -> usize {
    row.iter().map(Value::approx_size).sum()
}

#[cfg(test)]
mod tests;
