//! Table definitions: columns, sort key, partitioning and merge transform.

use anyhow::{bail, ensure, Result};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::{Row, Value};

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int,
    Str,
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn int(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ColumnType::Int,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ColumnType::Str,
        }
    }
}

/// How rows are grouped into partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionBy {
    /// Every row lands in the single partition `all`.
    Single,
    /// One partition per distinct value of the column.
    Column(String),
    /// Integer bucket: `floor(value / width)` (e.g. a time bucket).
    IntDiv { column: String, width: i64 },
}

/// Engine transform applied to rows that share a full sort key during a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Keep every row.
    Plain,
    /// Keep only the row with the greatest `version`.
    Dedup { version: String },
    /// Sum `columns`; other columns keep the first row's value.
    Sum { columns: Vec<String> },
    /// `sign` is +1/-1; opposite-sign pairs cancel.
    Collapse { sign: String },
}

/// [`Transform`] with column names resolved to positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTransform {
    Plain,
    Dedup { version: usize },
    Sum { columns: Vec<usize> },
    Collapse { sign: usize },
}

/// Sort key resolved to column positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    columns: Vec<usize>,
}

impl SortKey {
    /// Compares two rows by the key columns only.
    #[must_use]
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for &c in &self.columns {
            match a[c].cmp(&b[c]) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Copies the key columns out of `row`.
    #[must_use]
    pub fn extract(&self, row: &Row) -> Vec<Value> {
        self.columns.iter().map(|&c| row[c].clone()).collect()
    }

    /// Number of key columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// `true` if `rows` is in non-decreasing key order.
    #[must_use]
    pub fn is_sorted(&self, rows: &[Row]) -> bool {
        rows.windows(2)
            .all(|w| self.compare(&w[0], &w[1]) != Ordering::Greater)
    }

    /// Stable sort by key: rows with equal keys keep their input order.
    pub fn sort(&self, rows: &mut [Row]) {
        rows.sort_by(|a, b| self.compare(a, b));
    }
}

/// Definition of a replicated table.
///
/// Built with the consuming setters:
///
/// ```
/// use rows::{Column, TableDef, Transform};
///
/// let def = TableDef::new("hits", vec![Column::int("id"), Column::int("ver")])
///     .with_sort_key(&["id"])
///     .with_transform(Transform::Dedup { version: "ver".into() });
/// def.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<Column>,
    pub sort_key: Vec<String>,
    pub partition_by: PartitionBy,
    pub transform: Transform,
    /// Rows per granule. Part bytes depend on it, so every replica uses the
    /// value stored in the definition rather than local configuration.
    pub granule_rows: usize,
    /// Replica names that hold this table. Empty means every replica.
    pub replicas: Vec<String>,
}

impl TableDef {
    /// A plain table sorted by its first column, one partition, 8192-row granules.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        let sort_key = columns.first().map(|c| vec![c.name.clone()]).unwrap_or_default();
        Self {
            name: name.into(),
            columns,
            sort_key,
            partition_by: PartitionBy::Single,
            transform: Transform::Plain,
            granule_rows: 8192,
            replicas: Vec::new(),
        }
    }

    pub fn with_sort_key(mut self, columns: &[&str]) -> Self {
        self.sort_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_partition(mut self, partition_by: PartitionBy) -> Self {
        self.partition_by = partition_by;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_granule_rows(mut self, granule_rows: usize) -> Self {
        self.granule_rows = granule_rows;
        self
    }

    pub fn with_replicas(mut self, replicas: &[&str]) -> Self {
        self.replicas = replicas.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| anyhow::anyhow!("table {}: unknown column '{}'", self.name, name))
    }

    fn int_column(&self, name: &str, role: &str) -> Result<usize> {
        let idx = self.column_index(name)?;
        ensure!(
            self.columns[idx].ty == ColumnType::Int,
            "table {}: {} column '{}' must be Int",
            self.name,
            role,
            name
        );
        Ok(idx)
    }

    /// Resolves the sort key to column positions.
    pub fn sort_key(&self) -> Result<SortKey> {
        let columns = self
            .sort_key
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(SortKey { columns })
    }

    /// Resolves the transform's column names to positions.
    pub fn resolved_transform(&self) -> Result<ResolvedTransform> {
        Ok(match &self.transform {
            Transform::Plain => ResolvedTransform::Plain,
            Transform::Dedup { version } => ResolvedTransform::Dedup {
                version: self.int_column(version, "version")?,
            },
            Transform::Sum { columns } => ResolvedTransform::Sum {
                columns: columns
                    .iter()
                    .map(|c| self.int_column(c, "sum"))
                    .collect::<Result<Vec<_>>>()?,
            },
            Transform::Collapse { sign } => ResolvedTransform::Collapse {
                sign: self.int_column(sign, "sign")?,
            },
        })
    }

    /// Checks the definition is internally consistent.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.name.is_empty(), "table name must not be empty");
        ensure!(
            self.name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
            "table name '{}' may only contain [A-Za-z0-9_-]",
            self.name
        );
        ensure!(!self.columns.is_empty(), "table {}: no columns", self.name);
        let mut seen = HashSet::new();
        for c in &self.columns {
            ensure!(!c.name.is_empty(), "table {}: empty column name", self.name);
            ensure!(
                seen.insert(c.name.as_str()),
                "table {}: duplicate column '{}'",
                self.name,
                c.name
            );
        }
        ensure!(!self.sort_key.is_empty(), "table {}: empty sort key", self.name);
        self.sort_key()?;
        ensure!(self.granule_rows > 0, "table {}: granule_rows must be > 0", self.name);

        match &self.partition_by {
            PartitionBy::Single => {}
            PartitionBy::Column(c) => {
                self.column_index(c)?;
            }
            PartitionBy::IntDiv { column, width } => {
                self.int_column(column, "partition")?;
                ensure!(*width > 0, "table {}: partition width must be > 0", self.name);
            }
        }

        let in_key = |name: &str| self.sort_key.iter().any(|k| k == name);
        match &self.transform {
            Transform::Plain => {}
            Transform::Dedup { version } => {
                ensure!(!in_key(version), "version column '{}' is part of the sort key", version);
            }
            Transform::Sum { columns } => {
                ensure!(!columns.is_empty(), "table {}: sum transform without columns", self.name);
                for c in columns {
                    ensure!(!in_key(c), "sum column '{}' is part of the sort key", c);
                }
            }
            Transform::Collapse { sign } => {
                ensure!(!in_key(sign), "sign column '{}' is part of the sort key", sign);
            }
        }
        self.resolved_transform()?;
        Ok(())
    }

    /// Checks that `row` matches the column list (and the sign domain for
    /// collapsing tables).
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        ensure!(
            row.len() == self.columns.len(),
            "table {}: expected {} columns, got {}",
            self.name,
            self.columns.len(),
            row.len()
        );
        for (value, column) in row.iter().zip(&self.columns) {
            if value.column_type() != column.ty {
                bail!(
                    "table {}: column '{}' expects {:?}, got {:?}",
                    self.name,
                    column.name,
                    column.ty,
                    value.column_type()
                );
            }
        }
        if let Transform::Collapse { sign } = &self.transform {
            let idx = self.column_index(sign)?;
            match row[idx].as_int() {
                Some(1) | Some(-1) => {}
                other => bail!("table {}: sign must be +1 or -1, got {:?}", self.name, other),
            }
        }
        Ok(())
    }

    /// Partition id of a row. Ids are safe to use as directory names.
    pub fn partition_of(&self, row: &Row) -> Result<String> {
        Ok(match &self.partition_by {
            PartitionBy::Single => "all".to_string(),
            PartitionBy::Column(c) => match &row[self.column_index(c)?] {
                Value::Int(v) => v.to_string(),
                Value::Str(s) => escape_partition(s),
            },
            PartitionBy::IntDiv { column, width } => {
                let idx = self.column_index(column)?;
                match row[idx] {
                    Value::Int(v) => v.div_euclid(*width).to_string(),
                    Value::Str(_) => bail!("partition column '{}' is not Int", column),
                }
            }
        })
    }

    /// Checks `next` may replace `self` through an alteration: columns, sort
    /// key and partitioning are fixed for the life of the table.
    pub fn check_alter(&self, next: &TableDef) -> Result<()> {
        ensure!(self.name == next.name, "cannot rename table {} to {}", self.name, next.name);
        ensure!(self.columns == next.columns, "table {}: columns cannot change", self.name);
        ensure!(self.sort_key == next.sort_key, "table {}: sort key cannot change", self.name);
        ensure!(
            self.partition_by == next.partition_by,
            "table {}: partitioning cannot change",
            self.name
        );
        next.validate()
    }

    /// `true` if `replica` holds this table.
    #[must_use]
    pub fn has_replica(&self, replica: &str) -> bool {
        self.replicas.is_empty() || self.replicas.iter().any(|r| r == replica)
    }
}

/// Maps an arbitrary string onto `[A-Za-z0-9-]`, percent-escaping other bytes.
fn escape_partition(s: &str) -> String {
    if s.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
