use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Identity of a data part: `{partition}_{min_block}_{max_block}_{level}`.
///
/// A freshly inserted part covers a single block (`min == max`, level 0).
/// A merge output covers the union of its inputs' block ranges and sits one
/// level above the highest input. Names sort by partition then block range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartName {
    pub partition: String,
    pub min_block: u64,
    pub max_block: u64,
    pub level: u32,
}

impl PartName {
    /// Name of a new part holding exactly one block.
    pub fn new(partition: impl Into<String>, block: u64) -> Self {
        Self {
            partition: partition.into(),
            min_block: block,
            max_block: block,
            level: 0,
        }
    }

    /// Name of the part produced by merging `inputs`.
    ///
    /// Fails if `inputs` is empty or spans several partitions.
    pub fn merged(inputs: &[PartName]) -> Result<Self> {
        let first = inputs.first().ok_or_else(|| anyhow!("merge without inputs"))?;
        if inputs.iter().any(|p| p.partition != first.partition) {
            bail!("merge inputs span several partitions");
        }
        Ok(Self {
            partition: first.partition.clone(),
            min_block: inputs.iter().map(|p| p.min_block).min().unwrap_or(first.min_block),
            max_block: inputs.iter().map(|p| p.max_block).max().unwrap_or(first.max_block),
            level: inputs.iter().map(|p| p.level).max().unwrap_or(0) + 1,
        })
    }

    /// `true` if this part's block range contains `other`'s.
    #[must_use]
    pub fn covers(&self, other: &PartName) -> bool {
        self.partition == other.partition
            && self.min_block <= other.min_block
            && other.max_block <= self.max_block
    }

    /// `true` if the block ranges overlap.
    #[must_use]
    pub fn overlaps(&self, other: &PartName) -> bool {
        self.partition == other.partition
            && self.min_block <= other.max_block
            && other.min_block <= self.max_block
    }

    /// Directory of this part under a table directory.
    #[must_use]
    pub fn dir_in(&self, table_dir: &Path) -> PathBuf {
        table_dir.join(&self.partition).join(self.to_string())
    }
}

impl fmt::Display for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.partition, self.min_block, self.max_block, self.level
        )
    }
}

impl FromStr for PartName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut it = s.rsplitn(4, '_');
        let level = it.next().context("missing level")?;
        let max = it.next().context("missing max block")?;
        let min = it.next().context("missing min block")?;
        let partition = it.next().context("missing partition")?;
        if partition.is_empty() {
            bail!("empty partition in part name '{}'", s);
        }
        let name = Self {
            partition: partition.to_string(),
            min_block: min.parse().with_context(|| format!("bad min block in '{}'", s))?,
            max_block: max.parse().with_context(|| format!("bad max block in '{}'", s))?,
            level: level.parse().with_context(|| format!("bad level in '{}'", s))?,
        };
        if name.min_block > name.max_block {
            bail!("inverted block range in part name '{}'", s);
        }
        Ok(name)
    }
}
