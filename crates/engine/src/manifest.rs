//! # Manifest - part state metadata
//!
//! Records the state of every part the store knows about, so the active set
//! can be rebuilt after a restart.
//!
//! ## File Format
//!
//! One part per line, `<state>:<part name>`:
//!
//! ```text
//! # Tidepool part manifest
//! # Format: <state>:<part>
//! active:all_1_1_0
//! active:all_2_2_0
//! prepared:all_3_3_0
//! outdated:all_0_0_0
//! ```
//!
//! Lines starting with `#` are comments. Empty lines are ignored.
//!
//! ## Crash Safety
//!
//! Rewritten atomically: write `MANIFEST.tmp`, fsync, rename over `MANIFEST`.

use anyhow::{bail, Context, Result};
use part::PartName;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Name of the manifest file within the table directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";

/// Lifecycle state of a part.
///
/// ```text
/// Prepared ──activate / commit_merge──▶ Active ──merge / drop──▶ Outdated ──gc──▶ (deleted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartState {
    /// Durable on disk, not yet applied from the replication log.
    Prepared,
    /// Visible to reads and merges.
    Active,
    /// Superseded or dropped; deleted once no reader holds it.
    Outdated,
}

impl PartState {
    fn as_str(self) -> &'static str {
        match self {
            PartState::Prepared => "prepared",
            PartState::Active => "active",
            PartState::Outdated => "outdated",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "prepared" => Some(PartState::Prepared),
            "active" => Some(PartState::Active),
            "outdated" => Some(PartState::Outdated),
            _ => None,
        }
    }
}

/// In-memory copy of the manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    fsync: bool,
    pub entries: BTreeMap<PartName, PartState>,
}

impl Manifest {
    /// Loads `table_dir/MANIFEST`, or starts empty if it does not exist.
    pub fn load_or_create(table_dir: &Path, fsync: bool) -> Result<Self> {
        let path = table_dir.join(MANIFEST_FILENAME);
        let mut entries = BTreeMap::new();

        if path.exists() {
            let file = File::open(&path)
                .with_context(|| format!("failed to open manifest at {}", path.display()))?;
            for (line_num, line) in BufReader::new(file).lines().enumerate() {
                let line = line
                    .with_context(|| format!("failed to read manifest line {}", line_num + 1))?;
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                let (state, name) = trimmed.split_once(':').ok_or_else(|| {
                    anyhow::anyhow!(
                        "manifest line {}: invalid format (expected '<state>:<part>'): {}",
                        line_num + 1,
                        trimmed
                    )
                })?;
                let Some(state) = PartState::parse(state) else {
                    bail!("manifest line {}: unknown state '{}'", line_num + 1, state);
                };
                let name: PartName = name
                    .parse()
                    .with_context(|| format!("manifest line {}", line_num + 1))?;
                entries.insert(name, state);
            }
        }

        Ok(Self {
            path,
            fsync,
            entries,
        })
    }

    /// Persists the manifest (tmp file + rename).
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_file_name(MANIFEST_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("failed to create manifest tmp at {}", tmp_path.display()))?;
            writeln!(f, "# Tidepool part manifest")?;
            writeln!(f, "# Format: <state>:<part>")?;
            for (name, state) in &self.entries {
                writeln!(f, "{}:{}", state.as_str(), name)?;
            }
            f.flush()?;
            if self.fsync {
                f.sync_all()?;
            }
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to install manifest at {}", self.path.display()))?;
        Ok(())
    }

    pub fn set(&mut self, name: PartName, state: PartState) {
        self.entries.insert(name, state);
    }

    pub fn remove(&mut self, name: &PartName) {
        self.entries.remove(name);
    }

    #[must_use]
    pub fn state_of(&self, name: &PartName) -> Option<PartState> {
        self.entries.get(name).copied()
    }

    /// Names in `state`, in name order.
    #[must_use]
    pub fn names_in(&self, state: PartState) -> Vec<&PartName> {
        self.entries
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(n, _)| n)
            .collect()
    }
}
