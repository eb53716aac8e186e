/// Cold-start path: bring the part directories and the manifest back into
/// agreement, verifying every part before it becomes readable again.
use anyhow::{Context, Result};
use part::{PartName, PartReader};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{PartSlot, PartState, PartStore};

/// Directory (inside the table directory) that receives broken parts.
pub const DETACHED_DIR: &str = "detached";

impl PartStore {
    pub(crate) fn recover(&self) -> Result<()> {
        let mut on_disk = self.scan_part_dirs()?;
        let mut st = self.lock_state()?;
        let listed: Vec<(PartName, PartState)> = st
            .manifest
            .entries
            .iter()
            .map(|(n, s)| (n.clone(), *s))
            .collect();

        let mut total_bytes = 0u64;
        for (name, state) in listed {
            let Some(dir) = on_disk.remove(&name) else {
                warn!(part = %name, "manifest lists a part that is not on disk");
                st.manifest.remove(&name);
                continue;
            };
            if state == PartState::Outdated {
                let _ = fs::remove_dir_all(&dir);
                st.manifest.remove(&name);
                continue;
            }
            match open_verified(&dir) {
                Ok(reader) => {
                    let bytes = dir_size(&dir);
                    total_bytes += bytes;
                    st.parts.insert(
                        name,
                        PartSlot {
                            reader: Arc::new(reader),
                            state,
                            bytes,
                        },
                    );
                }
                Err(e) => {
                    warn!(part = %name, error = %e, "part failed verification, detaching");
                    self.detach(&dir, &name);
                    st.manifest.remove(&name);
                }
            }
        }

        // Finished parts the manifest never heard of: a crash landed between
        // the directory rename and the manifest save.
        for (name, dir) in on_disk {
            let covered = st
                .parts
                .iter()
                .any(|(n, s)| s.state == PartState::Active && n != &name && n.covers(&name));
            if covered {
                let _ = fs::remove_dir_all(&dir);
                continue;
            }
            match open_verified(&dir) {
                Ok(reader) => {
                    info!(part = %name, "adopting orphan part as prepared");
                    let bytes = dir_size(&dir);
                    total_bytes += bytes;
                    st.manifest.set(name.clone(), PartState::Prepared);
                    st.parts.insert(
                        name,
                        PartSlot {
                            reader: Arc::new(reader),
                            state: PartState::Prepared,
                            bytes,
                        },
                    );
                }
                Err(e) => {
                    warn!(part = %name, error = %e, "removing unreadable orphan part");
                    let _ = fs::remove_dir_all(&dir);
                }
            }
        }

        self.bytes_used.store(total_bytes, Ordering::Relaxed);
        st.manifest.save()?;
        self.publish(&st)?;
        Ok(())
    }

    /// Lists finished part directories, removing `*.tmp` leftovers.
    fn scan_part_dirs(&self) -> Result<BTreeMap<PartName, PathBuf>> {
        let mut found = BTreeMap::new();
        for entry in fs::read_dir(&self.table_dir)
            .with_context(|| format!("listing {}", self.table_dir.display()))?
            .flatten()
        {
            let partition_dir = entry.path();
            if !partition_dir.is_dir() || entry.file_name() == DETACHED_DIR {
                continue;
            }
            for part in fs::read_dir(&partition_dir)?.flatten() {
                let path = part.path();
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if file_name.ends_with(".tmp") {
                    let _ = fs::remove_dir_all(&path);
                    continue;
                }
                match file_name.parse::<PartName>() {
                    Ok(name) if path.is_dir() => {
                        found.insert(name, path);
                    }
                    _ => warn!(path = %path.display(), "ignoring unexpected entry in partition directory"),
                }
            }
        }
        Ok(found)
    }

    fn detach(&self, dir: &Path, name: &PartName) {
        let detached = self.table_dir.join(DETACHED_DIR);
        let target = detached.join(name.to_string());
        let _ = fs::create_dir_all(&detached);
        let _ = fs::remove_dir_all(&target);
        if fs::rename(dir, &target).is_err() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    /// Names of parts moved aside because they failed verification.
    #[must_use]
    pub fn detached_parts(&self) -> Vec<String> {
        let mut out: Vec<String> = fs::read_dir(self.table_dir.join(DETACHED_DIR))
            .map(|it| {
                it.flatten()
                    .filter_map(|e| e.file_name().to_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }
}

fn open_verified(dir: &Path) -> Result<PartReader> {
    let reader = PartReader::open(dir)?;
    reader.verify()?;
    Ok(reader)
}

/// Total size of the files directly inside `dir`.
pub(crate) fn dir_size(dir: &Path) -> u64 {
    fs::read_dir(dir)
        .map(|it| {
            it.flatten()
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}
