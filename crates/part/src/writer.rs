use anyhow::{bail, Context, Result};
use crc32fast::Hasher as Crc32;
use rows::{Row, SortKey, TableDef, Value};
use sparse_index::{Mark, PrimaryIndex};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::format::{sync_dir, write_footer, write_granule, Checksums, CHECKSUMS_FILE, DATA_FILE, INDEX_FILE};
use crate::PartName;

/// What a finished write produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartMeta {
    pub name: PartName,
    pub rows: u64,
    /// CRC32 of `data.bin`; equal across replicas for equal rows.
    pub checksum: u32,
    /// Bytes on disk over all part files.
    pub bytes: u64,
}

/// Streams sorted rows into a new part directory.
///
/// Files are written to `{part}.tmp/`, fsynced (if enabled) and the
/// directory is renamed into place by [`finish`](PartWriter::finish). A
/// writer dropped before `finish` removes its temporary directory; a crash
/// leaves it behind for recovery to clean up.
pub struct PartWriter {
    name: PartName,
    final_dir: PathBuf,
    tmp_dir: PathBuf,
    data: BufWriter<File>,
    data_crc: Crc32,
    offset: u64,
    key: SortKey,
    granule_rows: usize,
    pending: Vec<Row>,
    last_key: Option<Vec<Value>>,
    index: PrimaryIndex,
    rows: u64,
    fsync: bool,
    finished: bool,
}

impl PartWriter {
    /// Starts a part named `name` under `table_dir`, using the table's sort
    /// key and granule size.
    pub fn create(table_dir: &Path, name: PartName, def: &TableDef, fsync: bool) -> Result<Self> {
        let final_dir = name.dir_in(table_dir);
        if final_dir.exists() {
            bail!("part {} already exists", name);
        }
        let tmp_dir = final_dir.with_extension("tmp");
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("creating {}", tmp_dir.display()))?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_dir.join(DATA_FILE))?;

        Ok(Self {
            name,
            final_dir,
            tmp_dir,
            data: BufWriter::new(file),
            data_crc: Crc32::new(),
            offset: 0,
            key: def.sort_key()?,
            granule_rows: def.granule_rows.max(1),
            pending: Vec::with_capacity(def.granule_rows.clamp(1, 8192)),
            last_key: None,
            index: PrimaryIndex::new(),
            rows: 0,
            fsync,
            finished: false,
        })
    }

    /// Appends one row. Rows must arrive in non-decreasing sort-key order.
    pub fn push(&mut self, row: Row) -> Result<()> {
        let key = self.key.extract(&row);
        if let Some(last) = &self.last_key {
            if *last > key {
                bail!("rows are not sorted by the sort key (part {})", self.name);
            }
        }
        self.last_key = Some(key);
        self.pending.push(row);
        self.rows += 1;
        if self.pending.len() >= self.granule_rows {
            self.flush_granule()?;
        }
        Ok(())
    }

    fn flush_granule(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        let len = write_granule(&mut buf, &self.pending)?;
        self.write_data(&buf)?;
        self.index.push(Mark {
            key: self.key.extract(&self.pending[0]),
            offset: self.offset,
            rows: self.pending.len() as u32,
        });
        self.offset += len;
        self.pending.clear();
        Ok(())
    }

    fn write_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.data.write_all(bytes)?;
        self.data_crc.update(bytes);
        Ok(())
    }

    /// Completes the part and moves it into place.
    pub fn finish(mut self) -> Result<PartMeta> {
        self.flush_granule()?;

        let mut footer = Vec::with_capacity(16);
        write_footer(&mut footer, self.index.granule_count() as u32, self.rows)?;
        self.write_data(&footer)?;
        self.data.flush()?;
        if self.fsync {
            self.data.get_ref().sync_all()?;
        }
        let data_size = self.offset + footer.len() as u64;
        let data_crc = self.data_crc.clone().finalize();

        let mut index_bytes = Vec::new();
        self.index.write_to(&mut index_bytes)?;
        let checksums = Checksums {
            data_size,
            data_crc,
            index_size: index_bytes.len() as u64,
            index_crc: crate::format::crc_of(&index_bytes),
            rows: self.rows,
        };
        let checksums_text = checksums.render();
        write_file(&self.tmp_dir.join(INDEX_FILE), &index_bytes, self.fsync)?;
        write_file(&self.tmp_dir.join(CHECKSUMS_FILE), checksums_text.as_bytes(), self.fsync)?;

        if self.fsync {
            sync_dir(&self.tmp_dir);
        }
        fs::rename(&self.tmp_dir, &self.final_dir).with_context(|| {
            format!("renaming {} into place", self.tmp_dir.display())
        })?;
        if self.fsync {
            if let Some(parent) = self.final_dir.parent() {
                sync_dir(parent);
            }
        }
        self.finished = true;

        Ok(PartMeta {
            name: self.name.clone(),
            rows: self.rows,
            checksum: data_crc,
            bytes: data_size + index_bytes.len() as u64 + checksums_text.len() as u64,
        })
    }
}

impl Drop for PartWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_dir_all(&self.tmp_dir);
        }
    }
}

impl std::fmt::Debug for PartWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartWriter")
            .field("name", &self.name)
            .field("rows", &self.rows)
            .field("granules", &self.index.granule_count())
            .finish()
    }
}

/// Writes `bytes` to `path`, optionally fsyncing.
pub(crate) fn write_file(path: &Path, bytes: &[u8], fsync: bool) -> Result<()> {
    let mut f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    f.write_all(bytes)?;
    if fsync {
        f.sync_all()?;
    }
    Ok(())
}

/// Writes a whole part from an iterator of sorted rows.
pub fn write_part<I>(table_dir: &Path, name: PartName, def: &TableDef, rows: I, fsync: bool) -> Result<PartMeta>
where
    I: IntoIterator<Item = Row>,
{
    let mut w = PartWriter::create(table_dir, name, def, fsync)?;
    for row in rows {
        w.push(row)?;
    }
    w.finish()
}
