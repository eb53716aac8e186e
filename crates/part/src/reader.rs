use anyhow::{anyhow, bail, Context, Result};
use rows::{KeyRange, Row, SortKey};
use sparse_index::PrimaryIndex;
use std::fs::{self, File};
use std::io::{BufReader, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::format::{crc_of, read_footer, read_granule, Checksums, DATA_FILE, INDEX_FILE};
use crate::{PartError, PartName};

/// An open, immutable part.
///
/// On [`open`](PartReader::open) the primary index and the checksums are
/// loaded into memory; granules are read on demand through a persistent file
/// handle wrapped in a `Mutex`, so reads work through a shared reference.
pub struct PartReader {
    name: PartName,
    dir: PathBuf,
    index: PrimaryIndex,
    checksums: Checksums,
    file: Mutex<BufReader<File>>,
}

impl PartReader {
    /// Opens the part stored in `dir`. The directory name is the part name.
    pub fn open(dir: &Path) -> Result<Self> {
        let name: PartName = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("bad part directory {}", dir.display()))?
            .parse()?;

        let checksums = Checksums::load(dir)?;

        let data_path = dir.join(DATA_FILE);
        let mut f = File::open(&data_path)
            .with_context(|| format!("opening {}", data_path.display()))?;
        let filesize = f.metadata()?.len();
        if filesize != checksums.data_size {
            bail!(
                "part {}: data.bin is {} bytes, checksums.txt says {}",
                name,
                filesize,
                checksums.data_size
            );
        }
        let (granules, rows) = read_footer(&mut f)?;
        if rows != checksums.rows {
            bail!("part {}: footer has {} rows, checksums.txt says {}", name, rows, checksums.rows);
        }

        let index_bytes = fs::read(dir.join(INDEX_FILE))?;
        let index = PrimaryIndex::read_from(&mut index_bytes.as_slice())
            .with_context(|| format!("loading primary index of part {}", name))?;
        if index.granule_count() != granules as usize || index.total_rows() != rows {
            bail!("part {}: primary index does not match data.bin footer", name);
        }

        f.seek(SeekFrom::Start(0))?;
        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            index,
            checksums,
            file: Mutex::new(BufReader::new(f)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &PartName {
        &self.name
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn rows(&self) -> u64 {
        self.checksums.rows
    }

    /// Part checksum: the CRC32 of `data.bin`.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.checksums.data_crc
    }

    /// Bytes of `data.bin` plus `primary.idx`.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.checksums.data_size + self.checksums.index_size
    }

    #[must_use]
    pub fn index(&self) -> &PrimaryIndex {
        &self.index
    }

    #[must_use]
    pub fn granule_count(&self) -> usize {
        self.index.granule_count()
    }

    /// Reads and decodes granule `i`.
    pub fn read_granule(&self, i: usize) -> Result<Vec<Row>> {
        let mark = self
            .index
            .marks()
            .get(i)
            .ok_or_else(|| anyhow!("part {}: no granule {}", self.name, i))?;
        let mut f = self.file.lock().map_err(|e| anyhow!("lock poisoned: {}", e))?;
        f.seek(SeekFrom::Start(mark.offset))?;
        let rows = read_granule(&mut *f)
            .with_context(|| format!("part {}: granule {}", self.name, i))?;
        if rows.len() != mark.rows as usize {
            bail!("part {}: granule {} has {} rows, index says {}", self.name, i, rows.len(), mark.rows);
        }
        Ok(rows)
    }

    /// Re-reads every file and compares it with `checksums.txt`.
    pub fn verify(&self) -> Result<()> {
        let data = fs::read(self.dir.join(DATA_FILE))?;
        let actual = crc_of(&data);
        if actual != self.checksums.data_crc {
            return Err(PartError::ChecksumMismatch {
                part: self.name.to_string(),
                expected: self.checksums.data_crc,
                actual,
            }
            .into());
        }
        let index = fs::read(self.dir.join(INDEX_FILE))?;
        let actual = crc_of(&index);
        if actual != self.checksums.index_crc {
            return Err(PartError::ChecksumMismatch {
                part: format!("{}/{}", self.name, INDEX_FILE),
                expected: self.checksums.index_crc,
                actual,
            }
            .into());
        }
        Ok(())
    }

    /// Granules that may hold keys in `range`.
    #[must_use]
    pub fn granules_for(&self, range: &KeyRange) -> Range<usize> {
        self.index.granules_for(range)
    }

    /// Lazy cursor over the rows of this part inside `range`.
    pub fn cursor(self: &Arc<Self>, range: &KeyRange, key: &SortKey) -> PartCursor {
        PartCursor {
            granules: self.granules_for(range),
            part: Arc::clone(self),
            range: range.clone(),
            key: key.clone(),
            buffer: Vec::new().into_iter(),
            granules_read: 0,
            done: false,
        }
    }

    /// Every row of the part, in order.
    pub fn read_all(&self) -> Result<Vec<Row>> {
        let mut out = Vec::with_capacity(self.rows() as usize);
        for i in 0..self.granule_count() {
            out.extend(self.read_granule(i)?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for PartReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartReader")
            .field("name", &self.name)
            .field("rows", &self.checksums.rows)
            .field("granules", &self.index.granule_count())
            .field("checksum", &format_args!("{:08x}", self.checksums.data_crc))
            .finish()
    }
}

/// Streams the rows of one part that fall inside a key range, one granule at
/// a time. Holds the part open for as long as it lives.
pub struct PartCursor {
    part: Arc<PartReader>,
    granules: Range<usize>,
    range: KeyRange,
    key: SortKey,
    buffer: std::vec::IntoIter<Row>,
    granules_read: usize,
    done: bool,
}

impl PartCursor {
    /// Granules decoded so far.
    #[must_use]
    pub fn granules_read(&self) -> usize {
        self.granules_read
    }

    #[must_use]
    pub fn part(&self) -> &Arc<PartReader> {
        &self.part
    }
}

impl Iterator for PartCursor {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if let Some(row) = self.buffer.next() {
                let key = self.key.extract(&row);
                if self.range.before_start(&key) {
                    continue;
                }
                if self.range.after_end(&key) {
                    self.done = true;
                    return None;
                }
                return Some(Ok(row));
            }
            let Some(i) = self.granules.next() else {
                self.done = true;
                return None;
            };
            match self.part.read_granule(i) {
                Ok(rows) => {
                    self.granules_read += 1;
                    self.buffer = rows.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
