//! Part file names, granule framing and the `data.bin` footer.
//!
//! ## Granule record
//!
//! ```text
//! [crc32: u32][rows: u32][body_len: u32][body]
//! ```
//!
//! The CRC covers everything after itself (`rows` through end of body).
//!
//! ## Footer (16 bytes)
//!
//! ```text
//! [granules: u32 LE][rows: u64 LE][magic: u32 LE "PRT1"]
//! ```

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use rows::codec::{read_row, write_row};
use rows::Row;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Magic number identifying a part data file (ASCII "PRT1").
pub const PART_MAGIC: u32 = 0x5052_5431;

/// Size of the `data.bin` footer in bytes.
pub const FOOTER_BYTES: u64 = 4 + 8 + 4;

pub const DATA_FILE: &str = "data.bin";
pub const INDEX_FILE: &str = "primary.idx";
pub const CHECKSUMS_FILE: &str = "checksums.txt";

/// Every file a complete part directory holds, in bundle order.
pub const PART_FILES: [&str; 3] = [DATA_FILE, INDEX_FILE, CHECKSUMS_FILE];

/// Largest granule body accepted while reading (256 MiB).
const MAX_GRANULE_BYTES: usize = 256 * 1024 * 1024;

/// Encodes one granule record into `out`. Returns the bytes appended.
pub fn write_granule(out: &mut Vec<u8>, rows: &[Row]) -> Result<u64> {
    let mut body = Vec::with_capacity(rows.len() * 32);
    for row in rows {
        write_row(&mut body, row)?;
    }

    let mut record = Vec::with_capacity(body.len() + 8);
    record.write_u32::<LittleEndian>(rows.len() as u32)?;
    record.write_u32::<LittleEndian>(body.len() as u32)?;
    record.extend_from_slice(&body);

    let mut hasher = Crc32::new();
    hasher.update(&record);

    let start = out.len();
    out.write_u32::<LittleEndian>(hasher.finalize())?;
    out.extend_from_slice(&record);
    Ok((out.len() - start) as u64)
}

/// Reads and verifies the granule record at the reader's current position.
pub fn read_granule<R: Read>(r: &mut R) -> Result<Vec<Row>> {
    let expected_crc = r.read_u32::<LittleEndian>()?;
    let rows = r.read_u32::<LittleEndian>()?;
    let body_len = r.read_u32::<LittleEndian>()? as usize;
    if body_len > MAX_GRANULE_BYTES {
        bail!("corrupt granule: body_len {} exceeds maximum {}", body_len, MAX_GRANULE_BYTES);
    }
    let mut body = vec![0u8; body_len];
    r.read_exact(&mut body)?;

    let mut hasher = Crc32::new();
    hasher.update(&rows.to_le_bytes());
    hasher.update(&(body_len as u32).to_le_bytes());
    hasher.update(&body);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        bail!(
            "granule CRC32 mismatch: expected {:#010x}, got {:#010x} (data corruption)",
            expected_crc,
            actual_crc
        );
    }

    let mut cur = body.as_slice();
    let mut out = Vec::with_capacity(rows as usize);
    for _ in 0..rows {
        out.push(read_row(&mut cur)?);
    }
    if !cur.is_empty() {
        bail!("corrupt granule: trailing bytes after {} rows", rows);
    }
    Ok(out)
}

pub fn write_footer<W: Write>(w: &mut W, granules: u32, rows: u64) -> Result<()> {
    w.write_u32::<LittleEndian>(granules)?;
    w.write_u64::<LittleEndian>(rows)?;
    w.write_u32::<LittleEndian>(PART_MAGIC)?;
    Ok(())
}

/// Reads the footer, returning `(granules, rows)`.
pub fn read_footer<R: Read + Seek>(r: &mut R) -> Result<(u32, u64)> {
    let filesize = r.seek(SeekFrom::End(0))?;
    if filesize < FOOTER_BYTES {
        bail!("file too small for part footer");
    }
    r.seek(SeekFrom::End(-(FOOTER_BYTES as i64)))?;
    let granules = r.read_u32::<LittleEndian>()?;
    let rows = r.read_u64::<LittleEndian>()?;
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != PART_MAGIC {
        bail!("unknown part magic: {:#x}", magic);
    }
    Ok((granules, rows))
}

/// CRC32 of a byte buffer.
#[must_use]
pub fn crc_of(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Parsed `checksums.txt`.
///
/// ```text
/// # part checksums
/// data.bin 1234 0a1b2c3d
/// primary.idx 56 deadbeef
/// rows 12
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksums {
    pub data_size: u64,
    pub data_crc: u32,
    pub index_size: u64,
    pub index_crc: u32,
    pub rows: u64,
}

impl Checksums {
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "# part checksums\n{} {} {:08x}\n{} {} {:08x}\nrows {}\n",
            DATA_FILE, self.data_size, self.data_crc, INDEX_FILE, self.index_size, self.index_crc, self.rows
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut data = None;
        let mut index = None;
        let mut rows = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [file, size, crc] => {
                    let size: u64 = size.parse().context("bad file size in checksums.txt")?;
                    let crc = u32::from_str_radix(crc, 16).context("bad crc in checksums.txt")?;
                    match *file {
                        DATA_FILE => data = Some((size, crc)),
                        INDEX_FILE => index = Some((size, crc)),
                        other => bail!("unexpected file '{}' in checksums.txt", other),
                    }
                }
                ["rows", n] => rows = Some(n.parse().context("bad row count in checksums.txt")?),
                _ => bail!("malformed checksums.txt line: '{}'", line),
            }
        }
        let (data_size, data_crc) = data.context("checksums.txt lacks data.bin")?;
        let (index_size, index_crc) = index.context("checksums.txt lacks primary.idx")?;
        Ok(Self {
            data_size,
            data_crc,
            index_size,
            index_crc,
            rows: rows.context("checksums.txt lacks rows")?,
        })
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CHECKSUMS_FILE);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text)
    }
}

/// Fsyncs a directory so renames inside it are durable.
pub fn sync_dir(dir: &Path) {
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
}
