//! # Sparse Index - per-part primary index
//!
//! A part's rows are stored in granules of a fixed number of rows. The sparse
//! index keeps one [`Mark`] per granule: the sort-key tuple of the granule's
//! first row, where the granule starts in `data.bin`, and how many rows it
//! holds. The whole index is small enough to live in memory while the part is
//! open.
//!
//! ## Range lookups
//!
//! Marks are sorted (the part is sorted), so a key range maps to one
//! contiguous run of granules found with two binary searches:
//!
//! ```text
//! marks:    m0      m1      m2      m3      m4
//! granules: [ g0  ][ g1  ][ g2  ][ g3  ][ g4  ]
//! range:               |<-------->|
//! read:            [ g1  ][ g2  ]
//! ```
//!
//! Granule `i` can only hold keys in `[m_i, m_{i+1}]` (inclusive on the right
//! because equal keys may straddle a granule boundary), so the run starts one
//! granule before the first mark that is not below the range.
//!
//! ## Serialized form (`primary.idx`)
//!
//! ```text
//! [magic: u32 "PIX1"][count: u32][crc32: u32][body]
//! body = repeated: offset (u64) | rows (u32) | key (row codec)
//! ```
//!
//! The CRC covers the body.

use anyhow::{bail, ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use rows::codec::{read_values, write_values};
use rows::{KeyRange, Value};
use std::io::{Read, Write};
use std::ops::Range;

/// Magic number identifying a primary index file (ASCII "PIX1").
pub const INDEX_MAGIC: u32 = 0x5049_5831;

/// Upper bound on granules per part accepted while decoding.
const MAX_MARKS: usize = 16 * 1024 * 1024;

/// Index entry for one granule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mark {
    /// Sort key of the granule's first row.
    pub key: Vec<Value>,
    /// Byte offset of the granule inside `data.bin`.
    pub offset: u64,
    /// Rows in the granule.
    pub rows: u32,
}

/// The sparse primary index of one part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryIndex {
    marks: Vec<Mark>,
}

impl PrimaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the mark of the next granule. Marks must arrive in key order.
    pub fn push(&mut self, mark: Mark) {
        debug_assert!(self.marks.last().map_or(true, |m| m.key <= mark.key));
        self.marks.push(mark);
    }

    #[must_use]
    pub fn marks(&self) -> &[Mark] {
        &self.marks
    }

    #[must_use]
    pub fn granule_count(&self) -> usize {
        self.marks.len()
    }

    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.marks.iter().map(|m| u64::from(m.rows)).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Returns the contiguous run of granules that may contain keys in `range`.
    ///
    /// May return more granules than strictly needed, never fewer.
    #[must_use]
    pub fn granules_for(&self, range: &KeyRange) -> Range<usize> {
        let below = self.marks.partition_point(|m| range.before_start(&m.key));
        let first = below.saturating_sub(1);
        let end = self.marks.partition_point(|m| !range.after_end(&m.key));
        first..end.max(first)
    }

    /// Serializes the index.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut body = Vec::with_capacity(self.marks.len() * 32);
        for m in &self.marks {
            body.write_u64::<LittleEndian>(m.offset)?;
            body.write_u32::<LittleEndian>(m.rows)?;
            write_values(&mut body, &m.key)?;
        }
        let mut hasher = Crc32::new();
        hasher.update(&body);

        w.write_u32::<LittleEndian>(INDEX_MAGIC)?;
        w.write_u32::<LittleEndian>(self.marks.len() as u32)?;
        w.write_u32::<LittleEndian>(hasher.finalize())?;
        w.write_all(&body)?;
        Ok(())
    }

    /// Deserializes an index written by [`write_to`](Self::write_to),
    /// verifying its checksum.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != INDEX_MAGIC {
            bail!("unknown primary index magic: {:#x}", magic);
        }
        let count = r.read_u32::<LittleEndian>()? as usize;
        ensure!(count <= MAX_MARKS, "corrupt index: {} marks", count);
        let expected_crc = r.read_u32::<LittleEndian>()?;

        let mut body = Vec::new();
        r.read_to_end(&mut body)?;
        let mut hasher = Crc32::new();
        hasher.update(&body);
        let actual_crc = hasher.finalize();
        if actual_crc != expected_crc {
            bail!(
                "primary index CRC32 mismatch: expected {:#010x}, got {:#010x}",
                expected_crc,
                actual_crc
            );
        }

        let mut cur = body.as_slice();
        let mut marks = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = cur.read_u64::<LittleEndian>()?;
            let rows = cur.read_u32::<LittleEndian>()?;
            let key = read_values(&mut cur)?;
            marks.push(Mark { key, offset, rows });
        }
        ensure!(cur.is_empty(), "corrupt index: trailing bytes");
        Ok(Self { marks })
    }
}

#[cfg(test)]
mod tests;
