//! # Part - immutable sorted data parts
//!
//! A part is a directory holding a batch of rows sorted by the table's sort
//! key. Parts are written once and never modified; merges replace several
//! parts with a new one.
//!
//! ## Directory layout
//!
//! ```text
//! {table}/{partition}/{partition}_{min}_{max}_{level}/
//! ├── data.bin        granules of encoded rows + footer
//! ├── primary.idx     sparse index: one mark per granule
//! └── checksums.txt   sizes and CRC32s of the two files, row count
//! ```
//!
//! ## `data.bin`
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ GRANULE 0                                                │
//! │ crc32 (u32) | rows (u32) | body_len (u32) | body         │
//! │ body = rows × [ncols (u32) | values]                     │
//! ├──────────────────────────────────────────────────────────┤
//! │ GRANULE 1 ...                                            │
//! ├──────────────────────────────────────────────────────────┤
//! │ FOOTER (16 bytes)                                        │
//! │ granules (u32) | rows (u64) | magic (u32) "PRT1"         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The bytes depend only on the rows and the granule size, so the part
//! checksum (CRC32 of `data.bin`) is equal on every replica that builds the
//! same part. Replicas compare it after recomputing a merge.
//!
//! ## Writing
//!
//! [`PartWriter`] writes into `{part}.tmp/`, fsyncs and renames the directory
//! into place, so a crash never leaves a half-written part under its final
//! name.

mod bundle;
pub mod format;
mod merge;
mod name;
mod reader;
mod writer;

pub use bundle::{export_part, import_part, BUNDLE_MAGIC};
pub use merge::{fold_run, merge_parts, MergeIterator, Transformed};
pub use name::PartName;
pub use reader::{PartCursor, PartReader};
pub use writer::{write_part, PartMeta, PartWriter};

/// Errors callers need to tell apart from plain I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum PartError {
    #[error("checksum mismatch for part {part}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        part: String,
        expected: u32,
        actual: u32,
    },
}

#[cfg(test)]
mod tests;
