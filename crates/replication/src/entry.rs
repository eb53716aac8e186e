//! Replication log entries and their binary form.
//!
//! ```text
//! [magic "RLE1": u32][origin: str][op: u8][op fields...][crc32: u32]
//!
//! AddPart     (1): [part: str][checksum: u32][rows: u64]
//! MergeParts  (2): [n: u32][input: str]*n [output: str][checksum: u32]
//! DropPart    (3): [part: str]
//! AlterTable  (4): [len: u32][encoded table definition]
//! ```
//!
//! Strings are `[len: u32][utf8]`, all integers little-endian. The CRC covers
//! every byte before it. An entry's sequence number is not stored in the
//! payload; it is the number in the entry's path.

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use part::PartName;
use rows::codec::{decode_table_def, encode_table_def, read_str, write_str};
use rows::TableDef;
use std::io::Read;

use crate::ReplicationError;

const ENTRY_MAGIC: u32 = 0x524C_4531; // "RLE1"
const MAX_MERGE_INPUTS: usize = 4096;
const MAX_DEF_BYTES: usize = 1024 * 1024;

const OP_ADD_PART: u8 = 1;
const OP_MERGE_PARTS: u8 = 2;
const OP_DROP_PART: u8 = 3;
const OP_ALTER_TABLE: u8 = 4;

/// What a log entry asks every replica to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOp {
    /// Activate a part written by `origin`.
    AddPart { part: PartName, checksum: u32, rows: u64 },
    /// Replace `inputs` by their merge. Every replica recomputes it and must
    /// arrive at `checksum`.
    MergeParts {
        inputs: Vec<PartName>,
        output: PartName,
        checksum: u32,
    },
    DropPart { part: PartName },
    AlterTable { def: TableDef },
}

impl LogOp {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            LogOp::AddPart { .. } => "add_part",
            LogOp::MergeParts { .. } => "merge_parts",
            LogOp::DropPart { .. } => "drop_part",
            LogOp::AlterTable { .. } => "alter_table",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the table's log; 0 until the entry is appended.
    pub seq: u64,
    /// Replica that appended the entry.
    pub origin: String,
    pub op: LogOp,
}

impl LogEntry {
    pub fn new(origin: impl Into<String>, op: LogOp) -> Self {
        Self {
            seq: 0,
            origin: origin.into(),
            op,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.write_u32::<LittleEndian>(ENTRY_MAGIC)?;
        write_str(&mut buf, &self.origin)?;
        match &self.op {
            LogOp::AddPart { part, checksum, rows } => {
                buf.write_u8(OP_ADD_PART)?;
                write_str(&mut buf, &part.to_string())?;
                buf.write_u32::<LittleEndian>(*checksum)?;
                buf.write_u64::<LittleEndian>(*rows)?;
            }
            LogOp::MergeParts {
                inputs,
                output,
                checksum,
            } => {
                buf.write_u8(OP_MERGE_PARTS)?;
                buf.write_u32::<LittleEndian>(inputs.len() as u32)?;
                for p in inputs {
                    write_str(&mut buf, &p.to_string())?;
                }
                write_str(&mut buf, &output.to_string())?;
                buf.write_u32::<LittleEndian>(*checksum)?;
            }
            LogOp::DropPart { part } => {
                buf.write_u8(OP_DROP_PART)?;
                write_str(&mut buf, &part.to_string())?;
            }
            LogOp::AlterTable { def } => {
                buf.write_u8(OP_ALTER_TABLE)?;
                let bytes = encode_table_def(def)?;
                buf.write_u32::<LittleEndian>(bytes.len() as u32)?;
                buf.extend_from_slice(&bytes);
            }
        }
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.write_u32::<LittleEndian>(hasher.finalize())?;
        Ok(buf)
    }

    /// Decodes the payload stored at sequence `seq`.
    pub fn decode(seq: u64, bytes: &[u8]) -> Result<Self, ReplicationError> {
        decode_inner(seq, bytes).map_err(|e| ReplicationError::CorruptEntry {
            seq,
            reason: format!("{:#}", e),
        })
    }
}

fn decode_inner(seq: u64, bytes: &[u8]) -> Result<LogEntry> {
    ensure!(bytes.len() >= 8, "entry too short ({} bytes)", bytes.len());
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let stored = (&trailer[..]).read_u32::<LittleEndian>()?;
    let mut hasher = Crc32::new();
    hasher.update(body);
    ensure!(hasher.finalize() == stored, "checksum mismatch");

    let r = &mut &body[..];
    ensure!(r.read_u32::<LittleEndian>()? == ENTRY_MAGIC, "bad magic");
    let origin = read_str(r)?;
    let op = match r.read_u8()? {
        OP_ADD_PART => LogOp::AddPart {
            part: read_part(r)?,
            checksum: r.read_u32::<LittleEndian>()?,
            rows: r.read_u64::<LittleEndian>()?,
        },
        OP_MERGE_PARTS => {
            let n = r.read_u32::<LittleEndian>()? as usize;
            ensure!((1..=MAX_MERGE_INPUTS).contains(&n), "merge with {} inputs", n);
            let inputs = (0..n).map(|_| read_part(r)).collect::<Result<Vec<_>>>()?;
            LogOp::MergeParts {
                inputs,
                output: read_part(r)?,
                checksum: r.read_u32::<LittleEndian>()?,
            }
        }
        OP_DROP_PART => LogOp::DropPart { part: read_part(r)? },
        OP_ALTER_TABLE => {
            let len = r.read_u32::<LittleEndian>()? as usize;
            ensure!(len <= MAX_DEF_BYTES, "table definition of {} bytes", len);
            let mut def = vec![0u8; len];
            r.read_exact(&mut def)?;
            LogOp::AlterTable {
                def: decode_table_def(&def)?,
            }
        }
        op => bail!("unknown op {}", op),
    };
    ensure!(r.is_empty(), "{} trailing bytes", r.len());
    Ok(LogEntry { seq, origin, op })
}

fn read_part<R: Read>(r: &mut R) -> Result<PartName> {
    let s = read_str(r)?;
    s.parse().with_context(|| format!("bad part name '{}'", s))
}
