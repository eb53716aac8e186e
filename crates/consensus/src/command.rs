//! State machine commands and their binary encoding.
//!
//! ```text
//! Noop:             [0]
//! Put:              [1][path][value]
//! Delete:           [2][path]
//! CompareAndSet:    [3][path][has_expected: u8][expected: u64][value]
//! Increment:        [4][path][by: u64]
//! CreateSequential: [5][prefix][value]
//! ```
//!
//! Strings and byte strings are `[len: u32 LE][bytes]`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::ConsensusError;

/// A mutation of the coordination store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Appended by a new leader to commit entries of earlier terms.
    Noop,
    Put { path: String, value: Vec<u8> },
    Delete { path: String },
    /// Writes `value` if the current version equals `expected`
    /// (`None`: the path must not exist).
    CompareAndSet {
        path: String,
        expected: Option<u64>,
        value: Vec<u8>,
    },
    /// Adds `by` to the counter at `path` (missing counts as 0).
    Increment { path: String, by: u64 },
    /// Creates `prefix` + a 10-digit number, one higher than the last one
    /// created under the same prefix.
    CreateSequential { prefix: String, value: Vec<u8> },
}

/// Result of applying a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Noop,
    Written { version: u64 },
    Deleted { existed: bool },
    Swapped { ok: bool, version: u64 },
    Counter { value: u64 },
    Sequential { path: String, seq: u64 },
}

fn write_bytes<W: Write>(w: &mut W, b: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(b.len() as u32)?;
    w.write_all(b)
}

fn read_bytes<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_bytes(w, s.as_bytes())
}

pub(crate) fn read_str<R: Read>(r: &mut R) -> Result<String, ConsensusError> {
    let bytes = read_bytes(r).map_err(|e| ConsensusError::Corrupt(e.to_string()))?;
    String::from_utf8(bytes).map_err(|_| ConsensusError::Corrupt("path is not UTF-8".into()))
}

pub(crate) fn write_blob<W: Write>(w: &mut W, b: &[u8]) -> io::Result<()> {
    write_bytes(w, b)
}

pub(crate) fn read_blob<R: Read>(r: &mut R) -> Result<Vec<u8>, ConsensusError> {
    read_bytes(r).map_err(|e| ConsensusError::Corrupt(e.to_string()))
}

impl Command {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        // Writes into a Vec cannot fail.
        let _ = self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Command::Noop => buf.write_u8(0)?,
            Command::Put { path, value } => {
                buf.write_u8(1)?;
                write_str(buf, path)?;
                write_bytes(buf, value)?;
            }
            Command::Delete { path } => {
                buf.write_u8(2)?;
                write_str(buf, path)?;
            }
            Command::CompareAndSet { path, expected, value } => {
                buf.write_u8(3)?;
                write_str(buf, path)?;
                buf.write_u8(u8::from(expected.is_some()))?;
                buf.write_u64::<LittleEndian>(expected.unwrap_or(0))?;
                write_bytes(buf, value)?;
            }
            Command::Increment { path, by } => {
                buf.write_u8(4)?;
                write_str(buf, path)?;
                buf.write_u64::<LittleEndian>(*by)?;
            }
            Command::CreateSequential { prefix, value } => {
                buf.write_u8(5)?;
                write_str(buf, prefix)?;
                write_bytes(buf, value)?;
            }
        }
        Ok(())
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, ConsensusError> {
        let r = &mut bytes;
        let corrupt = |e: io::Error| ConsensusError::Corrupt(e.to_string());
        let cmd = match r.read_u8().map_err(corrupt)? {
            0 => Command::Noop,
            1 => Command::Put {
                path: read_str(r)?,
                value: read_blob(r)?,
            },
            2 => Command::Delete { path: read_str(r)? },
            3 => {
                let path = read_str(r)?;
                let has = r.read_u8().map_err(corrupt)?;
                let expected = r.read_u64::<LittleEndian>().map_err(corrupt)?;
                Command::CompareAndSet {
                    path,
                    expected: (has != 0).then_some(expected),
                    value: read_blob(r)?,
                }
            }
            4 => Command::Increment {
                path: read_str(r)?,
                by: r.read_u64::<LittleEndian>().map_err(corrupt)?,
            },
            5 => Command::CreateSequential {
                prefix: read_str(r)?,
                value: read_blob(r)?,
            },
            op => return Err(ConsensusError::Corrupt(format!("unknown command op {}", op))),
        };
        if !bytes.is_empty() {
            return Err(ConsensusError::Corrupt("trailing bytes after command".into()));
        }
        Ok(cmd)
    }
}
