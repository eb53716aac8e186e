//! # WAL - consensus write-ahead log
//!
//! Durable storage for one consensus node: its hard state (current term and
//! vote) and its log entries. A node appends here, and fsyncs, before it
//! answers a vote or an append request and before it counts itself toward a
//! commit. On restart the file is replayed to rebuild the node.
//!
//! ## Binary Record Format
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][body ...]
//! ```
//!
//! Body (HardState): `[op=0: u8][term: u64][has_vote: u8][voted_for: u64]`
//! Body (Entry):     `[op=1: u8][index: u64][term: u64][len: u32][payload]`
//! Body (Truncate):  `[op=2: u8][from_index: u64]`
//!
//! `record_len` includes the 4-byte CRC but **not** itself.
//!
//! A `Truncate` record discards every entry at or after `from_index` that
//! came before it in the file; a follower writes one when the leader
//! overwrites a conflicting suffix. After a snapshot the whole file is
//! replaced with [`rewrite`], which keeps only what the snapshot does not
//! cover.
//!
//! ## Example
//!
//! ```rust,no_run
//! use wal::{WalWriter, WalReader, WalRecord};
//!
//! let mut w = WalWriter::create("raft.wal", true).unwrap();
//! w.append(&WalRecord::HardState { term: 1, voted_for: Some(2) }).unwrap();
//! w.append(&WalRecord::Entry { index: 1, term: 1, payload: b"noop".to_vec() }).unwrap();
//! drop(w);
//!
//! let mut r = WalReader::open("raft.wal").unwrap();
//! r.replay(|rec| println!("{:?}", rec)).unwrap();
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use thiserror::Error;

/// Largest record the reader accepts.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// One durable fact about a consensus node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Current term and the candidate voted for in it.
    HardState { term: u64, voted_for: Option<u64> },
    /// A log entry; `payload` is opaque to the log.
    Entry { index: u64, term: u64, payload: Vec<u8> },
    /// Drops entries with `index >= from_index` written earlier.
    Truncate { from_index: u64 },
}

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record failed CRC validation or contained an unknown op code.
    #[error("corrupt record at byte {0}")]
    Corrupt(u64),
}

fn encode_body(buf: &mut Vec<u8>, record: &WalRecord) -> io::Result<()> {
    match record {
        WalRecord::HardState { term, voted_for } => {
            buf.write_u8(0)?;
            buf.write_u64::<LittleEndian>(*term)?;
            buf.write_u8(u8::from(voted_for.is_some()))?;
            buf.write_u64::<LittleEndian>(voted_for.unwrap_or(0))?;
        }
        WalRecord::Entry { index, term, payload } => {
            buf.write_u8(1)?;
            buf.write_u64::<LittleEndian>(*index)?;
            buf.write_u64::<LittleEndian>(*term)?;
            buf.write_u32::<LittleEndian>(payload.len() as u32)?;
            buf.extend_from_slice(payload);
        }
        WalRecord::Truncate { from_index } => {
            buf.write_u8(2)?;
            buf.write_u64::<LittleEndian>(*from_index)?;
        }
    }
    Ok(())
}

/// Appends one framed record to `buf`.
fn encode_frame(buf: &mut Vec<u8>, record: &WalRecord) -> Result<(), WalError> {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; 8]);
    encode_body(buf, record)?;

    let body = &buf[start + 8..];
    let mut hasher = Crc32::new();
    hasher.update(body);
    let crc = hasher.finalize();

    let record_len = (body.len() as u64) + 4;
    if record_len > u64::from(MAX_RECORD_SIZE) {
        return Err(WalError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "WAL record too large",
        )));
    }
    buf[start..start + 4].copy_from_slice(&(record_len as u32).to_le_bytes());
    buf[start + 4..start + 8].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

fn decode_body(body: &[u8], at: u64) -> Result<WalRecord, WalError> {
    let corrupt = |_| WalError::Corrupt(at);
    let mut br = body;
    let record = match br.read_u8().map_err(corrupt)? {
        0 => {
            let term = br.read_u64::<LittleEndian>().map_err(corrupt)?;
            let has_vote = br.read_u8().map_err(corrupt)?;
            let vote = br.read_u64::<LittleEndian>().map_err(corrupt)?;
            WalRecord::HardState {
                term,
                voted_for: (has_vote != 0).then_some(vote),
            }
        }
        1 => {
            let index = br.read_u64::<LittleEndian>().map_err(corrupt)?;
            let term = br.read_u64::<LittleEndian>().map_err(corrupt)?;
            let len = br.read_u32::<LittleEndian>().map_err(corrupt)? as usize;
            if len != br.len() {
                return Err(WalError::Corrupt(at));
            }
            WalRecord::Entry {
                index,
                term,
                payload: br.to_vec(),
            }
        }
        2 => WalRecord::Truncate {
            from_index: br.read_u64::<LittleEndian>().map_err(corrupt)?,
        },
        _ => return Err(WalError::Corrupt(at)),
    };
    Ok(record)
}

/// Append-only WAL writer.
///
/// A record is framed in a scratch buffer and written with one `write_all`.
/// With `sync` set, [`append`](Self::append) and
/// [`append_batch`](Self::append_batch) fsync before returning.
pub struct WalWriter {
    file: File,
    sync: bool,
    buf: Vec<u8>,
}

impl WalWriter {
    /// Opens (or creates) a WAL file in append mode.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Self {
            file,
            sync,
            buf: Vec::with_capacity(256),
        })
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        self.append_batch(std::slice::from_ref(record))
    }

    /// Appends several records with a single write and at most one fsync.
    pub fn append_batch(&mut self, records: &[WalRecord]) -> Result<(), WalError> {
        if records.is_empty() {
            return Ok(());
        }
        self.buf.clear();
        for r in records {
            encode_frame(&mut self.buf, r)?;
        }
        self.file.write_all(&self.buf)?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    pub fn sync_to_disk(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter").field("sync", &self.sync).finish()
    }
}

/// Sequential WAL reader.
///
/// Every record's CRC32 is checked. A truncated tail record (a crash in the
/// middle of a write) ends the replay cleanly; [`valid_len`](Self::valid_len)
/// then reports where the intact prefix stops.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
    valid_len: u64,
}

impl WalReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader::from_reader(f))
    }
}

impl<R: Read> WalReader<R> {
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
            valid_len: 0,
        }
    }

    /// Bytes of complete, valid records seen so far.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Replays every valid record, calling `apply` for each one.
    ///
    /// - Clean EOF or a truncated tail: `Ok(())`.
    /// - CRC mismatch or unknown op code: `Err(WalError::Corrupt)`.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<(), WalError>
    where
        F: FnMut(WalRecord),
    {
        let mut body = Vec::with_capacity(256);
        loop {
            let at = self.valid_len;
            let record_len = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(WalError::Io(e)),
            };
            if record_len <= 4 || record_len > MAX_RECORD_SIZE {
                return Err(WalError::Corrupt(at));
            }
            let crc = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(WalError::Io(e)),
            };
            body.clear();
            body.resize((record_len - 4) as usize, 0);
            match self.rdr.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(WalError::Io(e)),
            }

            let mut hasher = Crc32::new();
            hasher.update(&body);
            if hasher.finalize() != crc {
                return Err(WalError::Corrupt(at));
            }
            apply(decode_body(&body, at)?);
            self.valid_len += 4 + u64::from(record_len);
        }
    }
}

/// Replays `path` and cuts off a torn tail so later appends stay readable.
///
/// A missing file replays as empty.
pub fn recover<P: AsRef<Path>>(path: P) -> Result<Vec<WalRecord>, WalError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = WalReader::open(path)?;
    let mut records = Vec::new();
    reader.replay(|r| records.push(r))?;
    let valid = reader.valid_len();
    let file = OpenOptions::new().write(true).open(path)?;
    if file.metadata()?.len() > valid {
        file.set_len(valid)?;
        file.sync_all()?;
    }
    Ok(records)
}

/// Replaces the file at `path` with exactly `records`: write `path.tmp`,
/// fsync, rename over `path`.
pub fn rewrite<P: AsRef<Path>>(path: P, records: &[WalRecord], sync: bool) -> Result<(), WalError> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    let mut buf = Vec::with_capacity(records.len() * 64);
    for r in records {
        encode_frame(&mut buf, r)?;
    }
    {
        let mut f = File::create(&tmp)?;
        f.write_all(&buf)?;
        if sync {
            f.sync_all()?;
        }
    }
    fs::rename(&tmp, path)?;
    if sync {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
