//! Byte-stream form of a part, used to ship parts between replicas.
//!
//! ```text
//! [magic: u32 "PBN1"][name: str][files: u32]
//! repeated: [file name: str][len: u64][crc32: u32][bytes]
//! ```

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rows::codec::{read_str, write_str};
use std::fs;
use std::io::Read;
use std::path::Path;

use crate::format::{crc_of, sync_dir, Checksums, DATA_FILE, PART_FILES};
use crate::writer::write_file;
use crate::{PartError, PartMeta, PartName};

/// Magic number of an exported part (ASCII "PBN1").
pub const BUNDLE_MAGIC: u32 = 0x5042_4E31;

const MAX_FILE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Serializes the part stored in `dir`.
pub fn export_part(dir: &Path, name: &PartName) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(BUNDLE_MAGIC)?;
    write_str(&mut out, &name.to_string())?;
    out.write_u32::<LittleEndian>(PART_FILES.len() as u32)?;
    for file in PART_FILES {
        let bytes = fs::read(dir.join(file))
            .with_context(|| format!("exporting {}/{}", name, file))?;
        write_str(&mut out, file)?;
        out.write_u64::<LittleEndian>(bytes.len() as u64)?;
        out.write_u32::<LittleEndian>(crc_of(&bytes))?;
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

/// Verifies an exported part and installs it under `table_dir`.
///
/// The part's checksum (CRC32 of `data.bin`) must equal `expected_checksum`;
/// otherwise nothing is written and [`PartError::ChecksumMismatch`] is
/// returned.
pub fn import_part(
    bytes: &[u8],
    table_dir: &Path,
    name: &PartName,
    expected_checksum: u32,
    fsync: bool,
) -> Result<PartMeta> {
    let mut r = bytes;
    let magic = r.read_u32::<LittleEndian>()?;
    ensure!(magic == BUNDLE_MAGIC, "not a part bundle (magic {:#x})", magic);
    let bundled: PartName = read_str(&mut r)?.parse()?;
    ensure!(bundled == *name, "bundle holds part {}, expected {}", bundled, name);

    let count = r.read_u32::<LittleEndian>()? as usize;
    ensure!(count == PART_FILES.len(), "bundle has {} files", count);
    let mut files = Vec::with_capacity(count);
    for _ in 0..count {
        let file = read_str(&mut r)?;
        if !PART_FILES.contains(&file.as_str()) {
            bail!("unexpected file '{}' in bundle", file);
        }
        let len = r.read_u64::<LittleEndian>()?;
        ensure!(len <= MAX_FILE_BYTES && len as usize <= r.len(), "truncated bundle");
        let crc = r.read_u32::<LittleEndian>()?;
        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body)?;
        let actual = crc_of(&body);
        if actual != crc {
            return Err(PartError::ChecksumMismatch {
                part: format!("{}/{}", name, file),
                expected: crc,
                actual,
            }
            .into());
        }
        files.push((file, body));
    }
    ensure!(r.is_empty(), "trailing bytes after bundle");

    let data = files
        .iter()
        .find(|(f, _)| f == DATA_FILE)
        .map(|(_, b)| b)
        .context("bundle lacks data.bin")?;
    let actual = crc_of(data);
    if actual != expected_checksum {
        return Err(PartError::ChecksumMismatch {
            part: name.to_string(),
            expected: expected_checksum,
            actual,
        }
        .into());
    }
    let checksums_text = files
        .iter()
        .find(|(f, _)| f == crate::format::CHECKSUMS_FILE)
        .map(|(_, b)| String::from_utf8_lossy(b).into_owned())
        .context("bundle lacks checksums.txt")?;
    let checksums = Checksums::parse(&checksums_text)?;
    ensure!(checksums.data_crc == actual, "checksums.txt disagrees with data.bin");

    let final_dir = name.dir_in(table_dir);
    if final_dir.exists() {
        bail!("part {} already exists", name);
    }
    let tmp_dir = final_dir.with_extension("tmp");
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir)?;
    }
    fs::create_dir_all(&tmp_dir)?;
    let mut total = 0u64;
    for (file, body) in &files {
        write_file(&tmp_dir.join(file), body, fsync)?;
        total += body.len() as u64;
    }
    if fsync {
        sync_dir(&tmp_dir);
    }
    fs::rename(&tmp_dir, &final_dir)?;
    if fsync {
        if let Some(parent) = final_dir.parent() {
            sync_dir(parent);
        }
    }

    Ok(PartMeta {
        name: name.clone(),
        rows: checksums.rows,
        checksum: actual,
        bytes: total,
    })
}
