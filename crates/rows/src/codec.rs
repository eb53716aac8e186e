//! Little-endian binary encoding for values, rows and table definitions.
//!
//! ```text
//! value  = tag (u8) | Int: i64 | Str: len (u32) + utf8 bytes
//! row    = ncols (u32) | value*
//! def    = magic "TDF1" (u32) | name | columns | sort key | partition
//!          | transform | granule_rows (u32) | replicas
//! ```
//!
//! Strings inside a definition use the same `len (u32) + bytes` form.

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::{Column, ColumnType, PartitionBy, Row, TableDef, Transform, Value};

/// Magic number for an encoded [`TableDef`] (ASCII "TDF1").
pub const TABLE_DEF_MAGIC: u32 = 0x5444_4631;

/// Largest string we will allocate while decoding (1 MiB). Guards against
/// corrupt length prefixes.
const MAX_STR_BYTES: usize = 1024 * 1024;
/// Largest column count we will accept while decoding.
const MAX_COLUMNS: usize = 4096;

const TAG_INT: u8 = 0;
const TAG_STR: u8 = 1;

pub fn write_str<W: Write>(w: &mut W, s: &str) -> Result<()> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

pub fn read_str<R: Read>(r: &mut R) -> Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if len > MAX_STR_BYTES {
        bail!("corrupt string: length {} exceeds maximum {}", len, MAX_STR_BYTES);
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).context("string is not valid utf-8")
}

pub fn write_value<W: Write>(w: &mut W, v: &Value) -> Result<()> {
    match v {
        Value::Int(i) => {
            w.write_u8(TAG_INT)?;
            w.write_i64::<LittleEndian>(*i)?;
        }
        Value::Str(s) => {
            w.write_u8(TAG_STR)?;
            write_str(w, s)?;
        }
    }
    Ok(())
}

pub fn read_value<R: Read>(r: &mut R) -> Result<Value> {
    match r.read_u8()? {
        TAG_INT => Ok(Value::Int(r.read_i64::<LittleEndian>()?)),
        TAG_STR => Ok(Value::Str(read_str(r)?)),
        tag => bail!("unknown value tag {}", tag),
    }
}

/// Writes a length-prefixed list of values (a row or a sort-key tuple).
pub fn write_values<W: Write>(w: &mut W, values: &[Value]) -> Result<()> {
    w.write_u32::<LittleEndian>(values.len() as u32)?;
    for v in values {
        write_value(w, v)?;
    }
    Ok(())
}

pub fn read_values<R: Read>(r: &mut R) -> Result<Vec<Value>> {
    let n = r.read_u32::<LittleEndian>()? as usize;
    if n > MAX_COLUMNS {
        bail!("corrupt row: {} columns exceeds maximum {}", n, MAX_COLUMNS);
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_value(r)?);
    }
    Ok(out)
}

pub fn write_row<W: Write>(w: &mut W, row: &Row) -> Result<()> {
    write_values(w, row)
}

pub fn read_row<R: Read>(r: &mut R) -> Result<Row> {
    read_values(r)
}

fn write_strs<W: Write>(w: &mut W, items: &[String]) -> Result<()> {
    w.write_u32::<LittleEndian>(items.len() as u32)?;
    for s in items {
        write_str(w, s)?;
    }
    Ok(())
}

fn read_strs<R: Read>(r: &mut R) -> Result<Vec<String>> {
    let n = r.read_u32::<LittleEndian>()? as usize;
    ensure!(n <= MAX_COLUMNS, "corrupt list: {} items", n);
    (0..n).map(|_| read_str(r)).collect()
}

/// Encodes a table definition into a self-contained byte buffer.
pub fn encode_table_def(def: &TableDef) -> Result<Vec<u8>> {
    let mut w = Vec::with_capacity(128);
    w.write_u32::<LittleEndian>(TABLE_DEF_MAGIC)?;
    write_str(&mut w, &def.name)?;

    w.write_u32::<LittleEndian>(def.columns.len() as u32)?;
    for c in &def.columns {
        write_str(&mut w, &c.name)?;
        w.write_u8(match c.ty {
            ColumnType::Int => 0,
            ColumnType::Str => 1,
        })?;
    }
    write_strs(&mut w, &def.sort_key)?;

    match &def.partition_by {
        PartitionBy::Single => w.write_u8(0)?,
        PartitionBy::Column(c) => {
            w.write_u8(1)?;
            write_str(&mut w, c)?;
        }
        PartitionBy::IntDiv { column, width } => {
            w.write_u8(2)?;
            write_str(&mut w, column)?;
            w.write_i64::<LittleEndian>(*width)?;
        }
    }

    match &def.transform {
        Transform::Plain => w.write_u8(0)?,
        Transform::Dedup { version } => {
            w.write_u8(1)?;
            write_str(&mut w, version)?;
        }
        Transform::Sum { columns } => {
            w.write_u8(2)?;
            write_strs(&mut w, columns)?;
        }
        Transform::Collapse { sign } => {
            w.write_u8(3)?;
            write_str(&mut w, sign)?;
        }
    }

    w.write_u32::<LittleEndian>(def.granule_rows as u32)?;
    write_strs(&mut w, &def.replicas)?;
    Ok(w)
}

/// Decodes a buffer produced by [`encode_table_def`].
pub fn decode_table_def(bytes: &[u8]) -> Result<TableDef> {
    let mut r = bytes;
    let magic = r.read_u32::<LittleEndian>()?;
    ensure!(magic == TABLE_DEF_MAGIC, "bad table definition magic {:#x}", magic);
    let name = read_str(&mut r)?;

    let ncols = r.read_u32::<LittleEndian>()? as usize;
    ensure!(ncols <= MAX_COLUMNS, "corrupt table definition: {} columns", ncols);
    let mut columns = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        let name = read_str(&mut r)?;
        let ty = match r.read_u8()? {
            0 => ColumnType::Int,
            1 => ColumnType::Str,
            t => bail!("unknown column type {}", t),
        };
        columns.push(Column { name, ty });
    }
    let sort_key = read_strs(&mut r)?;

    let partition_by = match r.read_u8()? {
        0 => PartitionBy::Single,
        1 => PartitionBy::Column(read_str(&mut r)?),
        2 => PartitionBy::IntDiv {
            column: read_str(&mut r)?,
            width: r.read_i64::<LittleEndian>()?,
        },
        t => bail!("unknown partition kind {}", t),
    };

    let transform = match r.read_u8()? {
        0 => Transform::Plain,
        1 => Transform::Dedup {
            version: read_str(&mut r)?,
        },
        2 => Transform::Sum {
            columns: read_strs(&mut r)?,
        },
        3 => Transform::Collapse {
            sign: read_str(&mut r)?,
        },
        t => bail!("unknown transform kind {}", t),
    };

    let granule_rows = r.read_u32::<LittleEndian>()? as usize;
    let replicas = read_strs(&mut r)?;
    ensure!(r.is_empty(), "trailing bytes after table definition");

    Ok(TableDef {
        name,
        columns,
        sort_key,
        partition_by,
        transform,
        granule_rows,
        replicas,
    })
}
