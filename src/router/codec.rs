//! 规则文件共用的 varbin 编解码（Go `binary.Uvarint` 兼容）

use std::io::{self, Read, Write};

use anyhow::{bail, Result};

/// 读取 uvarint
pub(crate) fn read_uvarint(cursor: &mut io::Cursor<&[u8]>) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let b = read_u8(cursor)?;
        result |= ((b & 0x7F) as u64) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            bail!("uvarint overflow");
        }
    }
    Ok(result)
}

/// 读取单个 u8
pub(crate) fn read_u8(cursor: &mut io::Cursor<&[u8]>) -> Result<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// 读取单个字符串 (uvarint len + bytes)
pub(crate) fn read_string(cursor: &mut io::Cursor<&[u8]>) -> Result<String> {
    let len = read_uvarint(cursor)? as usize;
    let remaining = cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize);
    if len > remaining {
        bail!("string length {} exceeds remaining {} bytes", len, remaining);
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

/// 读取 string list: uvarint(count) + strings
pub(crate) fn read_string_list(cursor: &mut io::Cursor<&[u8]>) -> Result<Vec<String>> {
    let count = read_uvarint(cursor)?;
    let mut result = Vec::new();
    for _ in 0..count {
        result.push(read_string(cursor)?);
    }
    Ok(result)
}

pub(crate) fn write_uvarint<W: Write>(writer: &mut W, mut value: u64) -> io::Result<()> {
    while value >= 0x80 {
        writer.write_all(&[(value as u8) | 0x80])?;
        value >>= 7;
    }
    writer.write_all(&[value as u8])
}

pub(crate) fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    write_uvarint(writer, value.len() as u64)?;
    writer.write_all(value.as_bytes())
}

pub(crate) fn write_string_list<W: Write>(writer: &mut W, values: &[String]) -> io::Result<()> {
    write_uvarint(writer, values.len() as u64)?;
    for value in values {
        write_string(writer, value)?;
    }
    Ok(())
}
