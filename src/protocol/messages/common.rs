//! Common types and traits for SMB2 message bodies

use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{structure_size, SMB2_HEADER_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Message bodies that can be parsed from and serialized to bytes.
///
/// `parse` receives the body only (the bytes after the 64-byte header);
/// buffer offsets on the wire are relative to the header start.
pub trait SmbMessage: Sized {
    /// Parse message from bytes
    fn parse(buf: &[u8]) -> Result<Self>;

    /// Serialize message to bytes
    fn serialize(&self) -> Result<Vec<u8>>;
}

pub(crate) fn check_structure_size(
    cursor: &mut io::Cursor<&[u8]>,
    expected: u16,
    what: &str,
) -> Result<()> {
    let structure_size = cursor.read_u16::<LittleEndian>()?;
    if structure_size != expected {
        return Err(Error::ParseError(format!(
            "Invalid {} structure size: {}",
            what, structure_size
        )));
    }
    Ok(())
}

pub(crate) fn ensure_len(buf: &[u8], need: usize, what: &str) -> Result<()> {
    if buf.len() < need {
        return Err(Error::ParseError(format!(
            "{} too short: {} < {} bytes",
            what,
            buf.len(),
            need
        )));
    }
    Ok(())
}

/// Slice a variable buffer addressed by a header-relative offset.
pub(crate) fn body_slice(buf: &[u8], offset: usize, length: usize) -> Result<&[u8]> {
    if length == 0 {
        return Ok(&[]);
    }
    let start = offset
        .checked_sub(SMB2_HEADER_SIZE)
        .ok_or_else(|| Error::ParseError(format!("Buffer offset {} inside header", offset)))?;
    let end = start + length;
    if end > buf.len() {
        return Err(Error::ParseError(format!(
            "Buffer [{}..{}] extends beyond {}-byte body",
            start,
            end,
            buf.len()
        )));
    }
    Ok(&buf[start..end])
}

pub(crate) fn encode_utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

pub(crate) fn decode_utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Four-byte body shared by LOGOFF, TREE_DISCONNECT, ECHO and FLUSH responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Smb2EmptyBody;

impl SmbMessage for Smb2EmptyBody {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 4, "Empty body")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::EMPTY, "empty body")?;
        Ok(Self)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(4);
        buf.write_u16::<LittleEndian>(structure_size::EMPTY)?;
        buf.write_u16::<LittleEndian>(0)?;
        Ok(buf)
    }
}

/// SMB2 ERROR response body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Smb2ErrorResponse {
    pub error_data: Vec<u8>,
}

impl SmbMessage for Smb2ErrorResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 8, "Error response")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::ERROR_RESPONSE, "error response")?;
        let _context_count = cursor.read_u8()?;
        let _reserved = cursor.read_u8()?;
        let byte_count = cursor.read_u32::<LittleEndian>()? as usize;
        let error_data = buf
            .get(8..8 + byte_count)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        Ok(Self { error_data })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(9 + self.error_data.len());
        buf.write_u16::<LittleEndian>(structure_size::ERROR_RESPONSE)?;
        buf.write_u8(0)?;
        buf.write_u8(0)?;
        buf.write_u32::<LittleEndian>(self.error_data.len() as u32)?;
        if self.error_data.is_empty() {
            buf.push(0);
        } else {
            buf.extend_from_slice(&self.error_data);
        }
        Ok(buf)
    }
}
