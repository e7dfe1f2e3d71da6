//! SMB2 Tree Connect messages

use super::common::{body_slice, check_structure_size, decode_utf16, encode_utf16, ensure_len, SmbMessage};
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{
    structure_size, ShareCapabilities, ShareFlags, SMB2_HEADER_SIZE,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};

/// SMB2 TreeConnect Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2TreeConnectRequest {
    pub flags: u16,
    /// Full UNC path, e.g. `\\server\share`
    pub path: String,
}

impl Smb2TreeConnectRequest {
    const FIXED: usize = 8;

    pub fn new(path: impl Into<String>) -> Self {
        Self {
            flags: 0,
            path: path.into(),
        }
    }
}

impl SmbMessage for Smb2TreeConnectRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::FIXED, "TreeConnect request")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(
            &mut cursor,
            structure_size::TREE_CONNECT_REQUEST,
            "tree connect request",
        )?;

        let flags = cursor.read_u16::<LittleEndian>()?;
        let path_offset = cursor.read_u16::<LittleEndian>()? as usize;
        let path_length = cursor.read_u16::<LittleEndian>()? as usize;

        Ok(Self {
            flags,
            path: decode_utf16(body_slice(buf, path_offset, path_length)?),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let path_bytes = encode_utf16(&self.path);
        let mut buf = Vec::with_capacity(Self::FIXED + path_bytes.len());
        buf.write_u16::<LittleEndian>(structure_size::TREE_CONNECT_REQUEST)?;
        buf.write_u16::<LittleEndian>(self.flags)?;
        buf.write_u16::<LittleEndian>((SMB2_HEADER_SIZE + Self::FIXED) as u16)?;
        buf.write_u16::<LittleEndian>(path_bytes.len() as u16)?;
        buf.write_all(&path_bytes)?;
        Ok(buf)
    }
}

/// Share types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShareType {
    Disk = 0x01,
    Pipe = 0x02,
    Print = 0x03,
}

impl TryFrom<u8> for ShareType {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Disk),
            0x02 => Ok(Self::Pipe),
            0x03 => Ok(Self::Print),
            _ => Err(Error::ParseError(format!("Invalid share type: {}", value))),
        }
    }
}

/// SMB2 TreeConnect Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2TreeConnectResponse {
    pub share_type: ShareType,
    pub share_flags: ShareFlags,
    pub capabilities: ShareCapabilities,
    pub maximal_access: u32,
}

impl Smb2TreeConnectResponse {
    pub fn new(share_type: ShareType) -> Self {
        Self {
            share_type,
            share_flags: ShareFlags::empty(),
            capabilities: ShareCapabilities::empty(),
            maximal_access: 0x001F01FF,
        }
    }
}

impl SmbMessage for Smb2TreeConnectResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 16, "TreeConnect response")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(
            &mut cursor,
            structure_size::TREE_CONNECT_RESPONSE,
            "tree connect response",
        )?;

        let share_type = ShareType::try_from(cursor.read_u8()?)?;
        let _reserved = cursor.read_u8()?;
        let share_flags = ShareFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let capabilities = ShareCapabilities::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let maximal_access = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            share_type,
            share_flags,
            capabilities,
            maximal_access,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16);
        buf.write_u16::<LittleEndian>(structure_size::TREE_CONNECT_RESPONSE)?;
        buf.write_u8(self.share_type as u8)?;
        buf.write_u8(0)?;
        buf.write_u32::<LittleEndian>(self.share_flags.bits())?;
        buf.write_u32::<LittleEndian>(self.capabilities.bits())?;
        buf.write_u32::<LittleEndian>(self.maximal_access)?;
        Ok(buf)
    }
}
