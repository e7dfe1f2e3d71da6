//! SMB2 Session Setup messages

use super::common::{body_slice, check_structure_size, ensure_len, SmbMessage};
use crate::error::Result;
use crate::protocol::smb2_constants::{structure_size, SecurityMode, SessionFlags, SMB2_HEADER_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};

/// SMB2 SessionSetup Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2SessionSetupRequest {
    pub flags: u8,
    pub security_mode: SecurityMode,
    pub capabilities: u32,
    pub previous_session_id: u64,
    pub security_blob: Vec<u8>,
}

impl Smb2SessionSetupRequest {
    const FIXED: usize = 24;

    pub fn new(security_blob: Vec<u8>) -> Self {
        Self {
            flags: 0,
            security_mode: SecurityMode::SIGNING_ENABLED,
            capabilities: 0,
            previous_session_id: 0,
            security_blob,
        }
    }
}

impl SmbMessage for Smb2SessionSetupRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::FIXED, "SessionSetup request")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(
            &mut cursor,
            structure_size::SESSION_SETUP_REQUEST,
            "session setup request",
        )?;

        let flags = cursor.read_u8()?;
        let security_mode = SecurityMode::from_bits_truncate(cursor.read_u8()? as u16);
        let capabilities = cursor.read_u32::<LittleEndian>()?;
        let _channel = cursor.read_u32::<LittleEndian>()?;
        let blob_offset = cursor.read_u16::<LittleEndian>()? as usize;
        let blob_length = cursor.read_u16::<LittleEndian>()? as usize;
        let previous_session_id = cursor.read_u64::<LittleEndian>()?;

        Ok(Self {
            flags,
            security_mode,
            capabilities,
            previous_session_id,
            security_blob: body_slice(buf, blob_offset, blob_length)?.to_vec(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::FIXED + self.security_blob.len());
        buf.write_u16::<LittleEndian>(structure_size::SESSION_SETUP_REQUEST)?;
        buf.write_u8(self.flags)?;
        buf.write_u8(self.security_mode.bits() as u8)?;
        buf.write_u32::<LittleEndian>(self.capabilities)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>((SMB2_HEADER_SIZE + Self::FIXED) as u16)?;
        buf.write_u16::<LittleEndian>(self.security_blob.len() as u16)?;
        buf.write_u64::<LittleEndian>(self.previous_session_id)?;
        buf.write_all(&self.security_blob)?;
        if self.security_blob.is_empty() {
            buf.push(0);
        }
        Ok(buf)
    }
}

/// SMB2 SessionSetup Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2SessionSetupResponse {
    pub session_flags: SessionFlags,
    pub security_blob: Vec<u8>,
}

impl Smb2SessionSetupResponse {
    const FIXED: usize = 8;

    pub fn new(session_flags: SessionFlags, security_blob: Vec<u8>) -> Self {
        Self {
            session_flags,
            security_blob,
        }
    }
}

impl SmbMessage for Smb2SessionSetupResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::FIXED, "SessionSetup response")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(
            &mut cursor,
            structure_size::SESSION_SETUP_RESPONSE,
            "session setup response",
        )?;

        let session_flags = SessionFlags::from_bits_truncate(cursor.read_u16::<LittleEndian>()?);
        let blob_offset = cursor.read_u16::<LittleEndian>()? as usize;
        let blob_length = cursor.read_u16::<LittleEndian>()? as usize;

        Ok(Self {
            session_flags,
            security_blob: body_slice(buf, blob_offset, blob_length)?.to_vec(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::FIXED + self.security_blob.len());
        buf.write_u16::<LittleEndian>(structure_size::SESSION_SETUP_RESPONSE)?;
        buf.write_u16::<LittleEndian>(self.session_flags.bits())?;
        buf.write_u16::<LittleEndian>((SMB2_HEADER_SIZE + Self::FIXED) as u16)?;
        buf.write_u16::<LittleEndian>(self.security_blob.len() as u16)?;
        buf.write_all(&self.security_blob)?;
        if self.security_blob.is_empty() {
            buf.push(0);
        }
        Ok(buf)
    }
}
