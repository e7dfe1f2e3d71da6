//! SMB2 IOCTL messages

use super::common::{body_slice, check_structure_size, ensure_len, SmbMessage};
use crate::error::Result;
use crate::protocol::header::FileId;
use crate::protocol::smb2_constants::{structure_size, SMB2_0_IOCTL_IS_FSCTL, SMB2_HEADER_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};

/// SMB2 IOCTL Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2IoctlRequest {
    pub ctl_code: u32,
    pub file_id: FileId,
    pub max_output_response: u32,
    pub flags: u32,
    pub input: Vec<u8>,
}

impl Smb2IoctlRequest {
    const FIXED: usize = 56;

    pub fn fsctl(ctl_code: u32, file_id: FileId, input: Vec<u8>, max_output_response: u32) -> Self {
        Self {
            ctl_code,
            file_id,
            max_output_response,
            flags: SMB2_0_IOCTL_IS_FSCTL,
            input,
        }
    }
}

impl SmbMessage for Smb2IoctlRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::FIXED, "IOCTL request")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::IOCTL_REQUEST, "ioctl request")?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let ctl_code = cursor.read_u32::<LittleEndian>()?;
        let file_id = FileId::read_from(&mut cursor)?;
        let input_offset = cursor.read_u32::<LittleEndian>()? as usize;
        let input_count = cursor.read_u32::<LittleEndian>()? as usize;
        let _max_input_response = cursor.read_u32::<LittleEndian>()?;
        let _output_offset = cursor.read_u32::<LittleEndian>()?;
        let _output_count = cursor.read_u32::<LittleEndian>()?;
        let max_output_response = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            ctl_code,
            file_id,
            max_output_response,
            flags,
            input: body_slice(buf, input_offset, input_count)?.to_vec(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::FIXED + self.input.len());
        let input_offset = (SMB2_HEADER_SIZE + Self::FIXED) as u32;
        buf.write_u16::<LittleEndian>(structure_size::IOCTL_REQUEST)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.ctl_code)?;
        self.file_id.write_to(&mut buf)?;
        buf.write_u32::<LittleEndian>(if self.input.is_empty() { 0 } else { input_offset })?;
        buf.write_u32::<LittleEndian>(self.input.len() as u32)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.max_output_response)?;
        buf.write_u32::<LittleEndian>(self.flags)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_all(&self.input)?;
        Ok(buf)
    }
}

/// SMB2 IOCTL Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2IoctlResponse {
    pub ctl_code: u32,
    pub file_id: FileId,
    pub output: Vec<u8>,
}

impl SmbMessage for Smb2IoctlResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 48, "IOCTL response")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::IOCTL_RESPONSE, "ioctl response")?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let ctl_code = cursor.read_u32::<LittleEndian>()?;
        let file_id = FileId::read_from(&mut cursor)?;
        let _input_offset = cursor.read_u32::<LittleEndian>()?;
        let _input_count = cursor.read_u32::<LittleEndian>()?;
        let output_offset = cursor.read_u32::<LittleEndian>()? as usize;
        let output_count = cursor.read_u32::<LittleEndian>()? as usize;

        Ok(Self {
            ctl_code,
            file_id,
            output: body_slice(buf, output_offset, output_count)?.to_vec(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(48 + self.output.len());
        buf.write_u16::<LittleEndian>(structure_size::IOCTL_RESPONSE)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.ctl_code)?;
        self.file_id.write_to(&mut buf)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>((SMB2_HEADER_SIZE + 48) as u32)?;
        buf.write_u32::<LittleEndian>(self.output.len() as u32)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_all(&self.output)?;
        Ok(buf)
    }
}
