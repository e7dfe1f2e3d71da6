//! SMB2 Query Info messages

use super::common::{body_slice, check_structure_size, ensure_len, SmbMessage};
use crate::error::{Error, Result};
use crate::protocol::header::FileId;
use crate::protocol::smb2_constants::{structure_size, InfoType, SMB2_HEADER_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};

impl TryFrom<u8> for InfoType {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(InfoType::File),
            0x02 => Ok(InfoType::FileSystem),
            0x03 => Ok(InfoType::Security),
            0x04 => Ok(InfoType::Quota),
            _ => Err(Error::ParseError(format!("Invalid info type: {}", value))),
        }
    }
}

/// SMB2 QUERY_INFO Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Smb2QueryInfoRequest {
    pub info_type: InfoType,
    pub file_info_class: u8,
    pub output_buffer_length: u32,
    pub additional_information: u32,
    pub file_id: FileId,
}

impl SmbMessage for Smb2QueryInfoRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 40, "QueryInfo request")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::QUERY_INFO_REQUEST, "query info request")?;
        let info_type = InfoType::try_from(cursor.read_u8()?)?;
        let file_info_class = cursor.read_u8()?;
        let output_buffer_length = cursor.read_u32::<LittleEndian>()?;
        let _input_offset = cursor.read_u16::<LittleEndian>()?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let _input_length = cursor.read_u32::<LittleEndian>()?;
        let additional_information = cursor.read_u32::<LittleEndian>()?;
        let _flags = cursor.read_u32::<LittleEndian>()?;
        let file_id = FileId::read_from(&mut cursor)?;
        Ok(Self {
            info_type,
            file_info_class,
            output_buffer_length,
            additional_information,
            file_id,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(41);
        buf.write_u16::<LittleEndian>(structure_size::QUERY_INFO_REQUEST)?;
        buf.write_u8(self.info_type as u8)?;
        buf.write_u8(self.file_info_class)?;
        buf.write_u32::<LittleEndian>(self.output_buffer_length)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.additional_information)?;
        buf.write_u32::<LittleEndian>(0)?;
        self.file_id.write_to(&mut buf)?;
        buf.push(0);
        Ok(buf)
    }
}

/// SMB2 QUERY_INFO Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2QueryInfoResponse {
    pub output: Vec<u8>,
}

impl SmbMessage for Smb2QueryInfoResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 8, "QueryInfo response")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(
            &mut cursor,
            structure_size::QUERY_INFO_RESPONSE,
            "query info response",
        )?;
        let offset = cursor.read_u16::<LittleEndian>()? as usize;
        let length = cursor.read_u32::<LittleEndian>()? as usize;
        Ok(Self {
            output: body_slice(buf, offset, length)?.to_vec(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(8 + self.output.len());
        buf.write_u16::<LittleEndian>(structure_size::QUERY_INFO_RESPONSE)?;
        buf.write_u16::<LittleEndian>((SMB2_HEADER_SIZE + 8) as u16)?;
        buf.write_u32::<LittleEndian>(self.output.len() as u32)?;
        buf.write_all(&self.output)?;
        if self.output.is_empty() {
            buf.push(0);
        }
        Ok(buf)
    }
}
