//! SMB2 File Operation messages (Create, Close, Flush, Read, Write)

use super::common::{body_slice, check_structure_size, decode_utf16, encode_utf16, ensure_len, SmbMessage};
use crate::error::Result;
use crate::protocol::header::FileId;
use crate::protocol::smb2_constants::{
    impersonation_level, structure_size, CreateDisposition, CreateOptions, DesiredAccess,
    FileAttributes, ShareAccess, SMB2_HEADER_SIZE,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};

/// SMB2 Create (Open) Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2CreateRequest {
    pub requested_oplock_level: u8,
    pub impersonation_level: u32,
    pub desired_access: DesiredAccess,
    pub file_attributes: FileAttributes,
    pub share_access: ShareAccess,
    pub create_disposition: CreateDisposition,
    pub create_options: CreateOptions,
    pub file_name: String,
}

impl Smb2CreateRequest {
    const FIXED: usize = 56;

    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            requested_oplock_level: 0,
            impersonation_level: impersonation_level::IMPERSONATION,
            desired_access: DesiredAccess::FILE_GENERIC_READ,
            file_attributes: FileAttributes::NORMAL,
            share_access: ShareAccess::FILE_SHARE_READ | ShareAccess::FILE_SHARE_WRITE,
            create_disposition: CreateDisposition::Open,
            create_options: CreateOptions::empty(),
            file_name: file_name.into(),
        }
    }
}

impl SmbMessage for Smb2CreateRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::FIXED, "Create request")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::CREATE_REQUEST, "create request")?;

        let _security_flags = cursor.read_u8()?;
        let requested_oplock_level = cursor.read_u8()?;
        let impersonation_level = cursor.read_u32::<LittleEndian>()?;
        let _smb_create_flags = cursor.read_u64::<LittleEndian>()?;
        let _reserved = cursor.read_u64::<LittleEndian>()?;
        let desired_access = DesiredAccess::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let file_attributes = FileAttributes::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let share_access = ShareAccess::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let create_disposition = CreateDisposition::try_from(cursor.read_u32::<LittleEndian>()?)?;
        let create_options = CreateOptions::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let name_offset = cursor.read_u16::<LittleEndian>()? as usize;
        let name_length = cursor.read_u16::<LittleEndian>()? as usize;

        Ok(Self {
            requested_oplock_level,
            impersonation_level,
            desired_access,
            file_attributes,
            share_access,
            create_disposition,
            create_options,
            file_name: decode_utf16(body_slice(buf, name_offset, name_length)?),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let name_bytes = encode_utf16(&self.file_name);
        let mut buf = Vec::with_capacity(Self::FIXED + name_bytes.len().max(1));
        buf.write_u16::<LittleEndian>(structure_size::CREATE_REQUEST)?;
        buf.write_u8(0)?;
        buf.write_u8(self.requested_oplock_level)?;
        buf.write_u32::<LittleEndian>(self.impersonation_level)?;
        buf.write_u64::<LittleEndian>(0)?;
        buf.write_u64::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.desired_access.bits())?;
        buf.write_u32::<LittleEndian>(self.file_attributes.bits())?;
        buf.write_u32::<LittleEndian>(self.share_access.bits())?;
        buf.write_u32::<LittleEndian>(self.create_disposition as u32)?;
        buf.write_u32::<LittleEndian>(self.create_options.bits())?;
        buf.write_u16::<LittleEndian>((SMB2_HEADER_SIZE + Self::FIXED) as u16)?;
        buf.write_u16::<LittleEndian>(name_bytes.len() as u16)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_all(&name_bytes)?;
        if name_bytes.is_empty() {
            buf.push(0);
        }
        Ok(buf)
    }
}

/// SMB2 Create (Open) Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2CreateResponse {
    pub oplock_level: u8,
    pub create_action: u32,
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub file_attributes: FileAttributes,
    pub file_id: FileId,
}

impl Smb2CreateResponse {
    pub fn new(file_id: FileId) -> Self {
        Self {
            oplock_level: 0,
            create_action: 1,
            allocation_size: 0,
            end_of_file: 0,
            file_attributes: FileAttributes::NORMAL,
            file_id,
        }
    }
}

impl SmbMessage for Smb2CreateResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 88, "Create response")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::CREATE_RESPONSE, "create response")?;

        let oplock_level = cursor.read_u8()?;
        let _flags = cursor.read_u8()?;
        let create_action = cursor.read_u32::<LittleEndian>()?;
        // Creation, last access, last write and change times
        for _ in 0..4 {
            cursor.read_u64::<LittleEndian>()?;
        }
        let allocation_size = cursor.read_u64::<LittleEndian>()?;
        let end_of_file = cursor.read_u64::<LittleEndian>()?;
        let file_attributes = FileAttributes::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let _reserved2 = cursor.read_u32::<LittleEndian>()?;
        let file_id = FileId::read_from(&mut cursor)?;

        Ok(Self {
            oplock_level,
            create_action,
            allocation_size,
            end_of_file,
            file_attributes,
            file_id,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(89);
        buf.write_u16::<LittleEndian>(structure_size::CREATE_RESPONSE)?;
        buf.write_u8(self.oplock_level)?;
        buf.write_u8(0)?;
        buf.write_u32::<LittleEndian>(self.create_action)?;
        for _ in 0..4 {
            buf.write_u64::<LittleEndian>(0)?;
        }
        buf.write_u64::<LittleEndian>(self.allocation_size)?;
        buf.write_u64::<LittleEndian>(self.end_of_file)?;
        buf.write_u32::<LittleEndian>(self.file_attributes.bits())?;
        buf.write_u32::<LittleEndian>(0)?;
        self.file_id.write_to(&mut buf)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.push(0);
        Ok(buf)
    }
}

/// SMB2 Close Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Smb2CloseRequest {
    pub flags: u16,
    pub file_id: FileId,
}

impl Smb2CloseRequest {
    pub fn new(file_id: FileId) -> Self {
        Self { flags: 0, file_id }
    }
}

impl SmbMessage for Smb2CloseRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 24, "Close request")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::CLOSE_REQUEST, "close request")?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let _reserved = cursor.read_u32::<LittleEndian>()?;
        let file_id = FileId::read_from(&mut cursor)?;
        Ok(Self { flags, file_id })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(24);
        buf.write_u16::<LittleEndian>(structure_size::CLOSE_REQUEST)?;
        buf.write_u16::<LittleEndian>(self.flags)?;
        buf.write_u32::<LittleEndian>(0)?;
        self.file_id.write_to(&mut buf)?;
        Ok(buf)
    }
}

/// SMB2 Close Response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Smb2CloseResponse {
    pub end_of_file: u64,
}

impl SmbMessage for Smb2CloseResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 60, "Close response")?;
        let mut cursor = io::Cursor::new(&buf[48..56]);
        Ok(Self {
            end_of_file: cursor.read_u64::<LittleEndian>()?,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(60);
        buf.write_u16::<LittleEndian>(structure_size::CLOSE_RESPONSE)?;
        buf.resize(48, 0);
        buf.write_u64::<LittleEndian>(self.end_of_file)?;
        buf.write_u32::<LittleEndian>(0)?;
        Ok(buf)
    }
}

/// SMB2 Flush Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Smb2FlushRequest {
    pub file_id: FileId,
}

impl SmbMessage for Smb2FlushRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 24, "Flush request")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::FLUSH_REQUEST, "flush request")?;
        cursor.set_position(8);
        Ok(Self {
            file_id: FileId::read_from(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(24);
        buf.write_u16::<LittleEndian>(structure_size::FLUSH_REQUEST)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        self.file_id.write_to(&mut buf)?;
        Ok(buf)
    }
}

/// SMB2 Read Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Smb2ReadRequest {
    pub length: u32,
    pub offset: u64,
    pub file_id: FileId,
    pub minimum_count: u32,
}

impl Smb2ReadRequest {
    pub fn new(file_id: FileId, offset: u64, length: u32) -> Self {
        Self {
            length,
            offset,
            file_id,
            minimum_count: 0,
        }
    }
}

impl SmbMessage for Smb2ReadRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 48, "Read request")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::READ_REQUEST, "read request")?;
        let _padding = cursor.read_u8()?;
        let _flags = cursor.read_u8()?;
        let length = cursor.read_u32::<LittleEndian>()?;
        let offset = cursor.read_u64::<LittleEndian>()?;
        let file_id = FileId::read_from(&mut cursor)?;
        let minimum_count = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            length,
            offset,
            file_id,
            minimum_count,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(49);
        buf.write_u16::<LittleEndian>(structure_size::READ_REQUEST)?;
        buf.write_u8(0x50)?;
        buf.write_u8(0)?;
        buf.write_u32::<LittleEndian>(self.length)?;
        buf.write_u64::<LittleEndian>(self.offset)?;
        self.file_id.write_to(&mut buf)?;
        buf.write_u32::<LittleEndian>(self.minimum_count)?;
        // Channel, RemainingBytes, ReadChannelInfoOffset/Length
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.push(0);
        Ok(buf)
    }
}

/// SMB2 Read Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2ReadResponse {
    pub data_remaining: u32,
    pub data: Vec<u8>,
}

impl Smb2ReadResponse {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data_remaining: 0,
            data,
        }
    }
}

impl SmbMessage for Smb2ReadResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 16, "Read response")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::READ_RESPONSE, "read response")?;
        let data_offset = cursor.read_u8()? as usize;
        let _reserved = cursor.read_u8()?;
        let data_length = cursor.read_u32::<LittleEndian>()? as usize;
        let data_remaining = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            data_remaining,
            data: body_slice(buf, data_offset, data_length)?.to_vec(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16 + self.data.len());
        buf.write_u16::<LittleEndian>(structure_size::READ_RESPONSE)?;
        buf.write_u8((SMB2_HEADER_SIZE + 16) as u8)?;
        buf.write_u8(0)?;
        buf.write_u32::<LittleEndian>(self.data.len() as u32)?;
        buf.write_u32::<LittleEndian>(self.data_remaining)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_all(&self.data)?;
        if self.data.is_empty() {
            buf.push(0);
        }
        Ok(buf)
    }
}

/// SMB2 Write Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2WriteRequest {
    pub offset: u64,
    pub file_id: FileId,
    pub flags: u32,
    pub data: Vec<u8>,
}

impl Smb2WriteRequest {
    const FIXED: usize = 48;

    pub fn new(file_id: FileId, offset: u64, data: Vec<u8>) -> Self {
        Self {
            offset,
            file_id,
            flags: 0,
            data,
        }
    }
}

impl SmbMessage for Smb2WriteRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::FIXED, "Write request")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::WRITE_REQUEST, "write request")?;
        let data_offset = cursor.read_u16::<LittleEndian>()? as usize;
        let length = cursor.read_u32::<LittleEndian>()? as usize;
        let offset = cursor.read_u64::<LittleEndian>()?;
        let file_id = FileId::read_from(&mut cursor)?;
        let _channel = cursor.read_u32::<LittleEndian>()?;
        let _remaining = cursor.read_u32::<LittleEndian>()?;
        let _channel_info = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            offset,
            file_id,
            flags,
            data: body_slice(buf, data_offset, length)?.to_vec(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::FIXED + self.data.len());
        buf.write_u16::<LittleEndian>(structure_size::WRITE_REQUEST)?;
        buf.write_u16::<LittleEndian>((SMB2_HEADER_SIZE + Self::FIXED) as u16)?;
        buf.write_u32::<LittleEndian>(self.data.len() as u32)?;
        buf.write_u64::<LittleEndian>(self.offset)?;
        self.file_id.write_to(&mut buf)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.flags)?;
        buf.write_all(&self.data)?;
        if self.data.is_empty() {
            buf.push(0);
        }
        Ok(buf)
    }
}

/// SMB2 Write Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Smb2WriteResponse {
    pub count: u32,
}

impl SmbMessage for Smb2WriteResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 16, "Write response")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::WRITE_RESPONSE, "write response")?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            count: cursor.read_u32::<LittleEndian>()?,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(17);
        buf.write_u16::<LittleEndian>(structure_size::WRITE_RESPONSE)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.count)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.push(0);
        Ok(buf)
    }
}
