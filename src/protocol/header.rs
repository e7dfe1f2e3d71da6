//! SMB2 sync/async message header

use super::smb2_constants::*;
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read};

/// SMB2 Header (64 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2Header {
    pub credit_charge: u16,
    /// Raw NTSTATUS on responses, channel sequence on requests
    pub status: u32,
    pub command: Smb2Command,
    /// Credits requested (client) or granted (server)
    pub credits: u16,
    pub flags: Smb2HeaderFlags,
    pub next_command: u32,
    pub message_id: u64,
    /// Bytes 32..40: process id + tree id when sync, async id when async
    pub process_id: u32,
    pub tree_id: u32,
    pub session_id: u64,
    pub signature: [u8; 16],
}

impl Smb2Header {
    pub const SIZE: usize = SMB2_HEADER_SIZE;
    pub const FLAGS_OFFSET: usize = 16;
    pub const NEXT_COMMAND_OFFSET: usize = 20;
    pub const SIGNATURE_OFFSET: usize = 48;
    pub const SIGNATURE_SIZE: usize = 16;

    pub fn new(command: Smb2Command) -> Self {
        Self {
            credit_charge: 0,
            status: 0,
            command,
            credits: 1,
            flags: Smb2HeaderFlags::empty(),
            next_command: 0,
            message_id: 0,
            process_id: 0xFEFF,
            tree_id: 0,
            session_id: 0,
            signature: [0; 16],
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }

        if buf[0..4] != SMB2_MAGIC {
            if buf[0..4] == SMB2_TRANSFORM_MAGIC {
                return Err(Error::EncryptionUnsupported(
                    "received an encrypted message".into(),
                ));
            }
            return Err(Error::InvalidHeader("Invalid SMB2 magic".into()));
        }

        let mut cursor = io::Cursor::new(&buf[4..]);
        let structure_size = cursor.read_u16::<LittleEndian>()?;
        if structure_size != 64 {
            return Err(Error::InvalidHeader(format!(
                "Invalid header structure size: {}",
                structure_size
            )));
        }
        let credit_charge = cursor.read_u16::<LittleEndian>()?;
        let status = cursor.read_u32::<LittleEndian>()?;
        let command = Smb2Command::try_from(cursor.read_u16::<LittleEndian>()?)?;
        let credits = cursor.read_u16::<LittleEndian>()?;
        let flags = Smb2HeaderFlags::from_bits_truncate(cursor.read_u32::<LittleEndian>()?);
        let next_command = cursor.read_u32::<LittleEndian>()?;
        let message_id = cursor.read_u64::<LittleEndian>()?;
        let process_id = cursor.read_u32::<LittleEndian>()?;
        let tree_id = cursor.read_u32::<LittleEndian>()?;
        let session_id = cursor.read_u64::<LittleEndian>()?;

        let mut signature = [0u8; 16];
        cursor.read_exact(&mut signature)?;

        Ok(Self {
            credit_charge,
            status,
            command,
            credits,
            flags,
            next_command,
            message_id,
            process_id,
            tree_id,
            session_id,
            signature,
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&SMB2_MAGIC);
        buf.write_u16::<LittleEndian>(64)?;
        buf.write_u16::<LittleEndian>(self.credit_charge)?;
        buf.write_u32::<LittleEndian>(self.status)?;
        buf.write_u16::<LittleEndian>(self.command as u16)?;
        buf.write_u16::<LittleEndian>(self.credits)?;
        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        buf.write_u32::<LittleEndian>(self.next_command)?;
        buf.write_u64::<LittleEndian>(self.message_id)?;
        buf.write_u32::<LittleEndian>(self.process_id)?;
        buf.write_u32::<LittleEndian>(self.tree_id)?;
        buf.write_u64::<LittleEndian>(self.session_id)?;
        buf.extend_from_slice(&self.signature);
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::RESPONSE)
    }

    pub fn is_async(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::ASYNC_COMMAND)
    }

    pub fn is_signed(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::SIGNED)
    }

    pub fn async_id(&self) -> u64 {
        ((self.tree_id as u64) << 32) | self.process_id as u64
    }

    /// Set the SIGNED flag in an already serialized message.
    pub fn mark_signed(message: &mut [u8]) {
        let offset = Self::FLAGS_OFFSET;
        if message.len() >= offset + 4 {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&message[offset..offset + 4]);
            let flags = u32::from_le_bytes(raw) | Smb2HeaderFlags::SIGNED.bits();
            message[offset..offset + 4].copy_from_slice(&flags.to_le_bytes());
        }
    }

    /// Patch NextCommand in an already serialized message.
    pub fn set_next_command(message: &mut [u8], next: u32) {
        let offset = Self::NEXT_COMMAND_OFFSET;
        if message.len() >= offset + 4 {
            message[offset..offset + 4].copy_from_slice(&next.to_le_bytes());
        }
    }
}

/// Split a (possibly compounded) frame into its individual messages.
///
/// Each returned slice runs from its header to the next NextCommand offset,
/// or to the end of the frame for the last one.
pub fn split_compound(frame: &[u8]) -> Result<Vec<&[u8]>> {
    let mut messages = Vec::new();
    let mut rest = frame;
    loop {
        let header = Smb2Header::parse(rest)?;
        let next = header.next_command as usize;
        if next == 0 {
            messages.push(rest);
            return Ok(messages);
        }
        if next < Smb2Header::SIZE || next > rest.len() {
            return Err(Error::ParseError(format!(
                "Invalid NextCommand offset {} in {}-byte frame",
                next,
                rest.len()
            )));
        }
        messages.push(&rest[..next]);
        rest = &rest[next..];
    }
}

/// SMB2 file identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileId {
    pub persistent: u64,
    pub volatile: u64,
}

impl FileId {
    /// Placeholder used by related compound requests to mean "the file just opened"
    pub const RELATED: FileId = FileId {
        persistent: u64::MAX,
        volatile: u64::MAX,
    };

    pub fn with_values(persistent: u64, volatile: u64) -> Self {
        Self {
            persistent,
            volatile,
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<LittleEndian>(self.persistent)?;
        buf.write_u64::<LittleEndian>(self.volatile)?;
        Ok(())
    }

    pub fn read_from(cursor: &mut io::Cursor<&[u8]>) -> Result<Self> {
        let persistent = cursor.read_u64::<LittleEndian>()?;
        let volatile = cursor.read_u64::<LittleEndian>()?;
        Ok(Self {
            persistent,
            volatile,
        })
    }
}
