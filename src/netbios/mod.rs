//! NetBIOS over TCP (NBT) session service and direct-TCP framing headers
//!
//! Both port 139 and direct TCP on port 445 prefix each SMB2 message with
//! the same 4-byte header. SMB2 session messages use the full 24-bit length;
//! the RFC 1002 control messages are limited to 17 bits.

use crate::error::{Error, Result};
use bytes::BufMut;
use std::convert::TryFrom;

pub mod name;

pub use name::{CalledNames, NetBiosNameType};

/// NetBIOS message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetBiosMessageType {
    SessionMessage = 0x00,
    SessionRequest = 0x81,
    PositiveResponse = 0x82,
    NegativeResponse = 0x83,
    RetargetResponse = 0x84,
    Keepalive = 0x85,
}

impl TryFrom<u8> for NetBiosMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(NetBiosMessageType::SessionMessage),
            0x81 => Ok(NetBiosMessageType::SessionRequest),
            0x82 => Ok(NetBiosMessageType::PositiveResponse),
            0x83 => Ok(NetBiosMessageType::NegativeResponse),
            0x84 => Ok(NetBiosMessageType::RetargetResponse),
            0x85 => Ok(NetBiosMessageType::Keepalive),
            _ => Err(Error::Protocol(format!(
                "Invalid NetBIOS message type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// Negative session response error codes
pub mod negative_response {
    pub const NOT_LISTENING_ON_CALLED_NAME: u8 = 0x80;
    pub const NOT_LISTENING_FOR_CALLING_NAME: u8 = 0x81;
    pub const CALLED_NAME_NOT_PRESENT: u8 = 0x82;
    pub const INSUFFICIENT_RESOURCES: u8 = 0x83;
    pub const UNSPECIFIED_ERROR: u8 = 0x8F;
}

/// Session service header (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetBiosHeader {
    /// Message type
    pub message_type: NetBiosMessageType,
    /// Length of the message payload
    pub length: u32,
}

impl NetBiosHeader {
    /// Maximum length of a control message (17 bits, RFC 1002)
    pub const MAX_LENGTH: u32 = 0x1FFFF;

    /// Maximum length of an SMB2 session message (24 bits)
    pub const MAX_SESSION_MESSAGE_LENGTH: u32 = 0xFFFFFF;

    /// Header size in bytes
    pub const SIZE: usize = 4;

    /// Largest length `message_type` can carry
    pub fn max_length(message_type: NetBiosMessageType) -> u32 {
        match message_type {
            NetBiosMessageType::SessionMessage => Self::MAX_SESSION_MESSAGE_LENGTH,
            _ => Self::MAX_LENGTH,
        }
    }

    /// Create a new NetBIOS header
    pub fn new(message_type: NetBiosMessageType, length: u32) -> Result<Self> {
        let max = Self::max_length(message_type);
        if length > max {
            return Err(Error::InvalidParameter(format!(
                "NetBIOS {:?} length {} exceeds maximum {}",
                message_type, length, max
            )));
        }
        Ok(Self {
            message_type,
            length,
        })
    }

    /// Parse a header. Session messages use all 24 length bits; the
    /// other types keep the 17-bit RFC 1002 length.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }
        let message_type = NetBiosMessageType::try_from(buf[0])?;
        let raw = ((buf[1] as u32) << 16) | ((buf[2] as u32) << 8) | (buf[3] as u32);
        Ok(Self {
            message_type,
            length: raw & Self::max_length(message_type),
        })
    }

    /// Write the header to a buffer
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.message_type as u8);
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u16(self.length as u16);
    }
}

/// Build a session request packet: header, called name, calling name.
pub fn session_request(called: &str, calling: &str) -> Result<Vec<u8>> {
    let called = name::create_netbios_session_name(called, NetBiosNameType::FileServer, "")?;
    let calling = name::create_netbios_session_name(calling, NetBiosNameType::Workstation, "")?;

    let header = NetBiosHeader::new(
        NetBiosMessageType::SessionRequest,
        (called.len() + calling.len()) as u32,
    )?;
    let mut packet = Vec::with_capacity(NetBiosHeader::SIZE + called.len() + calling.len());
    header.write_to(&mut packet);
    packet.extend_from_slice(&called);
    packet.extend_from_slice(&calling);
    Ok(packet)
}
