//! SMB2 Negotiate messages

use super::common::{body_slice, check_structure_size, ensure_len, SmbMessage};
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{
    negotiate_context, structure_size, SecurityMode, Smb2Capabilities, Smb2Dialect,
    SMB2_HEADER_SIZE,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use uuid::Uuid;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// SMB 3.1.1 Negotiate Context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateContext {
    PreauthIntegrityCapabilities {
        hash_algorithms: Vec<u16>,
        salt: Vec<u8>,
    },
    EncryptionCapabilities {
        ciphers: Vec<u16>,
    },
    Other {
        context_type: u16,
        data: Vec<u8>,
    },
}

impl NegotiateContext {
    pub fn preauth_sha512(salt: Vec<u8>) -> Self {
        Self::PreauthIntegrityCapabilities {
            hash_algorithms: vec![negotiate_context::HASH_ALGORITHM_SHA512],
            salt,
        }
    }

    fn context_type(&self) -> u16 {
        match self {
            Self::PreauthIntegrityCapabilities { .. } => {
                negotiate_context::PREAUTH_INTEGRITY_CAPABILITIES
            }
            Self::EncryptionCapabilities { .. } => negotiate_context::ENCRYPTION_CAPABILITIES,
            Self::Other { context_type, .. } => *context_type,
        }
    }

    fn data(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        match self {
            Self::PreauthIntegrityCapabilities {
                hash_algorithms,
                salt,
            } => {
                data.write_u16::<LittleEndian>(hash_algorithms.len() as u16)?;
                data.write_u16::<LittleEndian>(salt.len() as u16)?;
                for algorithm in hash_algorithms {
                    data.write_u16::<LittleEndian>(*algorithm)?;
                }
                data.write_all(salt)?;
            }
            Self::EncryptionCapabilities { ciphers } => {
                data.write_u16::<LittleEndian>(ciphers.len() as u16)?;
                for cipher in ciphers {
                    data.write_u16::<LittleEndian>(*cipher)?;
                }
            }
            Self::Other { data: raw, .. } => data.extend_from_slice(raw),
        }
        Ok(data)
    }

    fn parse_one(context_type: u16, data: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(data);
        match context_type {
            negotiate_context::PREAUTH_INTEGRITY_CAPABILITIES => {
                let count = cursor.read_u16::<LittleEndian>()?;
                let salt_len = cursor.read_u16::<LittleEndian>()?;
                let mut hash_algorithms = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    hash_algorithms.push(cursor.read_u16::<LittleEndian>()?);
                }
                let mut salt = vec![0u8; salt_len as usize];
                cursor.read_exact(&mut salt)?;
                Ok(Self::PreauthIntegrityCapabilities {
                    hash_algorithms,
                    salt,
                })
            }
            negotiate_context::ENCRYPTION_CAPABILITIES => {
                let count = cursor.read_u16::<LittleEndian>()?;
                let mut ciphers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    ciphers.push(cursor.read_u16::<LittleEndian>()?);
                }
                Ok(Self::EncryptionCapabilities { ciphers })
            }
            other => Ok(Self::Other {
                context_type: other,
                data: data.to_vec(),
            }),
        }
    }
}

/// Append contexts to a body, 8-byte aligned relative to the header start.
/// Returns the header-relative offset of the first context.
fn write_contexts(buf: &mut Vec<u8>, contexts: &[NegotiateContext]) -> Result<u32> {
    let start = align8(SMB2_HEADER_SIZE + buf.len());
    buf.resize(start - SMB2_HEADER_SIZE, 0);
    for (i, context) in contexts.iter().enumerate() {
        if i > 0 {
            let aligned = align8(SMB2_HEADER_SIZE + buf.len());
            buf.resize(aligned - SMB2_HEADER_SIZE, 0);
        }
        let data = context.data()?;
        buf.write_u16::<LittleEndian>(context.context_type())?;
        buf.write_u16::<LittleEndian>(data.len() as u16)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_all(&data)?;
    }
    Ok(start as u32)
}

fn parse_contexts(buf: &[u8], offset: usize, count: usize) -> Result<Vec<NegotiateContext>> {
    let mut contexts = Vec::with_capacity(count);
    let mut position = offset;
    for _ in 0..count {
        position = align8(position);
        let header = body_slice(buf, position, 8)?;
        let mut cursor = io::Cursor::new(header);
        let context_type = cursor.read_u16::<LittleEndian>()?;
        let length = cursor.read_u16::<LittleEndian>()? as usize;
        let data = body_slice(buf, position + 8, length)?;
        contexts.push(NegotiateContext::parse_one(context_type, data)?);
        position += 8 + length;
    }
    Ok(contexts)
}

/// SMB2 Negotiate Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2NegotiateRequest {
    pub security_mode: SecurityMode,
    pub capabilities: Smb2Capabilities,
    pub client_guid: Uuid,
    pub dialects: Vec<Smb2Dialect>,
    pub negotiate_contexts: Vec<NegotiateContext>,
}

impl Smb2NegotiateRequest {
    pub fn new(dialects: Vec<Smb2Dialect>, client_guid: Uuid) -> Self {
        Self {
            security_mode: SecurityMode::SIGNING_ENABLED,
            capabilities: Smb2Capabilities::empty(),
            client_guid,
            dialects,
            negotiate_contexts: Vec::new(),
        }
    }

    pub fn with_contexts(mut self, contexts: Vec<NegotiateContext>) -> Self {
        self.negotiate_contexts = contexts;
        self
    }
}

impl SmbMessage for Smb2NegotiateRequest {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 36, "Negotiate request")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(&mut cursor, structure_size::NEGOTIATE_REQUEST, "negotiate request")?;

        let dialect_count = cursor.read_u16::<LittleEndian>()?;
        let security_mode = SecurityMode::from_bits_truncate(cursor.read_u16::<LittleEndian>()?);
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let capabilities =
            Smb2Capabilities::from_bits_truncate(cursor.read_u32::<LittleEndian>()?);

        let mut guid_bytes = [0u8; 16];
        cursor.read_exact(&mut guid_bytes)?;
        let client_guid = Uuid::from_bytes(guid_bytes);

        let context_offset = cursor.read_u32::<LittleEndian>()? as usize;
        let context_count = cursor.read_u16::<LittleEndian>()? as usize;
        let _reserved2 = cursor.read_u16::<LittleEndian>()?;

        let mut dialects = Vec::with_capacity(dialect_count as usize);
        for _ in 0..dialect_count {
            // Dialects this crate does not know are skipped, not rejected
            if let Ok(dialect) = Smb2Dialect::try_from(cursor.read_u16::<LittleEndian>()?) {
                dialects.push(dialect);
            }
        }

        let negotiate_contexts = if dialects.contains(&Smb2Dialect::Smb311) && context_count > 0 {
            parse_contexts(buf, context_offset, context_count)?
        } else {
            Vec::new()
        };

        Ok(Self {
            security_mode,
            capabilities,
            client_guid,
            dialects,
            negotiate_contexts,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u16::<LittleEndian>(structure_size::NEGOTIATE_REQUEST)?;
        buf.write_u16::<LittleEndian>(self.dialects.len() as u16)?;
        buf.write_u16::<LittleEndian>(self.security_mode.bits())?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.capabilities.bits())?;
        buf.write_all(self.client_guid.as_bytes())?;
        // NegotiateContextOffset/Count, or ClientStartTime when no contexts
        buf.write_u64::<LittleEndian>(0)?;

        for dialect in &self.dialects {
            buf.write_u16::<LittleEndian>(dialect.to_u16())?;
        }

        if !self.negotiate_contexts.is_empty() {
            let offset = write_contexts(&mut buf, &self.negotiate_contexts)?;
            buf[28..32].copy_from_slice(&offset.to_le_bytes());
            buf[32..34].copy_from_slice(&(self.negotiate_contexts.len() as u16).to_le_bytes());
        }

        Ok(buf)
    }
}

/// SMB2 Negotiate Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2NegotiateResponse {
    pub security_mode: SecurityMode,
    pub dialect_revision: Smb2Dialect,
    pub server_guid: Uuid,
    pub capabilities: Smb2Capabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub system_time: u64,
    pub security_blob: Vec<u8>,
    pub negotiate_contexts: Vec<NegotiateContext>,
}

impl Smb2NegotiateResponse {
    pub fn new(dialect: Smb2Dialect) -> Self {
        Self {
            security_mode: SecurityMode::SIGNING_ENABLED,
            dialect_revision: dialect,
            server_guid: Uuid::nil(),
            capabilities: Smb2Capabilities::empty(),
            max_transact_size: 1048576,
            max_read_size: 1048576,
            max_write_size: 1048576,
            system_time: 0,
            security_blob: Vec::new(),
            negotiate_contexts: Vec::new(),
        }
    }

    /// Hash algorithms the server selected for pre-auth integrity, if any.
    pub fn preauth_hash_algorithms(&self) -> Option<&[u16]> {
        self.negotiate_contexts.iter().find_map(|context| match context {
            NegotiateContext::PreauthIntegrityCapabilities {
                hash_algorithms, ..
            } => Some(hash_algorithms.as_slice()),
            _ => None,
        })
    }

    /// Cipher picked by a 3.1.1 server; zero means it declined encryption.
    pub fn encryption_cipher(&self) -> Option<u16> {
        self.negotiate_contexts.iter().find_map(|context| match context {
            NegotiateContext::EncryptionCapabilities { ciphers } => ciphers.first().copied(),
            _ => None,
        })
    }
}

impl SmbMessage for Smb2NegotiateResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, 64, "Negotiate response")?;
        let mut cursor = io::Cursor::new(buf);
        check_structure_size(
            &mut cursor,
            structure_size::NEGOTIATE_RESPONSE,
            "negotiate response",
        )?;

        let security_mode = SecurityMode::from_bits_truncate(cursor.read_u16::<LittleEndian>()?);
        let dialect_revision = Smb2Dialect::try_from(cursor.read_u16::<LittleEndian>()?)
            .map_err(|e| Error::Protocol(format!("Server selected unsupported dialect: {}", e)))?;
        let context_count = cursor.read_u16::<LittleEndian>()? as usize;

        let mut guid_bytes = [0u8; 16];
        cursor.read_exact(&mut guid_bytes)?;
        let server_guid = Uuid::from_bytes(guid_bytes);

        let capabilities =
            Smb2Capabilities::from_bits_truncate(cursor.read_u32::<LittleEndian>()?);
        let max_transact_size = cursor.read_u32::<LittleEndian>()?;
        let max_read_size = cursor.read_u32::<LittleEndian>()?;
        let max_write_size = cursor.read_u32::<LittleEndian>()?;
        let system_time = cursor.read_u64::<LittleEndian>()?;
        let _server_start_time = cursor.read_u64::<LittleEndian>()?;
        let security_buffer_offset = cursor.read_u16::<LittleEndian>()? as usize;
        let security_buffer_length = cursor.read_u16::<LittleEndian>()? as usize;
        let context_offset = cursor.read_u32::<LittleEndian>()? as usize;

        let security_blob =
            body_slice(buf, security_buffer_offset, security_buffer_length)?.to_vec();

        let negotiate_contexts = if dialect_revision.has_preauth_integrity() && context_count > 0 {
            parse_contexts(buf, context_offset, context_count)?
        } else {
            Vec::new()
        };

        Ok(Self {
            security_mode,
            dialect_revision,
            server_guid,
            capabilities,
            max_transact_size,
            max_read_size,
            max_write_size,
            system_time,
            security_blob,
            negotiate_contexts,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u16::<LittleEndian>(structure_size::NEGOTIATE_RESPONSE)?;
        buf.write_u16::<LittleEndian>(self.security_mode.bits())?;
        buf.write_u16::<LittleEndian>(self.dialect_revision.to_u16())?;
        buf.write_u16::<LittleEndian>(self.negotiate_contexts.len() as u16)?;
        buf.write_all(self.server_guid.as_bytes())?;
        buf.write_u32::<LittleEndian>(self.capabilities.bits())?;
        buf.write_u32::<LittleEndian>(self.max_transact_size)?;
        buf.write_u32::<LittleEndian>(self.max_read_size)?;
        buf.write_u32::<LittleEndian>(self.max_write_size)?;
        buf.write_u64::<LittleEndian>(self.system_time)?;
        buf.write_u64::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>((SMB2_HEADER_SIZE + 64) as u16)?;
        buf.write_u16::<LittleEndian>(self.security_blob.len() as u16)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_all(&self.security_blob)?;
        if self.security_blob.is_empty() {
            buf.push(0);
        }

        if !self.negotiate_contexts.is_empty() {
            let offset = write_contexts(&mut buf, &self.negotiate_contexts)?;
            buf[60..64].copy_from_slice(&offset.to_le_bytes());
        }

        Ok(buf)
    }
}
