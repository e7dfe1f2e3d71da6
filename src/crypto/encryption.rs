//! SMB 3.x message encryption
//!
//! An encrypted frame is a 52-byte transform header followed by the
//! ciphertext of one plain (possibly compounded) SMB2 frame. Bytes 20..52
//! of the header are the associated data; the AEAD tag goes in the
//! signature field.

use super::kdf::{self, DerivedKey};
use super::preauth::PreauthHash;
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{negotiate_context, Smb2Dialect, SMB2_TRANSFORM_MAGIC};
use aes::Aes128;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes128Gcm;
use ccm::consts::{U11, U16};
use ccm::Ccm;
use rand::RngCore;
use std::fmt;
use tracing::trace;

type Aes128Ccm = Ccm<Aes128, U16, U11>;

/// Transform header size
pub const TRANSFORM_HEADER_SIZE: usize = 52;

const SIGNATURE: std::ops::Range<usize> = 4..20;
const NONCE_OFFSET: usize = 20;
const AAD_OFFSET: usize = 20;
const ORIGINAL_SIZE_OFFSET: usize = 36;
const FLAGS_OFFSET: usize = 42;
const SESSION_ID_OFFSET: usize = 44;
const FLAG_ENCRYPTED: u16 = 0x0001;

/// Negotiated AEAD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes128Ccm,
    Aes128Gcm,
}

impl CipherAlgorithm {
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            negotiate_context::CIPHER_AES128_CCM => Some(CipherAlgorithm::Aes128Ccm),
            negotiate_context::CIPHER_AES128_GCM => Some(CipherAlgorithm::Aes128Gcm),
            _ => None,
        }
    }

    pub fn id(self) -> u16 {
        match self {
            CipherAlgorithm::Aes128Ccm => negotiate_context::CIPHER_AES128_CCM,
            CipherAlgorithm::Aes128Gcm => negotiate_context::CIPHER_AES128_GCM,
        }
    }

    fn nonce_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ccm => 11,
            CipherAlgorithm::Aes128Gcm => 12,
        }
    }
}

/// Whether `frame` starts with a transform header
pub fn is_transform(frame: &[u8]) -> bool {
    frame.len() >= 4 && frame[..4] == SMB2_TRANSFORM_MAGIC
}

/// Session a transform header belongs to
pub fn transform_session_id(frame: &[u8]) -> Result<u64> {
    check_header(frame)?;
    Ok(u64::from_le_bytes(read_array(frame, SESSION_ID_OFFSET)?))
}

/// Client-to-server and server-to-client keys for one session.
pub fn derive_keys(
    dialect: Smb2Dialect,
    session_key: &[u8],
    preauth: Option<&PreauthHash>,
) -> Result<(DerivedKey, DerivedKey)> {
    let base = kdf::base_key(session_key)?;
    match dialect {
        Smb2Dialect::Smb300 | Smb2Dialect::Smb302 => Ok((
            kdf::derive_key(&base[..], kdf::SMB30_CIPHER_LABEL, kdf::SMB30_SERVER_IN_CONTEXT)?,
            kdf::derive_key(&base[..], kdf::SMB30_CIPHER_LABEL, kdf::SMB30_SERVER_OUT_CONTEXT)?,
        )),
        Smb2Dialect::Smb311 => {
            let preauth = preauth.ok_or_else(|| {
                Error::CryptoError("3.1.1 encryption needs the pre-auth hash".into())
            })?;
            Ok((
                kdf::derive_key(&base[..], kdf::SMB311_C2S_CIPHER_LABEL, preauth.as_bytes())?,
                kdf::derive_key(&base[..], kdf::SMB311_S2C_CIPHER_LABEL, preauth.as_bytes())?,
            ))
        }
        other => Err(Error::EncryptionUnsupported(format!(
            "dialect {} has no encryption",
            other
        ))),
    }
}

/// Seals outgoing and opens incoming frames for one session.
///
/// Keys are wiped when the cipher is dropped.
pub struct SessionCipher {
    algorithm: CipherAlgorithm,
    encryption_key: DerivedKey,
    decryption_key: DerivedKey,
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SessionCipher {
    pub fn new(algorithm: CipherAlgorithm, encryption_key: DerivedKey, decryption_key: DerivedKey) -> Self {
        Self {
            algorithm,
            encryption_key,
            decryption_key,
        }
    }

    /// The client's cipher for a freshly authenticated session.
    pub fn for_session(
        dialect: Smb2Dialect,
        algorithm: CipherAlgorithm,
        session_key: &[u8],
        preauth: Option<&PreauthHash>,
    ) -> Result<Self> {
        let (client_to_server, server_to_client) = derive_keys(dialect, session_key, preauth)?;
        trace!("Derived {:?} keys for dialect {}", algorithm, dialect);
        Ok(Self::new(algorithm, client_to_server, server_to_client))
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Wrap one plain frame in a transform header.
    pub fn seal(&self, session_id: u64, message: &[u8]) -> Result<Vec<u8>> {
        let original_size = u32::try_from(message.len())
            .map_err(|_| Error::InvalidParameter(format!("{} bytes to encrypt", message.len())))?;

        let mut frame = vec![0u8; TRANSFORM_HEADER_SIZE + message.len()];
        frame[..4].copy_from_slice(&SMB2_TRANSFORM_MAGIC);
        let nonce_end = NONCE_OFFSET + self.algorithm.nonce_len();
        rand::thread_rng().fill_bytes(&mut frame[NONCE_OFFSET..nonce_end]);
        frame[ORIGINAL_SIZE_OFFSET..ORIGINAL_SIZE_OFFSET + 4]
            .copy_from_slice(&original_size.to_le_bytes());
        frame[FLAGS_OFFSET..FLAGS_OFFSET + 2].copy_from_slice(&FLAG_ENCRYPTED.to_le_bytes());
        frame[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 8].copy_from_slice(&session_id.to_le_bytes());
        frame[TRANSFORM_HEADER_SIZE..].copy_from_slice(message);

        let (header, payload) = frame.split_at_mut(TRANSFORM_HEADER_SIZE);
        let tag = self.encrypt(
            &header[NONCE_OFFSET..nonce_end],
            &header[AAD_OFFSET..],
            payload,
        )?;
        header[SIGNATURE].copy_from_slice(&tag);
        Ok(frame)
    }

    /// Authenticate and decrypt one transform frame.
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>> {
        check_header(frame)?;
        let session_id = u64::from_le_bytes(read_array(frame, SESSION_ID_OFFSET)?);
        let flags = u16::from_le_bytes(read_array(frame, FLAGS_OFFSET)?);
        if flags != FLAG_ENCRYPTED {
            return Err(Error::Protocol(format!(
                "transform header flags {:#06x} are not supported",
                flags
            )));
        }
        let original_size = u32::from_le_bytes(read_array(frame, ORIGINAL_SIZE_OFFSET)?) as usize;
        if original_size != frame.len() - TRANSFORM_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "transform header announces {} bytes but carries {}",
                original_size,
                frame.len() - TRANSFORM_HEADER_SIZE
            )));
        }

        let nonce_end = NONCE_OFFSET + self.algorithm.nonce_len();
        let mut payload = frame[TRANSFORM_HEADER_SIZE..].to_vec();
        self.decrypt(
            &frame[NONCE_OFFSET..nonce_end],
            &frame[AAD_OFFSET..TRANSFORM_HEADER_SIZE],
            &mut payload,
            &frame[SIGNATURE],
        )
        .map_err(|_| Error::Decryption { session_id })?;
        Ok(payload)
    }

    fn encrypt(&self, nonce: &[u8], aad: &[u8], payload: &mut [u8]) -> Result<[u8; 16]> {
        let key = &self.encryption_key[..];
        let tag = match self.algorithm {
            CipherAlgorithm::Aes128Ccm => Aes128Ccm::new_from_slice(key)
                .map_err(key_error)?
                .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, payload),
            CipherAlgorithm::Aes128Gcm => Aes128Gcm::new_from_slice(key)
                .map_err(key_error)?
                .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, payload),
        }
        .map_err(|_| Error::CryptoError(format!("{:?} encryption failed", self.algorithm)))?;

        let mut out = [0u8; 16];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    fn decrypt(&self, nonce: &[u8], aad: &[u8], payload: &mut [u8], tag: &[u8]) -> Result<()> {
        let key = &self.decryption_key[..];
        let tag = GenericArray::from_slice(tag);
        match self.algorithm {
            CipherAlgorithm::Aes128Ccm => Aes128Ccm::new_from_slice(key)
                .map_err(key_error)?
                .decrypt_in_place_detached(GenericArray::from_slice(nonce), aad, payload, tag),
            CipherAlgorithm::Aes128Gcm => Aes128Gcm::new_from_slice(key)
                .map_err(key_error)?
                .decrypt_in_place_detached(GenericArray::from_slice(nonce), aad, payload, tag),
        }
        .map_err(|_| Error::CryptoError(format!("{:?} authentication failed", self.algorithm)))
    }
}

fn key_error(e: impl fmt::Display) -> Error {
    Error::CryptoError(format!("cipher key: {}", e))
}

fn check_header(frame: &[u8]) -> Result<()> {
    if frame.len() < TRANSFORM_HEADER_SIZE {
        return Err(Error::BufferTooSmall {
            need: TRANSFORM_HEADER_SIZE,
            have: frame.len(),
        });
    }
    if !is_transform(frame) {
        return Err(Error::InvalidHeader("missing transform magic".into()));
    }
    Ok(())
}

fn read_array<const N: usize>(frame: &[u8], offset: usize) -> Result<[u8; N]> {
    frame
        .get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| Error::InvalidHeader("truncated transform header".into()))
}
