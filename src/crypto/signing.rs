//! Per-message signing and verification

use super::kdf::{self, DerivedKey};
use super::preauth::PreauthHash;
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::Smb2Dialect;
use crate::protocol::Smb2Header;
use aes::Aes128;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use tracing::trace;

type HmacSha256 = Hmac<Sha256>;
type AesCmac = Cmac<Aes128>;

const SIG_START: usize = Smb2Header::SIGNATURE_OFFSET;
const SIG_END: usize = Smb2Header::SIGNATURE_OFFSET + Smb2Header::SIGNATURE_SIZE;

/// MAC used for message signing, chosen by the negotiated dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    /// 2.0.2 and 2.1: HMAC-SHA256 truncated to 16 bytes
    HmacSha256,
    /// 3.0 and later: AES-128-CMAC
    AesCmac,
}

impl SigningAlgorithm {
    pub fn for_dialect(dialect: Smb2Dialect) -> Self {
        if dialect.is_smb3() {
            SigningAlgorithm::AesCmac
        } else {
            SigningAlgorithm::HmacSha256
        }
    }
}

/// Signs outgoing and verifies incoming messages for one session.
///
/// The key is wiped when the signer is dropped.
#[derive(Clone)]
pub struct Signer {
    algorithm: SigningAlgorithm,
    key: DerivedKey,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(algorithm: SigningAlgorithm, key: DerivedKey) -> Self {
        Self { algorithm, key }
    }

    /// Derive the signing key for a freshly authenticated session.
    pub fn for_session(
        dialect: Smb2Dialect,
        session_key: &[u8],
        preauth: Option<&PreauthHash>,
    ) -> Result<Self> {
        let base = kdf::base_key(session_key)?;
        let algorithm = SigningAlgorithm::for_dialect(dialect);
        let key = match dialect {
            Smb2Dialect::Smb202 | Smb2Dialect::Smb210 => base,
            Smb2Dialect::Smb300 | Smb2Dialect::Smb302 => kdf::derive_key(
                &base[..],
                kdf::SMB30_SIGNING_LABEL,
                kdf::SMB30_SIGNING_CONTEXT,
            )?,
            Smb2Dialect::Smb311 => {
                let preauth = preauth.ok_or_else(|| {
                    Error::CryptoError("3.1.1 signing needs the pre-auth hash".into())
                })?;
                kdf::derive_key(&base[..], kdf::SMB311_SIGNING_LABEL, preauth.as_bytes())?
            }
        };

        trace!("Derived {:?} signing key for dialect {}", algorithm, dialect);
        Ok(Self::new(algorithm, key))
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// Set the SIGNED flag and write the signature into `message` in place.
    pub fn sign(&self, message: &mut [u8]) -> Result<()> {
        check_len(message)?;
        Smb2Header::mark_signed(message);
        let signature = self.compute(message)?;
        message[SIG_START..SIG_END].copy_from_slice(&signature);
        Ok(())
    }

    /// Verify the signature of one message, in constant time.
    pub fn verify(&self, message: &[u8]) -> Result<()> {
        check_len(message)?;
        let received = &message[SIG_START..SIG_END];
        let ok = match self.algorithm {
            SigningAlgorithm::HmacSha256 => {
                let mac = feed(new_hmac(&self.key[..])?, message);
                mac.verify_truncated_left(received).is_ok()
            }
            SigningAlgorithm::AesCmac => {
                let mac = feed(new_cmac(&self.key[..])?, message);
                mac.verify_slice(received).is_ok()
            }
        };

        if ok {
            Ok(())
        } else {
            let message_id = u64::from_le_bytes(
                message[24..32]
                    .try_into()
                    .map_err(|_| Error::InvalidHeader("truncated message id".into()))?,
            );
            Err(Error::SignatureValidation { message_id })
        }
    }

    fn compute(&self, message: &[u8]) -> Result<[u8; 16]> {
        let mut signature = [0u8; 16];
        match self.algorithm {
            SigningAlgorithm::HmacSha256 => {
                let full = feed(new_hmac(&self.key[..])?, message).finalize().into_bytes();
                signature.copy_from_slice(&full[..16]);
            }
            SigningAlgorithm::AesCmac => {
                let full = feed(new_cmac(&self.key[..])?, message).finalize().into_bytes();
                signature.copy_from_slice(&full);
            }
        }
        Ok(signature)
    }
}

fn check_len(message: &[u8]) -> Result<()> {
    if message.len() < Smb2Header::SIZE {
        return Err(Error::BufferTooSmall {
            need: Smb2Header::SIZE,
            have: message.len(),
        });
    }
    Ok(())
}

/// MAC the message with its signature field treated as zero.
fn feed<M: Mac>(mut mac: M, message: &[u8]) -> M {
    mac.update(&message[..SIG_START]);
    mac.update(&[0u8; Smb2Header::SIGNATURE_SIZE]);
    mac.update(&message[SIG_END..]);
    mac
}

fn new_hmac(key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::CryptoError(format!("HMAC error: {}", e)))
}

fn new_cmac(key: &[u8]) -> Result<AesCmac> {
    <AesCmac as Mac>::new_from_slice(key)
        .map_err(|e| Error::CryptoError(format!("CMAC error: {}", e)))
}
