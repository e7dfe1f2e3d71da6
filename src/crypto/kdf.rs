//! SP800-108 counter-mode key derivation (HMAC-SHA256, 128-bit output)

use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Derived keys are always 128 bits in SMB 3.x
pub type DerivedKey = Zeroizing<[u8; 16]>;

/// Labels and contexts for the signing key
pub const SMB30_SIGNING_LABEL: &[u8] = b"SMB2AESCMAC\0";
pub const SMB30_SIGNING_CONTEXT: &[u8] = b"SmbSign\0";
pub const SMB311_SIGNING_LABEL: &[u8] = b"SMBSigningKey\0";

/// Labels and contexts for the encryption keys. "ServerIn" protects what
/// the server receives, "ServerOut" what it sends.
pub const SMB30_CIPHER_LABEL: &[u8] = b"SMB2AESCCM\0";
pub const SMB30_SERVER_IN_CONTEXT: &[u8] = b"ServerIn \0";
pub const SMB30_SERVER_OUT_CONTEXT: &[u8] = b"ServerOut\0";
pub const SMB311_C2S_CIPHER_LABEL: &[u8] = b"SMBC2SCipherKey\0";
pub const SMB311_S2C_CIPHER_LABEL: &[u8] = b"SMBS2CCipherKey\0";

/// The session key as KDF input: first 16 bytes, zero-padded.
pub fn base_key(session_key: &[u8]) -> Result<DerivedKey> {
    if session_key.is_empty() {
        return Err(Error::CryptoError("empty session key".into()));
    }
    let mut base = Zeroizing::new([0u8; 16]);
    let len = session_key.len().min(16);
    base[..len].copy_from_slice(&session_key[..len]);
    Ok(base)
}

/// `KDF(Ki, label, context)` with a single iteration:
/// `HMAC(Ki, i=1 || label || 0x00 || context || L=128)`.
pub fn derive_key(key: &[u8], label: &[u8], context: &[u8]) -> Result<DerivedKey> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::CryptoError(format!("HMAC error: {}", e)))?;
    mac.update(&1u32.to_be_bytes());
    mac.update(label);
    mac.update(&[0u8]);
    mac.update(context);
    mac.update(&128u32.to_be_bytes());
    let full = mac.finalize().into_bytes();

    let mut derived = Zeroizing::new([0u8; 16]);
    derived.copy_from_slice(&full[..16]);
    Ok(derived)
}
