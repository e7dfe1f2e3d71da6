//! NetBIOS name encoding and called-name selection
//!
//! NetBIOS names are 16 bytes, padded with spaces, and encoded using the
//! RFC 1001 "half-ASCII" algorithm.

use crate::error::{Error, Result};
use std::convert::TryFrom;
use std::net::IpAddr;

/// Maximum NetBIOS name length (before padding)
pub const NETBIOS_NAME_MAX_LEN: usize = 15;

/// NetBIOS name length after padding
pub const NETBIOS_NAME_LEN: usize = 16;

/// NetBIOS encoded name length (after encoding, each byte becomes 2 bytes)
pub const NETBIOS_ENCODED_NAME_LEN: usize = 32;

/// Generic name accepted by most servers when the real one is unknown
pub const SMBSERVER_NAME: &str = "*SMBSERVER";

/// NetBIOS name types (16th byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetBiosNameType {
    /// Workstation service
    Workstation = 0x00,
    /// File server service
    FileServer = 0x20,
}

impl TryFrom<u8> for NetBiosNameType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(NetBiosNameType::Workstation),
            0x20 => Ok(NetBiosNameType::FileServer),
            other => Err(other),
        }
    }
}

/// Encode a NetBIOS name using the RFC 1001 algorithm
///
/// Each byte is split into two 4-bit values and added to 'A' (0x41)
fn encode_netbios_name(
    name: &str,
    name_type: NetBiosNameType,
) -> Result<[u8; NETBIOS_ENCODED_NAME_LEN]> {
    if name.len() > NETBIOS_NAME_MAX_LEN {
        return Err(Error::InvalidNetBiosName(format!(
            "Name '{}' exceeds maximum length {}",
            name, NETBIOS_NAME_MAX_LEN
        )));
    }

    let mut padded = [0x20u8; NETBIOS_NAME_LEN];
    padded[..name.len()].copy_from_slice(name.as_bytes());
    padded[15] = name_type as u8;

    let mut encoded = [0u8; NETBIOS_ENCODED_NAME_LEN];
    for (i, &byte) in padded.iter().enumerate() {
        encoded[i * 2] = b'A' + ((byte >> 4) & 0x0F);
        encoded[i * 2 + 1] = b'A' + (byte & 0x0F);
    }

    Ok(encoded)
}

/// Decode a NetBIOS encoded name, returning the trimmed name and its type byte
#[cfg(test)]
pub(crate) fn decode_netbios_name(encoded: &[u8]) -> Result<(String, u8)> {
    if encoded.len() != NETBIOS_ENCODED_NAME_LEN {
        return Err(Error::InvalidNetBiosName(format!(
            "Encoded name length {} != {}",
            encoded.len(),
            NETBIOS_ENCODED_NAME_LEN
        )));
    }

    let mut decoded = [0u8; NETBIOS_NAME_LEN];
    for (i, slot) in decoded.iter_mut().enumerate() {
        let high = encoded[i * 2];
        let low = encoded[i * 2 + 1];
        if !(b'A'..=b'P').contains(&high) || !(b'A'..=b'P').contains(&low) {
            return Err(Error::InvalidNetBiosName(format!(
                "Invalid encoded characters at position {}",
                i
            )));
        }
        *slot = ((high - b'A') << 4) | (low - b'A');
    }

    let name = String::from_utf8_lossy(&decoded[..15]).trim_end().to_string();
    Ok((name, decoded[15]))
}

/// Encode a NetBIOS scope identifier as DNS-style labels
fn encode_netbios_scope(scope: &str) -> Vec<u8> {
    let mut encoded = Vec::new();
    if !scope.is_empty() {
        for part in scope.split('.').filter(|p| !p.is_empty() && p.len() <= 63) {
            encoded.push(part.len() as u8);
            encoded.extend_from_slice(part.as_bytes());
        }
    }
    encoded.push(0);
    encoded
}

/// Length byte, encoded name and scope, as carried in a session request
pub fn create_netbios_session_name(
    name: &str,
    name_type: NetBiosNameType,
    scope: &str,
) -> Result<Vec<u8>> {
    let encoded_name = encode_netbios_name(name, name_type)?;
    let encoded_scope = encode_netbios_scope(scope);

    let mut result = Vec::with_capacity(1 + NETBIOS_ENCODED_NAME_LEN + encoded_scope.len());
    result.push(NETBIOS_ENCODED_NAME_LEN as u8);
    result.extend_from_slice(&encoded_name);
    result.extend_from_slice(&encoded_scope);
    Ok(result)
}

/// Candidate names to present when opening a NetBIOS session.
///
/// For a host name the first label (upper-cased, at most 15 characters) is
/// tried first, then `*SMBSERVER`. Literal IP addresses only get `*SMBSERVER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalledNames {
    names: Vec<String>,
    position: usize,
}

impl CalledNames {
    pub fn for_host(host: &str) -> Self {
        let mut names = Vec::with_capacity(2);
        if host.parse::<IpAddr>().is_err() {
            let label: String = host
                .split('.')
                .next()
                .unwrap_or(host)
                .to_uppercase()
                .chars()
                .take(NETBIOS_NAME_MAX_LEN)
                .collect();
            if !label.is_empty() && label != SMBSERVER_NAME {
                names.push(label);
            }
        }
        names.push(SMBSERVER_NAME.to_string());
        Self { names, position: 0 }
    }

    pub fn first(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.names
    }
}

impl Iterator for CalledNames {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.names.get(self.position).cloned();
        self.position += 1;
        name
    }
}
