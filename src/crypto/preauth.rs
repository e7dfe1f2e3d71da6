//! SMB 3.1.1 pre-authentication integrity hash

use sha2::{Digest, Sha512};

/// Chained SHA-512 over the negotiate and session-setup exchange.
///
/// Each step computes `H = SHA-512(H || message)`, starting from 64 zero bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct PreauthHash {
    value: [u8; 64],
}

impl PreauthHash {
    pub fn new() -> Self {
        Self { value: [0u8; 64] }
    }

    pub fn update(&mut self, message: &[u8]) {
        let mut hasher = Sha512::new();
        hasher.update(self.value);
        hasher.update(message);
        self.value.copy_from_slice(&hasher.finalize());
    }

    /// Fold several messages in order.
    pub fn chain<'a>(mut self, messages: impl IntoIterator<Item = &'a [u8]>) -> Self {
        for message in messages {
            self.update(message);
        }
        self
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.value
    }
}

impl Default for PreauthHash {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PreauthHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PreauthHash({:02x}{:02x}..)", self.value[0], self.value[1])
    }
}
