//! Authentication collaborators
//!
//! The session drives the SESSION_SETUP exchange and hands every security
//! token it receives to an [`AuthContext`]. The mechanism behind the context
//! (NTLMSSP, SPNEGO, Kerberos) is up to the provider.

use crate::error::Result;
use zeroize::Zeroizing;

/// Source of credentials for one identity.
pub trait CredentialProvider: Send + Sync {
    /// Start a fresh exchange. Called once per authentication attempt.
    fn begin(&self) -> Result<Box<dyn AuthContext>>;

    fn is_anonymous(&self) -> bool;

    fn is_guest(&self) -> bool;

    /// `DOMAIN\user`; sessions to one host are shared per identity.
    fn user_domain(&self) -> String;
}

/// State of one authentication exchange
pub trait AuthContext: Send {
    /// Turn the server's token into the next client token.
    ///
    /// The first call gets the negotiate response's security blob, which
    /// may be empty. An error aborts authentication.
    fn negotiate(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Whether the mechanism considers the exchange complete
    fn is_established(&self) -> bool;

    /// Key material for signing, once established
    fn session_key(&self) -> Option<Zeroizing<Vec<u8>>>;
}

/// Null session: no identity, no key, never signs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousCredentials;

impl CredentialProvider for AnonymousCredentials {
    fn begin(&self) -> Result<Box<dyn AuthContext>> {
        Ok(Box::new(AnonymousContext { rounds: 0 }))
    }

    fn is_anonymous(&self) -> bool {
        true
    }

    fn is_guest(&self) -> bool {
        false
    }

    fn user_domain(&self) -> String {
        String::from("\\")
    }
}

struct AnonymousContext {
    rounds: u32,
}

impl AuthContext for AnonymousContext {
    fn negotiate(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        self.rounds += 1;
        Ok(Vec::new())
    }

    fn is_established(&self) -> bool {
        self.rounds > 0
    }

    fn session_key(&self) -> Option<Zeroizing<Vec<u8>>> {
        None
    }
}
