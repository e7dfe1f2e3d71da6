//! Test context for end-to-end testing
//!
//! Wires an [`SmbClient`] to a [`MockServer`] through in-memory pipes and a
//! static resolver, so every test runs the real transport, session, tree
//! and handle code against a scripted peer.

use super::mock_server::{
    MockConnector, MockServer, AUTHENTICATE_PREFIX, CHALLENGE_TOKEN, NEGOTIATE_TOKEN, PASSWORD,
    SESSION_KEY,
};
use crate::auth::{AuthContext, CredentialProvider};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::Smb2Dialect;
use crate::resolver::StaticResolver;
use crate::{SmbClient, SmbSession};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

pub const HOST: &str = "fileserver";

/// Small timeouts and no real backoff
pub fn test_config() -> ClientConfig {
    ClientConfig {
        dialects: vec![Smb2Dialect::Smb202, Smb2Dialect::Smb210],
        response_timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(1),
        max_retries: 2,
        ..ClientConfig::default()
    }
}

pub struct TestContext {
    pub server: Arc<MockServer>,
    pub client: SmbClient,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with(MockServer::new(), test_config())
    }

    pub fn with(server: MockServer, config: ClientConfig) -> Self {
        let server = Arc::new(server);
        let mut hosts = StaticResolver::new();
        hosts.insert(HOST, IpAddr::V4(Ipv4Addr::LOCALHOST));
        let client = SmbClient::builder(config)
            .connector(Arc::new(MockConnector {
                server: server.clone(),
            }))
            .resolver(Arc::new(hosts))
            .build()
            .unwrap();
        Self { server, client }
    }

    /// Authenticated session for alice
    pub async fn session(&self) -> SmbSession {
        self.client.connect(HOST, alice()).await.unwrap()
    }
}

pub fn alice() -> Arc<dyn CredentialProvider> {
    Arc::new(PasswordCredentials::new("alice", PASSWORD))
}

/// Two-leg login understood by the mock server
pub struct PasswordCredentials {
    user: String,
    password: String,
}

impl PasswordCredentials {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

impl CredentialProvider for PasswordCredentials {
    fn begin(&self) -> Result<Box<dyn AuthContext>> {
        Ok(Box::new(PasswordContext {
            password: self.password.clone(),
            established: false,
            rounds: 0,
        }))
    }

    fn is_anonymous(&self) -> bool {
        false
    }

    fn is_guest(&self) -> bool {
        false
    }

    fn user_domain(&self) -> String {
        format!("TEST\\{}", self.user)
    }
}

struct PasswordContext {
    password: String,
    established: bool,
    rounds: u32,
}

impl AuthContext for PasswordContext {
    fn negotiate(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        self.rounds += 1;
        match self.rounds {
            1 => Ok(NEGOTIATE_TOKEN.to_vec()),
            2 if challenge == CHALLENGE_TOKEN => {
                self.established = true;
                let mut token = AUTHENTICATE_PREFIX.to_vec();
                token.extend_from_slice(self.password.as_bytes());
                Ok(token)
            }
            _ => Err(Error::AuthenticationFailed("unexpected challenge".into())),
        }
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn session_key(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.established.then(|| Zeroizing::new(SESSION_KEY.to_vec()))
    }
}
