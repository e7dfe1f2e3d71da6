//! Client configuration

use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{Smb2Capabilities, Smb2Dialect};
use std::time::Duration;
use uuid::Uuid;

/// Default SMB port (direct TCP)
pub const DEFAULT_PORT: u16 = 445;

/// NetBIOS session service port
pub const NETBIOS_PORT: u16 = 139;

/// Default timeout for a single request
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// How frames are delimited on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// NetBIOS session service on port 139, direct TCP otherwise
    Auto,
    /// 4-byte direct TCP transport header (24-bit length)
    Direct,
    /// NetBIOS session service, with session request before the first message
    NetBios,
}

impl FramingMode {
    /// Whether the connection needs a NetBIOS session request.
    pub fn uses_netbios(self, port: u16) -> bool {
        match self {
            FramingMode::Auto => port == NETBIOS_PORT,
            FramingMode::Direct => false,
            FramingMode::NetBios => true,
        }
    }
}

/// What a read at or past end-of-file returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofPolicy {
    /// STATUS_END_OF_FILE becomes an empty read
    Empty,
    /// STATUS_END_OF_FILE surfaces as a protocol-status error
    Error,
}

/// SMB client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client GUID
    pub client_guid: Uuid,
    /// Dialects offered during negotiation
    pub dialects: Vec<Smb2Dialect>,
    /// Capabilities advertised to the server
    pub capabilities: Smb2Capabilities,
    /// Server port
    pub port: u16,
    /// Framing on the wire
    pub framing: FramingMode,
    /// Workstation (calling) name for NetBIOS session requests
    pub workstation: String,

    /// Advertise signing support
    pub signing_enabled: bool,
    /// Require signing on every authenticated session
    pub signing_required: bool,
    /// Require signing on IPC$ trees of non-anonymous sessions
    pub ipc_signing_enforced: bool,
    /// Offer SMB 3.x encryption during negotiation
    pub encryption_enabled: bool,
    /// Encrypt every request of every session; refuse sessions that cannot
    pub encryption_required: bool,

    /// Credits the client tries to keep available
    pub desired_credits: u16,
    /// Upper bound for a single read request
    pub max_read_size: u32,
    /// Upper bound for a single write request
    pub max_write_size: u32,
    /// Upper bound for one frame on the wire
    pub max_frame_size: usize,

    /// TCP connect deadline
    pub connect_timeout: Duration,
    /// Deadline for one request/response exchange
    pub response_timeout: Duration,
    /// How long a sender may wait for credits before giving up
    pub credit_timeout: Duration,

    /// Extra attempts for idempotent requests on transient failures
    pub max_retries: u32,
    /// Linear backoff step; attempt `n` waits `n * retry_backoff`
    pub retry_backoff: Duration,

    /// Allow compounding of requests marked compoundable
    pub use_batching: bool,
    /// Maximum requests in one compound frame
    pub max_compound_count: usize,
    /// Maximum bytes in one compound frame
    pub max_compound_size: usize,

    /// Treat leaked or double-released resources as errors
    pub strict_resource_lifecycle: bool,
    /// End-of-file handling for reads
    pub eof_policy: EofPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_guid: Uuid::new_v4(),
            dialects: vec![
                Smb2Dialect::Smb202,
                Smb2Dialect::Smb210,
                Smb2Dialect::Smb300,
                Smb2Dialect::Smb302,
                Smb2Dialect::Smb311,
            ],
            capabilities: Smb2Capabilities::LARGE_MTU,
            port: DEFAULT_PORT,
            framing: FramingMode::Auto,
            workstation: String::from("RUST-SMB-CLIENT"),
            signing_enabled: true,
            signing_required: false,
            ipc_signing_enforced: true,
            encryption_enabled: true,
            encryption_required: false,
            desired_credits: 512,
            max_read_size: 1024 * 1024,
            max_write_size: 1024 * 1024,
            max_frame_size: 8 * 1024 * 1024,
            connect_timeout: Duration::from_secs(35),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            credit_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(200),
            use_batching: false,
            max_compound_count: 4,
            max_compound_size: 64 * 1024,
            strict_resource_lifecycle: false,
            eof_policy: EofPolicy::Empty,
        }
    }
}

impl ClientConfig {
    /// Check that the tunables are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.dialects.is_empty() {
            return Err(Error::InvalidConfiguration(
                "at least one dialect must be offered".into(),
            ));
        }
        if self.signing_required && !self.signing_enabled {
            return Err(Error::InvalidConfiguration(
                "signing_required needs signing_enabled".into(),
            ));
        }
        if self.encryption_required && !self.encryption_enabled {
            return Err(Error::InvalidConfiguration(
                "encryption_required needs encryption_enabled".into(),
            ));
        }
        if self.desired_credits == 0 {
            return Err(Error::InvalidConfiguration(
                "desired_credits must be positive".into(),
            ));
        }
        if self.max_read_size == 0 || self.max_write_size == 0 {
            return Err(Error::InvalidConfiguration(
                "max read/write sizes must be positive".into(),
            ));
        }
        if self.max_frame_size < 64 * 1024 + 256 {
            return Err(Error::InvalidConfiguration(format!(
                "max_frame_size {} is too small for one 64 KiB message",
                self.max_frame_size
            )));
        }
        if self.response_timeout.is_zero() || self.credit_timeout.is_zero() {
            return Err(Error::InvalidConfiguration(
                "timeouts must be non-zero".into(),
            ));
        }
        if self.use_batching && (self.max_compound_count < 2 || self.max_compound_size < 1024) {
            return Err(Error::InvalidConfiguration(
                "batching needs max_compound_count >= 2 and a usable max_compound_size".into(),
            ));
        }
        Ok(())
    }

    /// Highest dialect offered, used as part of the transport pool key.
    pub fn dialect_ceiling(&self) -> Smb2Dialect {
        self.dialects
            .iter()
            .copied()
            .max()
            .unwrap_or(Smb2Dialect::Smb202)
    }
}
