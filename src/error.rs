//! Error types for the SMB client core

use crate::protocol::smb2_constants::Smb2Command;
use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for SMB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by retry and recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The transport is gone; dependents are invalidated lazily.
    ConnectionLost,
    /// A response failed integrity verification. Fatal for its connection.
    SignatureFailure,
    /// A request-scoped deadline expired. Says nothing about execution.
    Timeout,
    /// The server answered with a failure status.
    ProtocolStatus,
    /// Double release, use after close and similar programming errors.
    LifecycleViolation,
    /// Authentication was refused or is unusable.
    Authentication,
    /// Malformed or unexpected wire data.
    Protocol,
    /// Local misconfiguration or unsupported request.
    Local,
}

/// Main error type for SMB client operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection failed or was closed underneath a request
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A response signature did not match the locally computed one
    #[error("Signature validation failed for message {message_id}")]
    SignatureValidation { message_id: u64 },

    /// An encrypted frame failed authentication
    #[error("Decryption failed for session {session_id:#x}")]
    Decryption { session_id: u64 },

    /// No response arrived before the request deadline
    #[error("Request {message_id} timed out after {after:?}")]
    Timeout { message_id: u64, after: Duration },

    /// Credits did not become available before the deadline; nothing was sent
    #[error("Timed out waiting for {needed} credit(s)")]
    CreditTimeout { needed: u16 },

    /// The server returned a failure status
    #[error("{command:?} failed: {}", NtStatus::describe(*.code))]
    Status { code: u32, command: Smb2Command },

    /// Double release, release of an unknown resource and similar misuse
    #[error("Resource lifecycle violation: {0}")]
    LifecycleViolation(String),

    /// The handle was closed, or is closing, when the operation started
    #[error("Handle is closed")]
    HandleClosed,

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Protocol parsing error
    #[error("Protocol parsing error: {0}")]
    ParseError(String),

    /// Invalid SMB header
    #[error("Invalid SMB header: {0}")]
    InvalidHeader(String),

    /// Buffer too small
    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// Invalid NetBIOS name
    #[error("Invalid NetBIOS name: {0}")]
    InvalidNetBiosName(String),

    /// Negotiation or framing went wrong
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Name resolution produced no usable address
    #[error("Unable to resolve {0}")]
    Unresolved(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The share or session demands encryption the connection cannot provide
    #[error("Encryption required but unsupported: {0}")]
    EncryptionUnsupported(String),

    /// Signing or key derivation error
    #[error("Crypto error: {0}")]
    CryptoError(String),
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Error::SignatureValidation { .. } | Error::Decryption { .. } => {
                ErrorKind::SignatureFailure
            }
            Error::Timeout { .. } | Error::CreditTimeout { .. } => ErrorKind::Timeout,
            Error::Status { .. } => ErrorKind::ProtocolStatus,
            Error::LifecycleViolation(_) | Error::HandleClosed => ErrorKind::LifecycleViolation,
            Error::AuthenticationFailed(_) => ErrorKind::Authentication,
            Error::ParseError(_)
            | Error::InvalidHeader(_)
            | Error::BufferTooSmall { .. }
            | Error::Protocol(_) => ErrorKind::Protocol,
            Error::InvalidNetBiosName(_)
            | Error::Unresolved(_)
            | Error::InvalidConfiguration(_)
            | Error::InvalidParameter(_)
            | Error::InvalidState(_)
            | Error::EncryptionUnsupported(_)
            | Error::CryptoError(_) => ErrorKind::Local,
        }
    }

    /// Raw wire status, for protocol-status errors.
    pub fn status(&self) -> Option<u32> {
        match self {
            Error::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Semantic status, when the raw code is one this crate knows.
    pub fn nt_status(&self) -> Option<NtStatus> {
        self.status().and_then(|code| NtStatus::try_from(code).ok())
    }

    /// Failures that are safe to retry for idempotent requests:
    /// connection resets and credit starvation. Response timeouts are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionLost(_) | Error::CreditTimeout { .. }
        )
    }

    pub(crate) fn status_for(command: Smb2Command, code: u32) -> Self {
        Error::Status { code, command }
    }
}

/// SMB protocol status codes (subset of NTSTATUS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NtStatus {
    /// The operation completed successfully
    Success = 0x00000000,
    /// The operation is still in progress (async interim response)
    Pending = 0x00000103,
    /// Data was truncated to fit the output buffer
    BufferOverflow = 0x80000005,
    /// No more files
    NoMoreFiles = 0x80000006,
    /// The specified handle is invalid
    InvalidHandle = 0xC0000008,
    /// The parameter is incorrect
    InvalidParameter = 0xC000000D,
    /// End of file reached
    EndOfFile = 0xC0000011,
    /// More processing required
    MoreProcessingRequired = 0xC0000016,
    /// Access denied
    AccessDenied = 0xC0000022,
    /// The buffer is too small
    BufferTooSmall = 0xC0000023,
    /// The object name is not found
    ObjectNameNotFound = 0xC0000034,
    /// Cannot create a file that already exists
    ObjectNameCollision = 0xC0000035,
    /// Sharing violation
    SharingViolation = 0xC0000043,
    /// The user name or password is incorrect
    LogonFailure = 0xC000006D,
    /// Account is disabled
    AccountDisabled = 0xC0000072,
    /// Insufficient resources
    InsufficientResources = 0xC000009A,
    /// Invalid pipe state
    InvalidPipeState = 0xC00000AD,
    /// Pipe busy
    PipeBusy = 0xC00000AE,
    /// Pipe disconnected
    PipeDisconnected = 0xC00000B0,
    /// The request timed out
    IoTimeout = 0xC00000B5,
    /// The request is not supported
    NotSupported = 0xC00000BB,
    /// Bad network path
    BadNetworkPath = 0xC00000BE,
    /// The specified network name is no longer available
    NetworkNameDeleted = 0xC00000C9,
    /// Bad network name
    BadNetworkName = 0xC00000CC,
    /// The request was not accepted
    RequestNotAccepted = 0xC00000D0,
    /// Pipe empty
    PipeEmpty = 0xC00000D9,
    /// The request was cancelled
    Cancelled = 0xC0000120,
    /// The file was closed
    FileClosed = 0xC0000128,
    /// Pipe broken
    PipeBroken = 0xC000014B,
    /// The session was deleted by the server
    UserSessionDeleted = 0xC0000203,
    /// The session expired
    NetworkSessionExpired = 0xC000035C,
}

impl TryFrom<u32> for NtStatus {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        let status = match value {
            0x00000000 => NtStatus::Success,
            0x00000103 => NtStatus::Pending,
            0x80000005 => NtStatus::BufferOverflow,
            0x80000006 => NtStatus::NoMoreFiles,
            0xC0000008 => NtStatus::InvalidHandle,
            0xC000000D => NtStatus::InvalidParameter,
            0xC0000011 => NtStatus::EndOfFile,
            0xC0000016 => NtStatus::MoreProcessingRequired,
            0xC0000022 => NtStatus::AccessDenied,
            0xC0000023 => NtStatus::BufferTooSmall,
            0xC0000034 => NtStatus::ObjectNameNotFound,
            0xC0000035 => NtStatus::ObjectNameCollision,
            0xC0000043 => NtStatus::SharingViolation,
            0xC000006D => NtStatus::LogonFailure,
            0xC0000072 => NtStatus::AccountDisabled,
            0xC000009A => NtStatus::InsufficientResources,
            0xC00000AD => NtStatus::InvalidPipeState,
            0xC00000AE => NtStatus::PipeBusy,
            0xC00000B0 => NtStatus::PipeDisconnected,
            0xC00000B5 => NtStatus::IoTimeout,
            0xC00000BB => NtStatus::NotSupported,
            0xC00000BE => NtStatus::BadNetworkPath,
            0xC00000C9 => NtStatus::NetworkNameDeleted,
            0xC00000CC => NtStatus::BadNetworkName,
            0xC00000D0 => NtStatus::RequestNotAccepted,
            0xC00000D9 => NtStatus::PipeEmpty,
            0xC0000120 => NtStatus::Cancelled,
            0xC0000128 => NtStatus::FileClosed,
            0xC000014B => NtStatus::PipeBroken,
            0xC0000203 => NtStatus::UserSessionDeleted,
            0xC000035C => NtStatus::NetworkSessionExpired,
            other => return Err(other),
        };
        Ok(status)
    }
}

impl NtStatus {
    /// Check if this is a success status
    pub fn is_success(self) -> bool {
        self == NtStatus::Success
    }

    /// Status codes proving the server refused the request before running it
    /// because a cached tree, session or file id went stale.
    pub fn is_stale_resource(self) -> bool {
        matches!(
            self,
            NtStatus::NetworkNameDeleted
                | NtStatus::UserSessionDeleted
                | NtStatus::NetworkSessionExpired
                | NtStatus::FileClosed
                | NtStatus::InvalidHandle
        )
    }

    /// Render a raw code, naming it when known.
    pub fn describe(code: u32) -> String {
        match NtStatus::try_from(code) {
            Ok(status) => status.to_string(),
            Err(raw) => format!("Unknown status (0x{:08X})", raw),
        }
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NtStatus::Success => "Success",
            NtStatus::Pending => "Pending",
            NtStatus::BufferOverflow => "Buffer overflow",
            NtStatus::NoMoreFiles => "No more files",
            NtStatus::InvalidHandle => "Invalid handle",
            NtStatus::InvalidParameter => "Invalid parameter",
            NtStatus::EndOfFile => "End of file",
            NtStatus::MoreProcessingRequired => "More processing required",
            NtStatus::AccessDenied => "Access denied",
            NtStatus::BufferTooSmall => "Buffer too small",
            NtStatus::ObjectNameNotFound => "Object name not found",
            NtStatus::ObjectNameCollision => "Object name collision",
            NtStatus::SharingViolation => "Sharing violation",
            NtStatus::LogonFailure => "Logon failure",
            NtStatus::AccountDisabled => "Account disabled",
            NtStatus::InsufficientResources => "Insufficient resources",
            NtStatus::InvalidPipeState => "Invalid pipe state",
            NtStatus::PipeBusy => "Pipe busy",
            NtStatus::PipeDisconnected => "Pipe disconnected",
            NtStatus::IoTimeout => "I/O timeout",
            NtStatus::NotSupported => "Not supported",
            NtStatus::BadNetworkPath => "Bad network path",
            NtStatus::NetworkNameDeleted => "Network name deleted",
            NtStatus::BadNetworkName => "Bad network name",
            NtStatus::RequestNotAccepted => "Request not accepted",
            NtStatus::PipeEmpty => "Pipe empty",
            NtStatus::Cancelled => "Cancelled",
            NtStatus::FileClosed => "File closed",
            NtStatus::PipeBroken => "Pipe broken",
            NtStatus::UserSessionDeleted => "User session deleted",
            NtStatus::NetworkSessionExpired => "Network session expired",
        };
        write!(f, "{} (0x{:08X})", msg, *self as u32)
    }
}
