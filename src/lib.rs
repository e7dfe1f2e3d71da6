//! SMB2/3 client core in Rust
//!
//! Multiplexed transport with credit flow control and per-message signing,
//! reference-counted sessions, trees and handles that re-establish
//! themselves lazily, and a dispatcher that retries only what is safe to
//! retry.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod netbios;
pub mod protocol;
pub mod resolver;
pub mod resource;
pub mod transport;

#[cfg(test)]
mod e2e_tests;

pub use auth::{AnonymousCredentials, AuthContext, CredentialProvider};
pub use client::{
    HandleKind, HandleState, OpenOptions, SessionState, ShareInfo, SmbClient, SmbHandle,
    SmbSession, SmbTree, TreeState,
};
pub use config::{ClientConfig, EofPolicy, FramingMode};
pub use error::{Error, ErrorKind, NtStatus, Result};
pub use resolver::{DnsResolver, NameResolver, ResolverChain, StaticResolver};
