//! Host name resolution
//!
//! Resolvers are tried in order; the first one that produces an address wins.

use crate::error::{Error, Result};
use crate::netbios::CalledNames;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Outcome of resolving a server name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    /// Name as given by the caller
    pub host: String,
    pub addr: IpAddr,
    /// NetBIOS names to present, in order, for NetBIOS framing
    pub called_names: CalledNames,
}

impl ResolvedAddress {
    pub fn new(host: impl Into<String>, addr: IpAddr) -> Self {
        let host = host.into();
        let called_names = CalledNames::for_host(&host);
        Self {
            host,
            addr,
            called_names,
        }
    }
}

#[async_trait]
pub trait NameResolver: Send + Sync {
    /// `Ok(None)` means this resolver does not know the name.
    async fn resolve(&self, host: &str) -> Result<Option<ResolvedAddress>>;
}

/// Fixed host table, consulted before DNS
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>, addr: IpAddr) {
        self.entries.insert(host.into().to_lowercase(), addr);
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Option<ResolvedAddress>> {
        Ok(self
            .entries
            .get(&host.to_lowercase())
            .map(|addr| ResolvedAddress::new(host, *addr)))
    }
}

/// System resolver; literal addresses short-circuit the lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl NameResolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Option<ResolvedAddress>> {
        if let Ok(addr) = host.parse::<IpAddr>() {
            return Ok(Some(ResolvedAddress::new(host, addr)));
        }
        match tokio::net::lookup_host((host, 0)).await {
            Ok(mut addrs) => Ok(addrs
                .next()
                .map(|socket_addr| ResolvedAddress::new(host, socket_addr.ip()))),
            Err(e) => {
                debug!("DNS lookup for {} failed: {}", host, e);
                Ok(None)
            }
        }
    }
}

/// Ordered list of resolvers
#[derive(Clone)]
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn NameResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Arc<dyn NameResolver>>) -> Self {
        Self { resolvers }
    }

    pub fn push(&mut self, resolver: Arc<dyn NameResolver>) {
        self.resolvers.push(resolver);
    }
}

impl Default for ResolverChain {
    fn default() -> Self {
        Self::new(vec![Arc::new(DnsResolver)])
    }
}

#[async_trait]
impl NameResolver for ResolverChain {
    async fn resolve(&self, host: &str) -> Result<Option<ResolvedAddress>> {
        for resolver in &self.resolvers {
            if let Some(resolved) = resolver.resolve(host).await? {
                trace!("Resolved {} to {}", host, resolved.addr);
                return Ok(Some(resolved));
            }
        }
        Ok(None)
    }
}

/// Resolve or fail with [`Error::Unresolved`].
pub async fn resolve_required(resolver: &dyn NameResolver, host: &str) -> Result<ResolvedAddress> {
    resolver
        .resolve(host)
        .await?
        .ok_or_else(|| Error::Unresolved(host.to_string()))
}
