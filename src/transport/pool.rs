//! Shared transports, one per server
//!
//! Sessions to the same server share a connection. Entries are reference
//! counted; the last release closes the connection. A failed connection is
//! replaced on the next acquire while its old holders drain.
//!
//! Opening a connection happens outside the pool lock. Acquirers of the
//! same key queue on a per-key gate; other keys are not held up.

use super::{Connector, Transport};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::Smb2Dialect;
use crate::resolver::{resolve_required, NameResolver};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// What makes two connections interchangeable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub dialect_ceiling: Smb2Dialect,
}

impl PoolKey {
    pub fn new(host: &str, config: &ClientConfig) -> Self {
        Self {
            host: host.to_lowercase(),
            port: config.port,
            dialect_ceiling: config.dialect_ceiling(),
        }
    }
}

struct Holding {
    key: PoolKey,
    transport: Arc<Transport>,
    refs: usize,
}

#[derive(Default)]
struct PoolState {
    current: HashMap<PoolKey, u64>,
    holdings: HashMap<u64, Holding>,
    /// One gate per key while someone may be connecting
    connecting: HashMap<PoolKey, Arc<Mutex<()>>>,
}

impl PoolState {
    /// Another reference to the live connection for `key`, if any
    fn reuse(&mut self, key: &PoolKey) -> Option<Arc<Transport>> {
        let id = self.current.get(key).copied()?;
        if let Some(holding) = self.holdings.get_mut(&id) {
            if holding.transport.is_connected() {
                holding.refs += 1;
                debug!(
                    "Reusing connection {} to {} ({} holders)",
                    id, key.host, holding.refs
                );
                return Some(holding.transport.clone());
            }
        }
        self.current.remove(key);
        None
    }

    fn close_gate(&mut self, key: &PoolKey, gate: &Arc<Mutex<()>>) {
        // Clones are only made under the pool lock
        if Arc::strong_count(gate) == 2 {
            self.connecting.remove(key);
        }
    }
}

pub struct TransportPool {
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn NameResolver>,
    config: Arc<ClientConfig>,
    state: Mutex<PoolState>,
}

impl TransportPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn NameResolver>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            connector,
            resolver,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// A connected transport to `host`, opening one if needed.
    pub async fn acquire(&self, host: &str) -> Result<Arc<Transport>> {
        let key = PoolKey::new(host, &self.config);
        let gate = {
            let mut state = self.state.lock().await;
            if let Some(transport) = state.reuse(&key) {
                return Ok(transport);
            }
            state.connecting.entry(key.clone()).or_default().clone()
        };

        let connected = {
            let _turn = gate.lock().await;
            self.connect_or_reuse(host, &key).await
        };
        self.state.lock().await.close_gate(&key, &gate);
        connected
    }

    /// Runs with the key's gate held and the pool unlocked.
    async fn connect_or_reuse(&self, host: &str, key: &PoolKey) -> Result<Arc<Transport>> {
        // Whoever held the gate before us may have connected already
        if let Some(transport) = self.state.lock().await.reuse(key) {
            return Ok(transport);
        }

        let target = resolve_required(self.resolver.as_ref(), host).await?;
        let transport = Transport::connect(self.connector.as_ref(), &target, &self.config).await?;
        info!(
            "Opened connection {} to {} ({})",
            transport.id(),
            host,
            target.addr
        );

        let mut state = self.state.lock().await;
        state.current.insert(key.clone(), transport.id());
        state.holdings.insert(
            transport.id(),
            Holding {
                key: key.clone(),
                transport: transport.clone(),
                refs: 1,
            },
        );
        Ok(transport)
    }

    /// Give back one reference. The last one closes the connection.
    pub async fn release(&self, transport: &Transport) -> Result<()> {
        let id = transport.id();
        let mut state = self.state.lock().await;
        let holding = state.holdings.get_mut(&id).ok_or_else(|| {
            Error::LifecycleViolation(format!("connection {} released more often than acquired", id))
        })?;
        holding.refs -= 1;
        if holding.refs > 0 {
            return Ok(());
        }

        let Some(holding) = state.holdings.remove(&id) else {
            return Ok(());
        };
        if state.current.get(&holding.key) == Some(&id) {
            state.current.remove(&holding.key);
        }
        drop(state);

        debug!("Last holder of connection {} released it", id);
        holding.transport.close().await;
        Ok(())
    }

    /// Connections currently held by someone
    pub async fn active(&self) -> usize {
        self.state.lock().await.holdings.len()
    }
}
