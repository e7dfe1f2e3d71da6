//! SMB client: sessions, trees and handles
//!
//! Records live in arenas owned by [`SmbClient`]. The public types
//! ([`SmbSession`], [`SmbTree`], [`SmbHandle`]) each hold one counted
//! reference to their record; a tree record holds one reference to its
//! session, an open handle one reference to its tree. When the last
//! reference goes, the record logs off, disconnects or closes on the wire
//! and hands its parent reference back.
//!
//! Nothing reconnects eagerly. Every operation walks the path down from
//! the session with `ensure_*`, which re-establishes whatever a failed
//! connection or an expired server-side id left behind.

pub mod handle;
pub mod session;
pub mod tree;

pub use handle::{HandleKind, HandleState, OpenOptions, SmbHandle};
pub use session::{SessionState, SmbSession};
pub use tree::{ShareInfo, SmbTree, TreeState};

use crate::auth::CredentialProvider;
use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ErrorKind, NtStatus, Result};
use crate::resolver::{NameResolver, ResolverChain};
use crate::resource::{Arena, HandleKey, SessionKey, TreeKey};
use crate::transport::{Connector, TcpConnector, TransportPool};
use handle::HandleRecord;
use parking_lot::Mutex;
use session::SessionRecord;
use std::sync::Arc;
use tracing::{debug, error, warn};
use tree::TreeRecord;

/// State shared by every object handed out by one client
pub(crate) struct ClientShared {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) pool: TransportPool,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) sessions: Arena<SessionKey, SessionRecord>,
    pub(crate) trees: Arena<TreeKey, TreeRecord>,
    pub(crate) handles: Arena<HandleKey, HandleRecord>,
    /// Serializes find-or-insert of sessions and trees
    registry: Mutex<()>,
}

impl ClientShared {
    /// Build the error for a misuse and log it as loudly as configured.
    pub(crate) fn lifecycle_violation(&self, message: impl Into<String>) -> Error {
        let message = message.into();
        if self.config.strict_resource_lifecycle {
            error!("Resource lifecycle violation: {}", message);
        } else {
            warn!("Resource lifecycle violation: {}", message);
        }
        Error::LifecycleViolation(message)
    }

    pub(crate) fn report_leak(&self, what: &str) {
        if self.config.strict_resource_lifecycle {
            error!("{} dropped without release; releasing in the background", what);
        } else {
            warn!("{} dropped without release; releasing in the background", what);
        }
    }

    fn checked<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| match e {
            Error::LifecycleViolation(message) => self.lifecycle_violation(message),
            other => other,
        })
    }

    pub(crate) async fn release_session(&self, record: &Arc<SessionRecord>) -> Result<()> {
        if self.checked(record.refs.release())? {
            record.teardown(self).await;
        }
        Ok(())
    }

    pub(crate) async fn release_tree(&self, record: &Arc<TreeRecord>) -> Result<()> {
        if self.checked(record.refs.release())? {
            record.teardown(self).await;
        }
        Ok(())
    }

    /// Forget whatever `error` proved stale along the path
    /// session / tree / handle. Returns whether resolving again can help.
    pub(crate) fn invalidate(
        &self,
        error: &Error,
        session: SessionKey,
        tree: Option<TreeKey>,
        handle: Option<HandleKey>,
    ) -> bool {
        match error.nt_status() {
            Some(NtStatus::NetworkNameDeleted) => tree
                .and_then(|key| self.trees.get(key))
                .map(|record| record.mark_disconnected())
                .is_some(),
            Some(NtStatus::UserSessionDeleted) | Some(NtStatus::NetworkSessionExpired) => self
                .sessions
                .get(session)
                .map(|record| record.mark_expired())
                .is_some(),
            Some(NtStatus::FileClosed) | Some(NtStatus::InvalidHandle) => handle
                .and_then(|key| self.handles.get(key))
                .map(|record| record.mark_stale())
                .is_some(),
            // The session notices the dead transport on its own
            _ => error.kind() == ErrorKind::ConnectionLost,
        }
    }
}

/// Entry point: owns the connection pool and every record.
#[derive(Clone)]
pub struct SmbClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for SmbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbClient")
            .field("sessions", &self.shared.sessions.len())
            .field("trees", &self.shared.trees.len())
            .field("handles", &self.shared.handles.len())
            .finish()
    }
}

/// Assembles an [`SmbClient`] with custom collaborators.
pub struct SmbClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    resolver: Option<Arc<dyn NameResolver>>,
}

impl SmbClientBuilder {
    /// Open streams with `connector` instead of plain TCP.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Resolve host names with `resolver` instead of DNS.
    pub fn resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> Result<SmbClient> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(config.connect_timeout)));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(ResolverChain::default()));

        let shared = ClientShared {
            pool: TransportPool::new(connector, resolver, config.clone()),
            dispatcher: Dispatcher::new(&config),
            sessions: Arena::new(),
            trees: Arena::new(),
            handles: Arena::new(),
            registry: Mutex::new(()),
            config,
        };
        Ok(SmbClient {
            shared: Arc::new(shared),
        })
    }
}

impl SmbClient {
    /// Client with TCP transport and DNS resolution.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> SmbClientBuilder {
        SmbClientBuilder {
            config,
            connector: None,
            resolver: None,
        }
    }

    /// A session to `host` for the identity behind `credentials`.
    ///
    /// Nothing goes on the wire until the session is first used. Sessions
    /// are shared per host and identity; each call takes another reference.
    pub fn session(
        &self,
        host: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<SmbSession> {
        if host.is_empty() {
            return Err(Error::InvalidParameter("empty host name".into()));
        }
        let identity = credentials.user_domain();
        let shared = &self.shared;

        let record = {
            let _registry = shared.registry.lock();
            let existing = shared
                .sessions
                .find(|record| record.matches(host, &identity))
                .filter(|record| record.refs.try_acquire().is_ok());
            match existing {
                Some(record) => {
                    debug!("Sharing {} for {} on {}", record.key, identity, host);
                    record
                }
                None => shared
                    .sessions
                    .insert_with(|key| SessionRecord::new(key, host, identity, credentials)),
            }
        };
        Ok(SmbSession::new(self.shared.clone(), record))
    }

    /// [`session`](Self::session) followed by authentication.
    pub async fn connect(
        &self,
        host: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<SmbSession> {
        let session = self.session(host, credentials)?;
        if let Err(e) = session.authenticate().await {
            session.release().await?;
            return Err(e);
        }
        Ok(session)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Connections currently held by a session
    pub async fn active_connections(&self) -> usize {
        self.shared.pool.active().await
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn tree_count(&self) -> usize {
        self.shared.trees.len()
    }

    pub fn handle_count(&self) -> usize {
        self.shared.handles.len()
    }
}
