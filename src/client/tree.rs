//! Share connections

use super::handle::{HandleKind, HandleRecord, HandleTarget, OpenOptions, SmbHandle};
use super::session::SessionRoute;
use super::ClientShared;
use crate::crypto::{SessionCipher, Signer};
use crate::dispatcher::{Route, Target};
use crate::error::{Error, NtStatus, Result};
use crate::protocol::messages::{
    ShareType, Smb2EmptyBody, Smb2TreeConnectRequest, Smb2TreeConnectResponse, SmbMessage,
};
use crate::protocol::smb2_constants::{ShareCapabilities, ShareFlags, SessionFlags, Smb2Command};
use crate::protocol::FileId;
use crate::resource::{RefCount, SessionKey, TreeKey};
use crate::transport::OutgoingMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Disconnected,
    Connected,
}

/// Share properties cached at connect time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfo {
    pub share_type: ShareType,
    pub flags: ShareFlags,
    pub capabilities: ShareCapabilities,
    /// Requests on this tree are signed
    pub signing_required: bool,
    pub encryption_required: bool,
    pub dfs: bool,
    pub maximal_access: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct TreeRoute {
    pub session: SessionRoute,
    pub tree_id: u32,
    /// Bumped on every tree connect; open handles compare against it
    pub generation: u64,
    pub signer: Option<Arc<Signer>>,
    pub cipher: Option<Arc<SessionCipher>>,
}

impl TreeRoute {
    pub fn route(&self, file_id: FileId) -> Route {
        Route {
            transport: self.session.transport.clone(),
            session_id: self.session.session_id,
            tree_id: self.tree_id,
            file_id,
            signer: self.signer.clone(),
            cipher: self.cipher.clone(),
        }
    }
}

struct TreeInner {
    state: TreeState,
    tree_id: u32,
    session_epoch: u64,
    generation: u64,
    info: Option<ShareInfo>,
}

pub(crate) struct TreeRecord {
    pub key: TreeKey,
    pub session: SessionKey,
    pub share: String,
    pub refs: RefCount,
    gate: tokio::sync::Mutex<()>,
    inner: parking_lot::Mutex<TreeInner>,
}

impl TreeRecord {
    pub fn new(key: TreeKey, session: SessionKey, share: &str) -> Self {
        Self {
            key,
            session,
            share: share.to_string(),
            refs: RefCount::new(1),
            gate: tokio::sync::Mutex::new(()),
            inner: parking_lot::Mutex::new(TreeInner {
                state: TreeState::Disconnected,
                tree_id: 0,
                session_epoch: 0,
                generation: 0,
                info: None,
            }),
        }
    }

    pub fn state(&self) -> TreeState {
        self.inner.lock().state
    }

    pub fn info(&self) -> Option<ShareInfo> {
        self.inner.lock().info.clone()
    }

    fn is_ipc(&self) -> bool {
        self.share.eq_ignore_ascii_case("IPC$")
    }

    fn route_on(&self, session: &SessionRoute) -> Option<TreeRoute> {
        let inner = self.inner.lock();
        if inner.state != TreeState::Connected || inner.session_epoch != session.epoch {
            return None;
        }
        let signing = inner.info.as_ref().map_or(false, |info| info.signing_required);
        let encryption = inner.info.as_ref().map_or(false, |info| info.encryption_required);
        Some(TreeRoute {
            session: session.clone(),
            tree_id: inner.tree_id,
            generation: inner.generation,
            signer: if signing {
                session.key.clone()
            } else {
                session.signer.clone()
            },
            cipher: if encryption {
                session.cipher.clone()
            } else {
                session.encrypt_with.clone()
            },
        })
    }

    /// The route if nothing needs re-establishing. No wire traffic.
    pub fn current_route(&self, shared: &ClientShared) -> Option<TreeRoute> {
        let session = shared.sessions.get(self.session)?;
        let session_route = session.current().ok()??;
        self.route_on(&session_route)
    }

    /// Connect unless already connected within the current session.
    pub async fn ensure_connected(&self, shared: &ClientShared) -> Result<TreeRoute> {
        let session = shared.sessions.require(self.session)?;
        let session_route = session.ensure_valid(shared).await?;
        if let Some(route) = self.route_on(&session_route) {
            return Ok(route);
        }

        let _gate = self.gate.lock().await;
        let session_route = session.ensure_valid(shared).await?;
        if let Some(route) = self.route_on(&session_route) {
            return Ok(route);
        }
        self.connect(shared, &session.host, session_route).await
    }

    async fn connect(
        &self,
        shared: &ClientShared,
        host: &str,
        session: SessionRoute,
    ) -> Result<TreeRoute> {
        let config = &shared.config;
        let path = format!("\\\\{}\\{}", host, self.share);
        let body = Smb2TreeConnectRequest::new(path.as_str()).serialize()?;
        let message = OutgoingMessage::new(Smb2Command::TreeConnect, body)
            .session(session.session_id)
            .signed_with(session.signer.clone())
            .encrypted_with(session.encrypt_with.clone());
        let response = session.transport.call(message).await?;
        if !response.is_success() {
            self.inner.lock().state = TreeState::Disconnected;
            return Err(Error::status_for(Smb2Command::TreeConnect, response.status()));
        }
        let tree_id = response.header.tree_id;
        let connected: Smb2TreeConnectResponse = response.parse()?;

        let encryption_required = connected.share_flags.contains(ShareFlags::ENCRYPT_DATA)
            || session.flags.contains(SessionFlags::ENCRYPT_DATA)
            || config.encryption_required;
        if encryption_required && session.cipher.is_none() {
            self.disconnect_on(&session, tree_id, session.encrypt_with.clone())
                .await;
            self.inner.lock().state = TreeState::Disconnected;
            return Err(Error::EncryptionUnsupported(format!(
                "{} requires encrypted traffic but the session has no keys for it",
                path
            )));
        }

        let ipc_enforced =
            self.is_ipc() && config.ipc_signing_enforced && !session.anonymous_or_guest;
        let info = ShareInfo {
            share_type: connected.share_type,
            flags: connected.share_flags,
            capabilities: connected.capabilities,
            signing_required: session.signer.is_some() || ipc_enforced,
            encryption_required,
            dfs: connected.share_flags.contains(ShareFlags::DFS)
                || connected.capabilities.contains(ShareCapabilities::DFS),
            maximal_access: connected.maximal_access,
        };
        let cipher = if encryption_required {
            session.cipher.clone()
        } else {
            session.encrypt_with.clone()
        };
        if info.signing_required && session.key.is_none() {
            self.disconnect_on(&session, tree_id, cipher).await;
            self.inner.lock().state = TreeState::Disconnected;
            return Err(Error::InvalidState(format!(
                "{} requires signing but the session has no key",
                path
            )));
        }

        let route = {
            let mut inner = self.inner.lock();
            if let Some(previous) = &inner.info {
                if previous.signing_required != info.signing_required
                    || previous.encryption_required != info.encryption_required
                {
                    info!(
                        "{}: share policy changed (signing {} -> {}, encryption {} -> {})",
                        path,
                        previous.signing_required,
                        info.signing_required,
                        previous.encryption_required,
                        info.encryption_required
                    );
                }
            }
            inner.state = TreeState::Connected;
            inner.tree_id = tree_id;
            inner.session_epoch = session.epoch;
            inner.generation += 1;
            inner.info = Some(info);
            TreeRoute {
                tree_id,
                generation: inner.generation,
                signer: if ipc_enforced {
                    session.key.clone()
                } else {
                    session.signer.clone()
                },
                cipher,
                session,
            }
        };
        debug!("{} connected to {} (tree id {:#x})", self.key, path, tree_id);
        Ok(route)
    }

    async fn disconnect_on(
        &self,
        session: &SessionRoute,
        tree_id: u32,
        cipher: Option<Arc<SessionCipher>>,
    ) {
        let body = match Smb2EmptyBody.serialize() {
            Ok(body) => body,
            Err(_) => return,
        };
        let message = OutgoingMessage::new(Smb2Command::TreeDisconnect, body)
            .session(session.session_id)
            .tree(tree_id)
            .signed_with(session.signer.clone())
            .encrypted_with(cipher);
        match session.transport.call(message).await {
            Ok(response) if !response.is_success() => debug!(
                "{}: tree disconnect returned {}",
                self.key,
                NtStatus::describe(response.status())
            ),
            Err(e) => debug!("{}: tree disconnect failed: {}", self.key, e),
            Ok(_) => {}
        }
    }

    /// The server dropped the tree; the next use reconnects.
    pub fn mark_disconnected(&self) {
        let mut inner = self.inner.lock();
        if inner.state == TreeState::Connected {
            debug!("{} ({}) disconnected by server", self.key, self.share);
            inner.state = TreeState::Disconnected;
        }
    }

    /// Disconnect and hand the session reference back. Runs once, after
    /// the last reference is gone.
    pub async fn teardown(&self, shared: &ClientShared) {
        if let Some(route) = self.current_route(shared) {
            self.disconnect_on(&route.session, route.tree_id, route.cipher.clone())
                .await;
        }
        self.inner.lock().state = TreeState::Disconnected;
        shared.trees.remove(self.key);
        debug!("{} ({}) torn down", self.key, self.share);

        match shared.sessions.get(self.session) {
            Some(session) => {
                if let Err(e) = shared.release_session(&session).await {
                    warn!("{}: {}", self.key, e);
                }
            }
            None => warn!("{} outlived {}", self.key, self.session),
        }
    }
}

pub(crate) struct TreeTarget<'a> {
    pub shared: &'a ClientShared,
    pub record: &'a TreeRecord,
}

#[async_trait]
impl Target for TreeTarget<'_> {
    async fn resolve(&self) -> Result<Route> {
        Ok(self
            .record
            .ensure_connected(self.shared)
            .await?
            .route(FileId::default()))
    }

    async fn invalidate(&self, error: &Error) -> bool {
        self.shared
            .invalidate(error, self.record.session, Some(self.record.key), None)
    }
}

/// One reference to a connected share.
pub struct SmbTree {
    shared: Arc<ClientShared>,
    record: Arc<TreeRecord>,
    released: AtomicBool,
}

impl std::fmt::Debug for SmbTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbTree")
            .field("key", &self.record.key)
            .field("share", &self.record.share)
            .field("state", &self.record.state())
            .finish()
    }
}

impl SmbTree {
    pub(crate) fn new(shared: Arc<ClientShared>, record: Arc<TreeRecord>) -> Self {
        Self {
            shared,
            record,
            released: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> TreeKey {
        self.record.key
    }

    pub fn share(&self) -> &str {
        &self.record.share
    }

    pub fn state(&self) -> TreeState {
        self.record.state()
    }

    /// Capabilities from the last tree connect
    pub fn info(&self) -> Option<ShareInfo> {
        self.record.info()
    }

    /// Current reference count of the tree record
    pub fn references(&self) -> usize {
        self.record.refs.get()
    }

    fn live(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(self
                .shared
                .lifecycle_violation(format!("{} used after release", self.record.key)));
        }
        Ok(())
    }

    /// Reconnect the share, and the session under it, if needed.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.live()?;
        let target = TreeTarget {
            shared: &self.shared,
            record: &self.record,
        };
        self.shared.dispatcher.establish(&target).await.map(|_| ())
    }

    /// Open a file. The handle keeps the tree alive until it is closed.
    pub async fn open(&self, path: &str, options: OpenOptions) -> Result<SmbHandle> {
        self.open_kind(path, HandleKind::File, options).await
    }

    /// Open a named pipe for transact calls.
    pub async fn open_pipe(&self, name: &str) -> Result<SmbHandle> {
        self.open_kind(name, HandleKind::Pipe, OpenOptions::pipe()).await
    }

    async fn open_kind(
        &self,
        path: &str,
        kind: HandleKind,
        options: OpenOptions,
    ) -> Result<SmbHandle> {
        self.live()?;
        let path = path.trim_start_matches('\\').replace('/', "\\");
        self.record.refs.try_acquire()?;
        let record = self.shared.handles.insert_with(|key| {
            HandleRecord::new(key, self.record.key, path, kind, options)
        });
        let handle = SmbHandle::new(self.shared.clone(), record);

        let target = HandleTarget {
            shared: &self.shared,
            record: handle.record(),
        };
        if let Err(e) = self.shared.dispatcher.establish(&target).await {
            handle.close().await?;
            return Err(e);
        }
        Ok(handle)
    }

    /// Another reference to the same tree.
    pub fn acquire(&self) -> Result<SmbTree> {
        self.live()?;
        self.record.refs.try_acquire()?;
        Ok(SmbTree::new(self.shared.clone(), self.record.clone()))
    }

    /// Give this reference back. The last one disconnects the share.
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(self
                .shared
                .lifecycle_violation(format!("{} released twice", self.record.key)));
        }
        self.shared.release_tree(&self.record).await
    }
}

impl Drop for SmbTree {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared
            .report_leak(&format!("{} ({})", self.record.key, self.record.share));
        let shared = self.shared.clone();
        let record = self.record.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = shared.release_tree(&record).await;
            });
        }
    }
}
