//! Authenticated sessions

use super::tree::{SmbTree, TreeRecord};
use super::ClientShared;
use crate::auth::CredentialProvider;
use crate::crypto::{SessionCipher, Signer};
use crate::dispatcher::{Request, Route, Target};
use crate::error::{Error, ErrorKind, NtStatus, Result};
use crate::protocol::messages::{
    Smb2EmptyBody, Smb2SessionSetupRequest, Smb2SessionSetupResponse, SmbMessage,
};
use crate::protocol::smb2_constants::{SecurityMode, SessionFlags, Smb2Command};
use crate::protocol::FileId;
use crate::resource::{RefCount, SessionKey};
use crate::transport::{OutgoingMessage, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// SESSION_SETUP legs before the exchange is considered runaway
const MAX_SETUP_ROUNDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never authenticated, or logged off; next use authenticates.
    Unauthenticated,
    Authenticating,
    Valid,
    /// The server forgot the session; next use authenticates again.
    Expired,
    /// The server rejected the credentials. Terminal.
    Rejected,
}

/// What requests in a valid session need
#[derive(Debug, Clone)]
pub(crate) struct SessionRoute {
    pub transport: Arc<Transport>,
    pub session_id: u64,
    /// Signs requests; set when the session signs everything
    pub signer: Option<Arc<Signer>>,
    /// The session's signing key, also for trees that demand signing
    pub key: Option<Arc<Signer>>,
    /// Encrypts requests; set when the session encrypts everything
    pub encrypt_with: Option<Arc<SessionCipher>>,
    /// The session's encryption keys, also for trees that demand encryption
    pub cipher: Option<Arc<SessionCipher>>,
    pub flags: SessionFlags,
    pub anonymous_or_guest: bool,
    /// Bumped on every successful authentication
    pub epoch: u64,
}

impl SessionRoute {
    pub fn route(&self) -> Route {
        Route {
            transport: self.transport.clone(),
            session_id: self.session_id,
            tree_id: 0,
            file_id: FileId::default(),
            signer: self.signer.clone(),
            cipher: self.encrypt_with.clone(),
        }
    }
}

struct SessionInner {
    state: SessionState,
    transport: Option<Arc<Transport>>,
    session_id: u64,
    key: Option<Arc<Signer>>,
    sign_requests: bool,
    cipher: Option<Arc<SessionCipher>>,
    encrypt_requests: bool,
    flags: SessionFlags,
    anonymous_or_guest: bool,
    epoch: u64,
    rejection: Option<String>,
}

struct Established {
    session_id: u64,
    key: Option<Arc<Signer>>,
    sign_requests: bool,
    cipher: Option<Arc<SessionCipher>>,
    encrypt_requests: bool,
    flags: SessionFlags,
    anonymous_or_guest: bool,
}

pub(crate) struct SessionRecord {
    pub key: SessionKey,
    pub host: String,
    identity: String,
    credentials: Arc<dyn CredentialProvider>,
    pub refs: RefCount,
    gate: tokio::sync::Mutex<()>,
    inner: parking_lot::Mutex<SessionInner>,
}

impl SessionRecord {
    pub fn new(
        key: SessionKey,
        host: &str,
        identity: String,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            key,
            host: host.to_string(),
            identity,
            credentials,
            refs: RefCount::new(1),
            gate: tokio::sync::Mutex::new(()),
            inner: parking_lot::Mutex::new(SessionInner {
                state: SessionState::Unauthenticated,
                transport: None,
                session_id: 0,
                key: None,
                sign_requests: false,
                cipher: None,
                encrypt_requests: false,
                flags: SessionFlags::empty(),
                anonymous_or_guest: false,
                epoch: 0,
                rejection: None,
            }),
        }
    }

    /// Same server and identity, and still usable
    pub fn matches(&self, host: &str, identity: &str) -> bool {
        self.host.eq_ignore_ascii_case(host)
            && self.identity == identity
            && self.state() != SessionState::Rejected
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// The route if the session is valid on a live connection.
    pub fn current(&self) -> Result<Option<SessionRoute>> {
        let inner = self.inner.lock();
        match inner.state {
            SessionState::Rejected => Err(Error::AuthenticationFailed(
                inner
                    .rejection
                    .clone()
                    .unwrap_or_else(|| "credentials were rejected".into()),
            )),
            SessionState::Valid => Ok(inner
                .transport
                .as_ref()
                .filter(|transport| transport.is_connected())
                .map(|transport| SessionRoute {
                    transport: transport.clone(),
                    session_id: inner.session_id,
                    signer: if inner.sign_requests {
                        inner.key.clone()
                    } else {
                        None
                    },
                    key: inner.key.clone(),
                    encrypt_with: if inner.encrypt_requests {
                        inner.cipher.clone()
                    } else {
                        None
                    },
                    cipher: inner.cipher.clone(),
                    flags: inner.flags,
                    anonymous_or_guest: inner.anonymous_or_guest,
                    epoch: inner.epoch,
                })),
            _ => Ok(None),
        }
    }

    /// Authenticate unless already valid on a live connection.
    pub async fn ensure_valid(&self, shared: &ClientShared) -> Result<SessionRoute> {
        if let Some(route) = self.current()? {
            return Ok(route);
        }
        let _gate = self.gate.lock().await;
        if let Some(route) = self.current()? {
            return Ok(route);
        }
        self.establish(shared).await?;
        self.current()?
            .ok_or_else(|| Error::ConnectionLost("connection failed right after authentication".into()))
    }

    async fn establish(&self, shared: &ClientShared) -> Result<()> {
        let transport = shared.pool.acquire(&self.host).await?;
        let previous = {
            let mut inner = self.inner.lock();
            inner.state = SessionState::Authenticating;
            inner.key = None;
            inner.cipher = None;
            let previous_id = inner.session_id;
            inner.session_id = 0;
            inner
                .transport
                .replace(transport.clone())
                .map(|old| (old, previous_id))
        };
        if let Some((old, previous_id)) = previous {
            old.unregister_signer(previous_id);
            old.unregister_cipher(previous_id);
            if let Err(e) = shared.pool.release(&old).await {
                warn!("{}: {}", self.key, e);
            }
        }

        match self.authenticate(shared, &transport).await {
            Ok(established) => {
                let mut inner = self.inner.lock();
                inner.state = SessionState::Valid;
                inner.session_id = established.session_id;
                inner.key = established.key;
                inner.sign_requests = established.sign_requests;
                inner.cipher = established.cipher;
                inner.encrypt_requests = established.encrypt_requests;
                inner.flags = established.flags;
                inner.anonymous_or_guest = established.anonymous_or_guest;
                inner.epoch += 1;
                info!(
                    "{} authenticated on {} as {} (id {:#x}, signing {}, encryption {})",
                    self.key,
                    self.host,
                    self.identity,
                    inner.session_id,
                    if inner.sign_requests { "on" } else { "off" },
                    if inner.encrypt_requests { "on" } else { "off" }
                );
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                if let Error::AuthenticationFailed(reason) = &e {
                    warn!("{} rejected by {}: {}", self.key, self.host, reason);
                    inner.state = SessionState::Rejected;
                    inner.rejection = Some(reason.clone());
                } else {
                    inner.state = SessionState::Unauthenticated;
                }
                Err(e)
            }
        }
    }

    async fn authenticate(
        &self,
        shared: &ClientShared,
        transport: &Arc<Transport>,
    ) -> Result<Established> {
        let config = &shared.config;
        let anonymous = self.credentials.is_anonymous() || self.credentials.is_guest();
        if anonymous && config.signing_required {
            return Err(Error::AuthenticationFailed(
                "signing is required but anonymous and guest sessions cannot sign".into(),
            ));
        }

        let negotiated = transport.negotiated()?;
        let mut context = self.credentials.begin().map_err(refused)?;
        let mut token = context.negotiate(&negotiated.security_blob).map_err(refused)?;
        let mut preauth = negotiated.preauth.clone();
        let mut session_id = 0u64;
        let mut rounds = 0;

        let (response, setup) = loop {
            rounds += 1;
            if rounds > MAX_SETUP_ROUNDS {
                return Err(Error::Protocol(format!(
                    "session setup did not finish after {} rounds",
                    MAX_SETUP_ROUNDS
                )));
            }

            let mut request = Smb2SessionSetupRequest::new(token);
            request.security_mode = if config.signing_required {
                SecurityMode::SIGNING_ENABLED | SecurityMode::SIGNING_REQUIRED
            } else if config.signing_enabled {
                SecurityMode::SIGNING_ENABLED
            } else {
                SecurityMode::empty()
            };
            let message = OutgoingMessage::new(Smb2Command::SessionSetup, request.serialize()?)
                .session(session_id);
            let exchange = transport.exchange(message).await?;
            let status = exchange.response.status();
            session_id = exchange.response.header.session_id;

            if status == NtStatus::MoreProcessingRequired as u32 {
                if let Some(hash) = preauth.as_mut() {
                    hash.update(&exchange.request);
                    hash.update(exchange.response.message());
                }
                let setup: Smb2SessionSetupResponse = exchange.response.parse()?;
                token = context.negotiate(&setup.security_blob).map_err(refused)?;
                debug!("{}: session setup round {} for {}", self.key, rounds, self.identity);
            } else if exchange.response.is_success() {
                // The final response is not part of the hash
                if let Some(hash) = preauth.as_mut() {
                    hash.update(&exchange.request);
                }
                let setup: Smb2SessionSetupResponse = exchange.response.parse()?;
                break (exchange.response, setup);
            } else {
                return Err(Error::AuthenticationFailed(NtStatus::describe(status)));
            }
        };

        if !context.is_established() {
            return Err(Error::AuthenticationFailed(
                "server accepted a session the mechanism did not complete".into(),
            ));
        }

        let flags = setup.session_flags;
        let anonymous_or_guest =
            anonymous || flags.intersects(SessionFlags::IS_GUEST | SessionFlags::IS_NULL);
        if anonymous_or_guest && config.signing_required {
            return Err(Error::AuthenticationFailed(
                "server made this a guest session, which cannot sign".into(),
            ));
        }

        let session_key = if anonymous_or_guest {
            None
        } else {
            context.session_key()
        };
        let key = match &session_key {
            Some(session_key) => Some(Arc::new(Signer::for_session(
                negotiated.dialect,
                session_key,
                preauth.as_ref(),
            )?)),
            None => None,
        };
        let cipher = match (&session_key, negotiated.cipher) {
            (Some(session_key), Some(algorithm)) => Some(Arc::new(SessionCipher::for_session(
                negotiated.dialect,
                algorithm,
                session_key,
                preauth.as_ref(),
            )?)),
            _ => None,
        };
        let encrypt_requests =
            flags.contains(SessionFlags::ENCRYPT_DATA) || config.encryption_required;
        if encrypt_requests && cipher.is_none() {
            return Err(Error::EncryptionUnsupported(format!(
                "session to {} must be encrypted but {} has no keys for it",
                self.host,
                if anonymous_or_guest {
                    "an anonymous or guest session"
                } else {
                    "the connection"
                }
            )));
        }
        let sign_requests =
            !anonymous_or_guest && (negotiated.signing_required || config.signing_required);
        if sign_requests && key.is_none() {
            return Err(Error::AuthenticationFailed(
                "signing is required but the mechanism produced no session key".into(),
            ));
        }

        if response.header.is_signed() {
            if let Some(key) = &key {
                if key.verify(response.message()).is_err() {
                    transport.fail("session setup response failed verification");
                    return Err(Error::SignatureValidation {
                        message_id: response.header.message_id,
                    });
                }
            }
        }
        if let Some(key) = &key {
            transport.register_signer(session_id, key.clone());
        }
        if let Some(cipher) = &cipher {
            transport.register_cipher(session_id, cipher.clone());
        }

        Ok(Established {
            session_id,
            key,
            sign_requests,
            cipher,
            encrypt_requests,
            flags,
            anonymous_or_guest,
        })
    }

    /// The server no longer knows this session.
    pub fn mark_expired(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Valid {
            debug!("{} expired on {}", self.key, self.host);
            inner.state = SessionState::Expired;
        }
    }

    /// Log off and give the connection back. Runs once, after the last
    /// reference is gone.
    pub async fn teardown(&self, shared: &ClientShared) {
        let (transport, session_id, signer, cipher, valid) = {
            let mut inner = self.inner.lock();
            let valid = inner.state == SessionState::Valid;
            if inner.state != SessionState::Rejected {
                inner.state = SessionState::Unauthenticated;
            }
            let cipher = inner.cipher.take().filter(|_| inner.encrypt_requests);
            (
                inner.transport.take(),
                inner.session_id,
                inner.key.take(),
                cipher,
                valid,
            )
        };

        if let Some(transport) = transport {
            if valid && transport.is_connected() {
                let logoff = Smb2EmptyBody.serialize().map(|body| {
                    OutgoingMessage::new(Smb2Command::Logoff, body)
                        .session(session_id)
                        .signed_with(signer)
                        .encrypted_with(cipher)
                });
                match logoff {
                    Ok(message) => match transport.call(message).await {
                        Ok(response) if !response.is_success() => debug!(
                            "{}: logoff returned {}",
                            self.key,
                            NtStatus::describe(response.status())
                        ),
                        Err(e) => debug!("{}: logoff failed: {}", self.key, e),
                        Ok(_) => {}
                    },
                    Err(e) => debug!("{}: {}", self.key, e),
                }
            }
            transport.unregister_signer(session_id);
            transport.unregister_cipher(session_id);
            if let Err(e) = shared.pool.release(&transport).await {
                warn!("{}: {}", self.key, e);
            }
        }
        shared.sessions.remove(self.key);
        debug!("{} to {} torn down", self.key, self.host);
    }
}

fn refused(error: Error) -> Error {
    match error.kind() {
        ErrorKind::Authentication => error,
        _ => Error::AuthenticationFailed(error.to_string()),
    }
}

pub(crate) struct SessionTarget<'a> {
    pub shared: &'a ClientShared,
    pub record: &'a SessionRecord,
}

#[async_trait]
impl Target for SessionTarget<'_> {
    async fn resolve(&self) -> Result<Route> {
        Ok(self.record.ensure_valid(self.shared).await?.route())
    }

    async fn invalidate(&self, error: &Error) -> bool {
        self.shared.invalidate(error, self.record.key, None, None)
    }
}

/// One reference to an authenticated session.
pub struct SmbSession {
    shared: Arc<ClientShared>,
    record: Arc<SessionRecord>,
    released: AtomicBool,
}

impl std::fmt::Debug for SmbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbSession")
            .field("key", &self.record.key)
            .field("host", &self.record.host)
            .field("state", &self.record.state())
            .finish()
    }
}

impl SmbSession {
    pub(crate) fn new(shared: Arc<ClientShared>, record: Arc<SessionRecord>) -> Self {
        Self {
            shared,
            record,
            released: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.record.key
    }

    pub fn host(&self) -> &str {
        &self.record.host
    }

    pub fn state(&self) -> SessionState {
        self.record.state()
    }

    /// Current reference count of the session record
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

    /// Authenticate now rather than on first use. A no-op when valid.
    pub async fn authenticate(&self) -> Result<()> {
        self.live()?;
        self.record.ensure_valid(&self.shared).await.map(|_| ())
    }

    fn signing_key(&self) -> Result<Arc<Signer>> {
        self.record.inner.lock().key.clone().ok_or_else(|| {
            Error::InvalidState(format!("{} has no signing key", self.record.key))
        })
    }

    /// Sign one serialized message with the session key.
    pub fn sign(&self, message: &mut [u8]) -> Result<()> {
        self.signing_key()?.sign(message)
    }

    pub fn verify(&self, message: &[u8]) -> Result<()> {
        self.signing_key()?.verify(message)
    }

    /// Round trip to the server.
    pub async fn echo(&self) -> Result<()> {
        self.live()?;
        let target = SessionTarget {
            shared: &self.shared,
            record: &self.record,
        };
        let request =
            Request::new(Smb2Command::Echo, |_| Smb2EmptyBody.serialize()).idempotent();
        self.shared.dispatcher.submit(&target, &request).await?;
        Ok(())
    }

    /// Connect to `share`, sharing an existing tree of this session.
    pub async fn tree(&self, share: &str) -> Result<SmbTree> {
        self.live()?;
        let share = share.trim_start_matches('\\');
        if share.is_empty() || share.contains('\\') {
            return Err(Error::InvalidParameter(format!("bad share name {:?}", share)));
        }

        let shared = &self.shared;
        let record = {
            let _registry = shared.registry.lock();
            let existing = shared
                .trees
                .find(|tree| tree.session == self.record.key && tree.share.eq_ignore_ascii_case(share))
                .filter(|tree| tree.refs.try_acquire().is_ok());
            match existing {
                Some(tree) => tree,
                None => {
                    // The tree record holds the session until it is torn down
                    self.record.refs.try_acquire()?;
                    shared
                        .trees
                        .insert_with(|key| TreeRecord::new(key, self.record.key, share))
                }
            }
        };

        let tree = SmbTree::new(self.shared.clone(), record);
        if let Err(e) = tree.ensure_connected().await {
            tree.release().await?;
            return Err(e);
        }
        Ok(tree)
    }

    /// Another reference to the same session.
    pub fn acquire(&self) -> Result<SmbSession> {
        self.live()?;
        self.record.refs.try_acquire()?;
        Ok(SmbSession::new(self.shared.clone(), self.record.clone()))
    }

    /// Give this reference back. The last one logs off.
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(self
                .shared
                .lifecycle_violation(format!("{} released twice", self.record.key)));
        }
        self.shared.release_session(&self.record).await
    }
}

impl Drop for SmbSession {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared
            .report_leak(&format!("{} to {}", self.record.key, self.record.host));
        let shared = self.shared.clone();
        let record = self.record.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = shared.release_session(&record).await;
            });
        }
    }
}
