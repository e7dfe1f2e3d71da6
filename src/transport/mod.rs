//! Connection to one server
//!
//! A [`Transport`] owns the socket. Requests from any number of tasks are
//! framed, signed or encrypted, and written under a single writer lock; one
//! reader task splits incoming frames and routes each response to its
//! waiter by message id. Credits gate every send.
//!
//! Any write failure, read failure, bad signature or undecryptable frame
//! moves the transport to `Failed` and completes every outstanding request
//! with a connection-lost error. Sessions and trees bound to it notice on
//! their next use. A request that cannot be framed fails on its own and
//! leaves the connection alone.

pub mod credits;
pub mod framing;
pub mod pool;
pub mod tcp;

pub use credits::CreditWindow;
pub use framing::Framing;
pub use pool::{PoolKey, TransportPool};
pub use tcp::{BoxedStream, Connector, TcpConnector};

use crate::config::ClientConfig;
use crate::crypto::encryption;
use crate::crypto::{CipherAlgorithm, PreauthHash, SessionCipher, Signer};
use crate::error::{Error, NtStatus, Result};
use crate::protocol::messages::{NegotiateContext, Smb2NegotiateRequest, Smb2NegotiateResponse, SmbMessage};
use crate::protocol::smb2_constants::{
    negotiate_context, SecurityMode, Smb2Capabilities, Smb2Command, Smb2Dialect,
    COMPOUND_ALIGNMENT,
};
use crate::protocol::{split_compound, Smb2Header};
use crate::resolver::ResolvedAddress;
use bytes::Bytes;
use framing::FrameReader;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// What negotiation settled on
#[derive(Debug, Clone)]
pub struct NegotiatedParams {
    pub dialect: Smb2Dialect,
    pub server_guid: Uuid,
    pub security_mode: SecurityMode,
    pub capabilities: Smb2Capabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    /// Server or client insists on signed sessions
    pub signing_required: bool,
    /// Initial security token from the server
    pub security_blob: Vec<u8>,
    /// Hash over the negotiate exchange, 3.1.1 only
    pub preauth: Option<PreauthHash>,
    /// Cipher for encrypted sessions and shares, 3.x only
    pub cipher: Option<CipherAlgorithm>,
}

impl NegotiatedParams {
    /// Whether requests may carry more than one credit.
    pub fn multi_credit(&self) -> bool {
        self.dialect > Smb2Dialect::Smb202 && self.capabilities.contains(Smb2Capabilities::LARGE_MTU)
    }
}

/// One request on its way out
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub command: Smb2Command,
    pub session_id: u64,
    pub tree_id: u32,
    pub body: Vec<u8>,
    /// Bytes moved by the request, for the credit charge
    pub payload_size: usize,
    /// Sign the request, and insist on a signed reply
    pub signer: Option<Arc<Signer>>,
    /// Encrypt the request, and insist on an encrypted reply. Takes the
    /// place of signing.
    pub cipher: Option<Arc<SessionCipher>>,
}

impl OutgoingMessage {
    pub fn new(command: Smb2Command, body: Vec<u8>) -> Self {
        Self {
            command,
            session_id: 0,
            tree_id: 0,
            body,
            payload_size: 0,
            signer: None,
            cipher: None,
        }
    }

    pub fn session(mut self, session_id: u64) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn tree(mut self, tree_id: u32) -> Self {
        self.tree_id = tree_id;
        self
    }

    pub fn payload(mut self, payload_size: usize) -> Self {
        self.payload_size = payload_size;
        self
    }

    pub fn signed_with(mut self, signer: Option<Arc<Signer>>) -> Self {
        self.signer = signer;
        self
    }

    pub fn encrypted_with(mut self, cipher: Option<Arc<SessionCipher>>) -> Self {
        self.cipher = cipher;
        self
    }
}

/// A response routed back to its request
#[derive(Debug, Clone)]
pub struct Response {
    pub header: Smb2Header,
    message: Bytes,
}

impl Response {
    pub fn status(&self) -> u32 {
        self.header.status
    }

    pub fn is_success(&self) -> bool {
        self.header.status == NtStatus::Success as u32
    }

    /// The message body, after the header
    pub fn body(&self) -> &[u8] {
        &self.message[Smb2Header::SIZE..]
    }

    /// Header and body as received
    pub fn message(&self) -> &Bytes {
        &self.message
    }

    pub fn parse<T: SmbMessage>(&self) -> Result<T> {
        T::parse(self.body())
    }
}

/// Request bytes as sent, with the response. Needed for the pre-auth hash.
#[derive(Debug)]
pub struct Exchange {
    pub request: Bytes,
    pub response: Response,
}

struct PendingEntry {
    tx: oneshot::Sender<Result<Response>>,
    verify_with: Option<Arc<Signer>>,
    sealed: bool,
}

/// A frame ready for the wire, before anyone waits on it
struct Prepared {
    wire: Vec<u8>,
    requests: Vec<(u64, Vec<u8>, Option<Arc<Signer>>)>,
    sealed: bool,
}

struct Submitted {
    message_id: u64,
    request: Bytes,
    rx: oneshot::Receiver<Result<Response>>,
}

/// One connection to one server
pub struct Transport {
    id: u64,
    host: String,
    framing: Framing,
    state: Mutex<TransportState>,
    failure: Mutex<Option<String>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    abandoned: Mutex<HashSet<u64>>,
    credits: CreditWindow,
    next_message_id: AtomicU64,
    negotiated: OnceLock<NegotiatedParams>,
    signers: RwLock<HashMap<u64, Arc<Signer>>>,
    ciphers: RwLock<HashMap<u64, Arc<SessionCipher>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    desired_credits: u16,
    response_timeout: Duration,
    credit_timeout: Duration,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Open a stream to `target` and negotiate.
    pub async fn connect(
        connector: &dyn Connector,
        target: &ResolvedAddress,
        config: &ClientConfig,
    ) -> Result<Arc<Self>> {
        let netbios = config.framing.uses_netbios(config.port);
        let stream =
            tcp::open_stream(connector, target, config.port, netbios, &config.workstation).await?;
        let framing = if netbios {
            Framing::NetBios
        } else {
            Framing::Direct
        };

        let transport = Self::start(stream, target.host.clone(), framing, config);
        if let Err(e) = transport.negotiate(config).await {
            transport.fail(&format!("negotiation failed: {}", e));
            return Err(e);
        }
        Ok(transport)
    }

    fn start(stream: BoxedStream, host: String, framing: Framing, config: &ClientConfig) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let transport = Arc::new(Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            host,
            framing,
            state: Mutex::new(TransportState::Connecting),
            failure: Mutex::new(None),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(HashSet::new()),
            credits: CreditWindow::new(CreditWindow::INITIAL),
            next_message_id: AtomicU64::new(0),
            negotiated: OnceLock::new(),
            signers: RwLock::new(HashMap::new()),
            ciphers: RwLock::new(HashMap::new()),
            reader: Mutex::new(None),
            desired_credits: config.desired_credits,
            response_timeout: config.response_timeout,
            credit_timeout: config.credit_timeout,
        });

        let reader = FrameReader::new(read_half, framing, config.max_frame_size);
        let handle = tokio::spawn(Self::read_loop(Arc::downgrade(&transport), reader));
        *transport.reader.lock() = Some(handle);
        transport
    }

    async fn read_loop(weak: Weak<Transport>, mut reader: FrameReader<ReadHalf<BoxedStream>>) {
        loop {
            let frame = reader.read_frame().await;
            let Some(transport) = weak.upgrade() else {
                return;
            };
            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = transport.dispatch_frame(frame) {
                        transport.fail(&format!("malformed response: {}", e));
                        return;
                    }
                    if transport.state() == TransportState::Failed {
                        return;
                    }
                }
                Ok(None) => {
                    transport.fail("connection closed by server");
                    return;
                }
                Err(e) => {
                    transport.fail(&format!("receive failed: {}", e));
                    return;
                }
            }
        }
    }

    async fn negotiate(&self, config: &ClientConfig) -> Result<()> {
        let mut contexts = Vec::new();
        if config.dialects.contains(&Smb2Dialect::Smb311) {
            let mut salt = vec![0u8; negotiate_context::SALT_LENGTH];
            rand::thread_rng().fill_bytes(&mut salt);
            contexts.push(NegotiateContext::preauth_sha512(salt));
            if config.encryption_enabled {
                contexts.push(NegotiateContext::EncryptionCapabilities {
                    ciphers: vec![
                        CipherAlgorithm::Aes128Gcm.id(),
                        CipherAlgorithm::Aes128Ccm.id(),
                    ],
                });
            }
        }

        let mut request = Smb2NegotiateRequest::new(config.dialects.clone(), config.client_guid)
            .with_contexts(contexts);
        request.capabilities = config.capabilities;
        if config.encryption_enabled && config.dialects.iter().any(|d| d.is_smb3()) {
            request.capabilities |= Smb2Capabilities::ENCRYPTION;
        }
        request.security_mode = if config.signing_required {
            SecurityMode::SIGNING_ENABLED | SecurityMode::SIGNING_REQUIRED
        } else if config.signing_enabled {
            SecurityMode::SIGNING_ENABLED
        } else {
            SecurityMode::empty()
        };

        let message = OutgoingMessage::new(Smb2Command::Negotiate, request.serialize()?);
        let exchange = self.exchange_inner(message, true).await?;
        if !exchange.response.is_success() {
            return Err(Error::status_for(
                Smb2Command::Negotiate,
                exchange.response.status(),
            ));
        }

        let response: Smb2NegotiateResponse = exchange.response.parse()?;
        let dialect = response.dialect_revision;
        if !config.dialects.contains(&dialect) {
            return Err(Error::Protocol(format!(
                "server selected dialect {} which was not offered",
                dialect
            )));
        }

        let preauth = if dialect.has_preauth_integrity() {
            let sha512 = response
                .preauth_hash_algorithms()
                .map_or(false, |algs| algs.contains(&negotiate_context::HASH_ALGORITHM_SHA512));
            if !sha512 {
                return Err(Error::Protocol(
                    "3.1.1 negotiated without SHA-512 pre-auth integrity".into(),
                ));
            }
            Some(PreauthHash::new().chain([&exchange.request[..], &exchange.response.message()[..]]))
        } else {
            None
        };

        let cipher = match dialect {
            _ if !config.encryption_enabled => None,
            Smb2Dialect::Smb300 | Smb2Dialect::Smb302 => response
                .capabilities
                .contains(Smb2Capabilities::ENCRYPTION)
                .then_some(CipherAlgorithm::Aes128Ccm),
            Smb2Dialect::Smb311 => response.encryption_cipher().and_then(CipherAlgorithm::from_id),
            _ => None,
        };

        let signing_required = config.signing_required
            || response.security_mode.contains(SecurityMode::SIGNING_REQUIRED);
        let params = NegotiatedParams {
            dialect,
            server_guid: response.server_guid,
            security_mode: response.security_mode,
            capabilities: response.capabilities,
            max_transact_size: response.max_transact_size,
            max_read_size: response.max_read_size,
            max_write_size: response.max_write_size,
            signing_required,
            security_blob: response.security_blob,
            preauth,
            cipher,
        };
        info!(
            "Negotiated SMB {} with {} (signing {}, cipher {:?}, {} credits)",
            dialect,
            self.host,
            if signing_required { "required" } else { "optional" },
            cipher,
            self.credits.available()
        );
        let _ = self.negotiated.set(params);

        let promoted = {
            let mut state = self.state.lock();
            let connecting = *state == TransportState::Connecting;
            if connecting {
                *state = TransportState::Connected;
            }
            connecting
        };
        if promoted {
            Ok(())
        } else {
            Err(self.lost_error())
        }
    }

    /// Send one request and wait for its final response.
    pub async fn call(&self, message: OutgoingMessage) -> Result<Response> {
        Ok(self.exchange(message).await?.response)
    }

    /// Like [`call`](Self::call), also returning the request bytes as sent.
    pub async fn exchange(&self, message: OutgoingMessage) -> Result<Exchange> {
        self.exchange_inner(message, false).await
    }

    /// Send requests as one compound frame; responses are returned in
    /// request order. The outer error covers failures before anything
    /// reached the wire.
    pub async fn call_compound(
        &self,
        messages: Vec<OutgoingMessage>,
    ) -> Result<Vec<Result<Response>>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let submitted = self.submit(messages, false).await?;
        let deadline = Instant::now() + self.response_timeout;
        let mut results = Vec::with_capacity(submitted.len());
        for entry in submitted {
            results.push(self.await_response(entry, deadline).await);
        }
        Ok(results)
    }

    async fn exchange_inner(&self, message: OutgoingMessage, allow_connecting: bool) -> Result<Exchange> {
        let mut submitted = self.submit(vec![message], allow_connecting).await?;
        let entry = submitted
            .pop()
            .ok_or_else(|| Error::InvalidState("no request submitted".into()))?;
        let deadline = Instant::now() + self.response_timeout;
        let request = entry.request.clone();
        let response = self.await_response(entry, deadline).await?;
        Ok(Exchange { request, response })
    }

    async fn submit(
        &self,
        messages: Vec<OutgoingMessage>,
        allow_connecting: bool,
    ) -> Result<Vec<Submitted>> {
        self.ensure_usable(allow_connecting)?;

        let negotiated = self.negotiated.get();
        let multi_credit = negotiated.map_or(false, NegotiatedParams::multi_credit);
        let charge_field = negotiated.map_or(false, |n| n.dialect > Smb2Dialect::Smb202);
        let charges: Vec<u16> = messages
            .iter()
            .map(|m| CreditWindow::charge_for(m.payload_size, multi_credit))
            .collect();
        let total = charges.iter().fold(0u16, |sum, c| sum.saturating_add(*c));

        self.credits.acquire(total, self.credit_timeout).await?;

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            self.credits.refund(total);
            return Err(self.lost_error());
        };
        let prepared = self
            .ensure_usable(allow_connecting)
            .and_then(|_| self.prepare_frame(messages, &charges, charge_field));
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.credits.refund(total);
                return Err(e);
            }
        };
        let sealed = prepared.sealed;
        let submitted = match self.register(prepared.requests, sealed, allow_connecting) {
            Ok(submitted) => submitted,
            Err(e) => {
                self.credits.refund(total);
                return Err(e);
            }
        };

        let written = async {
            stream.write_all(&prepared.wire).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = written {
            writer.take();
            drop(writer);
            self.fail(&format!("send failed: {}", e));
            return Err(Error::ConnectionLost(format!("send failed: {}", e)));
        }
        if self.state() == TransportState::Failed {
            writer.take();
            drop(writer);
            self.forget(&submitted);
        }
        Ok(submitted)
    }

    /// Assign message ids, pad and chain, then sign or seal. Nothing is
    /// registered yet, so an error here concerns these requests only.
    fn prepare_frame(
        &self,
        messages: Vec<OutgoingMessage>,
        charges: &[u16],
        charge_field: bool,
    ) -> Result<Prepared> {
        let count = messages.len();
        let cipher = messages
            .iter()
            .find_map(|m| m.cipher.clone().map(|cipher| (m.session_id, cipher)));

        let mut length = cipher.as_ref().map_or(0, |_| encryption::TRANSFORM_HEADER_SIZE);
        for (index, message) in messages.iter().enumerate() {
            length += Smb2Header::SIZE + message.body.len();
            if index + 1 < count {
                length = length.next_multiple_of(COMPOUND_ALIGNMENT);
            }
        }
        framing::check_frame_length(length)?;

        let mut frame = Vec::with_capacity(length);
        let mut requests = Vec::with_capacity(count);
        for (index, (message, charge)) in messages.into_iter().zip(charges).enumerate() {
            let mut header = Smb2Header::new(message.command);
            header.credit_charge = if charge_field { *charge } else { 0 };
            header.credits = self.credits.request_amount(self.desired_credits);
            header.message_id = self.next_message_id.fetch_add(u64::from(*charge), Ordering::SeqCst);
            header.session_id = message.session_id;
            header.tree_id = message.tree_id;

            let mut bytes = header.serialize()?;
            bytes.extend_from_slice(&message.body);
            if index + 1 < count {
                let padded = bytes.len().next_multiple_of(COMPOUND_ALIGNMENT);
                bytes.resize(padded, 0);
                Smb2Header::set_next_command(&mut bytes, padded as u32);
            }
            let verify_with = if cipher.is_some() {
                None
            } else {
                message.signer
            };
            if let Some(signer) = &verify_with {
                signer.sign(&mut bytes)?;
            }

            trace!(
                "Queued {:?} as message {} (charge {}, asking {})",
                message.command,
                header.message_id,
                charge,
                header.credits
            );
            frame.extend_from_slice(&bytes);
            requests.push((header.message_id, bytes, verify_with));
        }

        let sealed = cipher.is_some();
        let payload = match cipher {
            Some((session_id, cipher)) => cipher.seal(session_id, &frame)?,
            None => frame,
        };
        let wire = framing::encode_frame(self.framing, &payload)?;
        Ok(Prepared {
            wire,
            requests,
            sealed,
        })
    }

    /// Register waiters. Checked against the state under the pending lock
    /// so a concurrent failure either sees these entries or refuses them.
    fn register(
        &self,
        requests: Vec<(u64, Vec<u8>, Option<Arc<Signer>>)>,
        sealed: bool,
        allow_connecting: bool,
    ) -> Result<Vec<Submitted>> {
        let mut pending = self.pending.lock();
        self.ensure_usable(allow_connecting)?;
        Ok(requests
            .into_iter()
            .map(|(message_id, bytes, verify_with)| {
                let (tx, rx) = oneshot::channel();
                pending.insert(
                    message_id,
                    PendingEntry {
                        tx,
                        verify_with,
                        sealed,
                    },
                );
                Submitted {
                    message_id,
                    request: Bytes::from(bytes),
                    rx,
                }
            })
            .collect())
    }

    /// Complete entries the teardown may have missed.
    fn forget(&self, submitted: &[Submitted]) {
        let stale: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            submitted
                .iter()
                .filter_map(|entry| pending.remove(&entry.message_id))
                .collect()
        };
        for entry in stale {
            let _ = entry.tx.send(Err(self.lost_error()));
        }
    }

    async fn await_response(&self, entry: Submitted, deadline: Instant) -> Result<Response> {
        match tokio::time::timeout_at(deadline, entry.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.lost_error()),
            Err(_) => {
                if self.pending.lock().remove(&entry.message_id).is_some() {
                    self.abandoned.lock().insert(entry.message_id);
                }
                warn!(
                    "No response to message {} from {} within {:?}",
                    entry.message_id, self.host, self.response_timeout
                );
                Err(Error::Timeout {
                    message_id: entry.message_id,
                    after: self.response_timeout,
                })
            }
        }
    }

    /// Decrypt if needed, then route every message of one incoming frame.
    fn dispatch_frame(&self, frame: Bytes) -> Result<()> {
        if !encryption::is_transform(&frame) {
            return self.dispatch_messages(frame, false);
        }

        let session_id = encryption::transform_session_id(&frame)?;
        let cipher = self.ciphers.read().get(&session_id).cloned();
        let Some(cipher) = cipher else {
            return Err(Error::Protocol(format!(
                "encrypted frame for session {:#x} without keys",
                session_id
            )));
        };
        match cipher.open(&frame) {
            Ok(plain) => self.dispatch_messages(Bytes::from(plain), true),
            Err(e) => {
                error!(
                    "Encrypted frame for session {:#x} from {} failed: {}",
                    session_id, self.host, e
                );
                self.fail("response decryption failed");
                Ok(())
            }
        }
    }

    fn dispatch_messages(&self, frame: Bytes, sealed: bool) -> Result<()> {
        for raw in split_compound(&frame)? {
            let header = Smb2Header::parse(raw)?;
            if !header.is_response() {
                warn!("Ignoring request-shaped message {} from server", header.message_id);
                continue;
            }
            let message_id = header.message_id;
            self.credits.grant(header.credits);

            if header.status == NtStatus::Pending as u32 && header.is_async() {
                trace!(
                    "Message {} went async (id {:#x})",
                    message_id,
                    header.async_id()
                );
                continue;
            }

            let Some(entry) = self.pending.lock().remove(&message_id) else {
                if self.abandoned.lock().remove(&message_id) {
                    debug!("Dropped late response to abandoned message {}", message_id);
                } else {
                    warn!(
                        "Dropped response to unknown message {} ({:?})",
                        message_id, header.command
                    );
                }
                continue;
            };

            if entry.sealed && !sealed {
                error!(
                    "Plain {:?} response {} to an encrypted request from {}",
                    header.command, message_id, self.host
                );
                let _ = entry.tx.send(Err(Error::Decryption {
                    session_id: header.session_id,
                }));
                self.fail("unencrypted response to an encrypted request");
                return Ok(());
            }

            // The transform already authenticated sealed frames
            let verifier = entry.verify_with.clone().or_else(|| {
                if header.is_signed() && !sealed {
                    self.signers.read().get(&header.session_id).cloned()
                } else {
                    None
                }
            });
            if let Some(signer) = verifier {
                let verdict = if header.is_signed() {
                    signer.verify(raw)
                } else {
                    Err(Error::SignatureValidation { message_id })
                };
                if let Err(e) = verdict {
                    error!(
                        "Signature check failed on {:?} response {} from {}",
                        header.command, message_id, self.host
                    );
                    let _ = entry.tx.send(Err(e));
                    self.fail("response signature verification failed");
                    return Ok(());
                }
            }

            if header.credits == 0 && self.credits.available() == 0 && self.pending.lock().is_empty() {
                warn!("Server left {} without credits; assuming one", self.host);
                self.credits.grant(1);
            }

            let response = Response {
                header,
                message: frame.slice_ref(raw),
            };
            let _ = entry.tx.send(Ok(response));
        }
        Ok(())
    }

    /// Mark the connection failed and wake every waiter. Idempotent.
    pub fn fail(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if matches!(*state, TransportState::Failed | TransportState::Disconnected) {
                return;
            }
            *state = TransportState::Failed;
        }
        warn!("Connection {} to {} failed: {}", self.id, self.host, reason);
        *self.failure.lock() = Some(reason.to_string());
        self.teardown(reason);
    }

    /// Close the connection. Outstanding requests fail with connection lost.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == TransportState::Disconnected {
                return;
            }
            *state = TransportState::Disconnected;
        }
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        self.teardown("connection closed");
        debug!("Connection {} to {} closed", self.id, self.host);
    }

    fn teardown(&self, reason: &str) {
        self.credits.close();
        let drained: Vec<PendingEntry> = self.pending.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            let _ = entry.tx.send(Err(Error::ConnectionLost(reason.to_string())));
        }
        self.abandoned.lock().clear();
        self.signers.write().clear();
        self.ciphers.write().clear();
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        // Socket closes once both halves are gone
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    fn ensure_usable(&self, allow_connecting: bool) -> Result<()> {
        match self.state() {
            TransportState::Connected => Ok(()),
            TransportState::Connecting if allow_connecting => Ok(()),
            TransportState::Connecting => Err(Error::InvalidState(
                "transport is still negotiating".into(),
            )),
            TransportState::Failed | TransportState::Disconnected => Err(self.lost_error()),
        }
    }

    fn lost_error(&self) -> Error {
        let reason = self
            .failure
            .lock()
            .clone()
            .unwrap_or_else(|| format!("connection to {} is {:?}", self.host, self.state()));
        Error::ConnectionLost(reason)
    }

    /// Verify signed responses of `session_id` even when the request was
    /// not signed.
    pub fn register_signer(&self, session_id: u64, signer: Arc<Signer>) {
        self.signers.write().insert(session_id, signer);
    }

    pub fn unregister_signer(&self, session_id: u64) {
        self.signers.write().remove(&session_id);
    }

    /// Keys for encrypted frames of `session_id`.
    pub fn register_cipher(&self, session_id: u64, cipher: Arc<SessionCipher>) {
        self.ciphers.write().insert(session_id, cipher);
    }

    pub fn unregister_cipher(&self, session_id: u64) {
        self.ciphers.write().remove(&session_id);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    pub fn negotiated(&self) -> Result<&NegotiatedParams> {
        self.negotiated
            .get()
            .ok_or_else(|| Error::InvalidState("transport has not negotiated".into()))
    }

    pub fn credits(&self) -> &CreditWindow {
        &self.credits
    }

    /// Requests sent and not yet answered
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}
