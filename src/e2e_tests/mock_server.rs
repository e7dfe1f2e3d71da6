//! Scripted SMB2 server for end-to-end tests
//!
//! Speaks enough of the protocol for the client core: negotiate (2.0.2,
//! 2.1, 3.0.2), a two-leg toy authentication, tree connect, create, read,
//! write, flush, ioctl, query info, close and echo. Every response is
//! signed with the session key when the request was signed or the server
//! requires signing, and encrypted when the request was. Encrypted shares
//! and sessions refuse plain requests. Counters record what reached the
//! server; fault switches make it misbehave on the next matching request.

use crate::crypto::encryption::{self, derive_keys};
use crate::crypto::{CipherAlgorithm, SessionCipher, Signer};
use crate::error::{NtStatus, Result};
use crate::protocol::messages::{
    ShareType, Smb2CloseRequest, Smb2CloseResponse, Smb2CreateRequest, Smb2CreateResponse,
    Smb2EmptyBody, Smb2ErrorResponse, Smb2FlushRequest, Smb2IoctlRequest, Smb2IoctlResponse,
    Smb2NegotiateRequest, Smb2NegotiateResponse, Smb2QueryInfoRequest, Smb2QueryInfoResponse,
    Smb2ReadRequest, Smb2ReadResponse, Smb2SessionSetupRequest, Smb2SessionSetupResponse,
    Smb2TreeConnectRequest, Smb2TreeConnectResponse, Smb2WriteRequest, Smb2WriteResponse,
    SmbMessage,
};
use crate::protocol::smb2_constants::{
    CreateDisposition, SecurityMode, SessionFlags, ShareFlags, Smb2Capabilities, Smb2Command,
    Smb2Dialect, Smb2HeaderFlags, FSCTL_PIPE_TRANSCEIVE,
};
use crate::protocol::{split_compound, FileId, Smb2Header};
use crate::resolver::ResolvedAddress;
use crate::transport::framing::{self, FrameReader, Framing};
use crate::transport::{BoxedStream, Connector};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, DuplexStream};

/// Key the toy mechanism agrees on after a successful login
pub const SESSION_KEY: [u8; 16] = [0x11; 16];
pub const PASSWORD: &str = "secret";
pub const NEGOTIATE_TOKEN: &[u8] = b"NEGOTIATE";
pub const CHALLENGE_TOKEN: &[u8] = b"CHALLENGE";
pub const AUTHENTICATE_PREFIX: &[u8] = b"AUTHENTICATE:";

const MAX_IO: u32 = 8 * 1024 * 1024;

/// What reached the server
#[derive(Debug, Default)]
pub struct Stats {
    pub connections: AtomicUsize,
    pub frames: AtomicUsize,
    pub negotiates: AtomicUsize,
    pub session_setups: AtomicUsize,
    pub logoffs: AtomicUsize,
    pub tree_connects: AtomicUsize,
    pub tree_disconnects: AtomicUsize,
    pub creates: AtomicUsize,
    pub closes: AtomicUsize,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub ioctls: AtomicUsize,
    pub echoes: AtomicUsize,
    pub signed_requests: AtomicUsize,
    pub bad_signatures: AtomicUsize,
    pub encrypted_frames: AtomicUsize,
    /// Requests sent without enough credits
    pub credit_violations: AtomicUsize,
}

/// Misbehaviour on demand
#[derive(Debug, Default)]
pub struct Faults {
    /// Next tree-bound request: NETWORK_NAME_DELETED
    pub expire_trees: AtomicBool,
    /// Next file-bound request: FILE_CLOSED
    pub expire_handles: AtomicBool,
    /// Next tree-bound request: USER_SESSION_DELETED
    pub expire_sessions: AtomicBool,
    /// Flip a bit in the next signature the server writes
    pub corrupt_next_signature: AtomicBool,
    /// Refuse every login
    pub reject_auth: AtomicBool,
    /// Close the socket instead of answering the next request
    pub drop_connection: AtomicBool,
    /// Close the socket on the next N reads
    pub fail_reads: AtomicU32,
    /// Close the socket on the next N writes
    pub fail_writes: AtomicU32,
    /// Hold every response this long
    pub delay_ms: AtomicU64,
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

fn take(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::SeqCst)
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct MockServer {
    pub dialects: Vec<Smb2Dialect>,
    pub signing_required: bool,
    /// Upper bound on credits granted per response
    pub credits_per_response: u16,
    pub shares: Vec<String>,
    pub encrypted_shares: Vec<String>,
    /// Mark every authenticated session as encrypted
    pub encrypt_sessions: bool,
    pub stats: Stats,
    pub faults: Faults,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub dispositions: Mutex<Vec<CreateDisposition>>,
    pub next_id: AtomicU64,
}

impl MockServer {
    pub fn new() -> Self {
        Self {
            dialects: vec![Smb2Dialect::Smb202, Smb2Dialect::Smb210, Smb2Dialect::Smb302],
            signing_required: false,
            credits_per_response: 16,
            shares: vec!["public".into(), "IPC$".into(), "secure".into()],
            encrypted_shares: vec!["secure".into()],
            encrypt_sessions: false,
            stats: Stats::default(),
            faults: Faults::default(),
            files: Mutex::new(HashMap::new()),
            dispositions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0x100),
        }
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.files.lock().insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn dispositions(&self) -> Vec<CreateDisposition> {
        self.dispositions.lock().clone()
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Answer requests on one connection until the client goes away or a
    /// fault drops the socket.
    pub async fn serve(self: Arc<Self>, stream: DuplexStream) {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, Framing::Direct, 16 * 1024 * 1024);
        let mut connection = Connection::default();

        while let Ok(Some(frame)) = reader.read_frame().await {
            self.stats.frames.fetch_add(1, Ordering::SeqCst);
            let (frame, sealed_for) = if encryption::is_transform(&frame) {
                let Ok(session_id) = encryption::transform_session_id(&frame) else {
                    return;
                };
                let Some(Ok(plain)) = connection
                    .ciphers
                    .get(&session_id)
                    .map(|cipher| cipher.open(&frame))
                else {
                    return;
                };
                self.stats.encrypted_frames.fetch_add(1, Ordering::SeqCst);
                (Bytes::from(plain), Some(session_id))
            } else {
                (frame, None)
            };
            let messages = match split_compound(&frame) {
                Ok(messages) => messages,
                Err(_) => return,
            };
            let mut responses = Vec::with_capacity(messages.len());
            for message in messages {
                match self.handle(&mut connection, message, sealed_for.is_some()) {
                    Some(response) => responses.push(response),
                    None => return,
                }
            }

            let delay = self.faults.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            for response in responses {
                let response = match sealed_for {
                    Some(session_id) => match connection
                        .ciphers
                        .get(&session_id)
                        .map(|cipher| cipher.seal(session_id, &response))
                    {
                        Some(Ok(sealed)) => sealed,
                        _ => return,
                    },
                    None => response,
                };
                if framing::write_frame(&mut writer, Framing::Direct, &response)
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }

    /// One request in, one response out. `None` drops the connection.
    fn handle(&self, connection: &mut Connection, message: &[u8], sealed: bool) -> Option<Vec<u8>> {
        let request = Smb2Header::parse(message).ok()?;
        let body = &message[Smb2Header::SIZE..];

        connection.balance -= i64::from(request.credit_charge.max(1));
        if connection.balance < 0 {
            self.stats.credit_violations.fetch_add(1, Ordering::SeqCst);
        }
        if take(&self.faults.drop_connection) {
            return None;
        }

        if request.is_signed() {
            self.stats.signed_requests.fetch_add(1, Ordering::SeqCst);
            let verified = connection
                .signer(request.session_id)
                .map_or(false, |signer| signer.verify(message).is_ok());
            if !verified {
                self.stats.bad_signatures.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut ids = Ids {
            session_id: request.session_id,
            tree_id: request.tree_id,
        };
        let reply = if !sealed && self.demands_encryption(connection, &request) {
            Reply::Fail(NtStatus::AccessDenied)
        } else {
            match self.dispatch(connection, &request, body, &mut ids) {
                Ok(reply) => reply,
                Err(_) => Reply::Fail(NtStatus::InvalidParameter),
            }
        };

        let (status, body) = match reply {
            Reply::Done(body) => (NtStatus::Success, body),
            Reply::More(body) => (NtStatus::MoreProcessingRequired, body),
            Reply::Fail(status) => (status, Smb2ErrorResponse::default().serialize().ok()?),
            Reply::Drop => return None,
        };

        let granted = request.credits.clamp(1, self.credits_per_response.max(1));
        connection.balance += i64::from(granted);

        let mut header = Smb2Header::new(request.command);
        header.flags = Smb2HeaderFlags::RESPONSE;
        header.status = status as u32;
        header.credits = granted;
        header.message_id = request.message_id;
        header.session_id = ids.session_id;
        header.tree_id = ids.tree_id;
        let mut response = header.serialize().ok()?;
        response.extend(body);

        let final_setup = request.command == Smb2Command::SessionSetup && status == NtStatus::Success;
        if !sealed && (request.is_signed() || self.signing_required || final_setup) {
            if let Some(signer) = connection.signer(ids.session_id) {
                signer.sign(&mut response).ok()?;
                if take(&self.faults.corrupt_next_signature) {
                    response[50] ^= 0x01;
                }
            }
        }
        Some(response)
    }

    fn demands_encryption(&self, connection: &Connection, request: &Smb2Header) -> bool {
        // Clients without a cipher are let through; the share flag tells them
        if connection.cipher.is_none()
            || matches!(
                request.command,
                Smb2Command::Negotiate | Smb2Command::SessionSetup
            )
        {
            return false;
        }
        connection.encrypted_sessions.contains(&request.session_id)
            || connection
                .trees
                .get(&request.tree_id)
                .map_or(false, |share| self.encrypted_shares.contains(share))
    }

    fn dispatch(
        &self,
        connection: &mut Connection,
        request: &Smb2Header,
        body: &[u8],
        ids: &mut Ids,
    ) -> Result<Reply> {
        let reply = match request.command {
            Smb2Command::Negotiate => self.negotiate(connection, body)?,
            Smb2Command::SessionSetup => self.session_setup(connection, body, ids)?,
            Smb2Command::Logoff => {
                self.stats.logoffs.fetch_add(1, Ordering::SeqCst);
                match connection.sessions.remove(&request.session_id) {
                    Some(_) => Reply::Done(Smb2EmptyBody.serialize()?),
                    None => Reply::Fail(NtStatus::UserSessionDeleted),
                }
            }
            Smb2Command::Echo => {
                self.stats.echoes.fetch_add(1, Ordering::SeqCst);
                Reply::Done(Smb2EmptyBody.serialize()?)
            }
            Smb2Command::TreeConnect => self.tree_connect(connection, request, body, ids)?,
            Smb2Command::TreeDisconnect => {
                self.stats.tree_disconnects.fetch_add(1, Ordering::SeqCst);
                match connection.trees.remove(&request.tree_id) {
                    Some(_) => Reply::Done(Smb2EmptyBody.serialize()?),
                    None => Reply::Fail(NtStatus::NetworkNameDeleted),
                }
            }
            command => {
                if let Some(status) = self.check_tree(connection, request) {
                    return Ok(Reply::Fail(status));
                }
                match command {
                    Smb2Command::Create => self.create(connection, request, body)?,
                    Smb2Command::Close => {
                        let close = Smb2CloseRequest::parse(body)?;
                        match self.open_path(connection, close.file_id) {
                            Ok(_) => {
                                self.stats.closes.fetch_add(1, Ordering::SeqCst);
                                connection.opens.remove(&close.file_id.volatile);
                                Reply::Done(Smb2CloseResponse::default().serialize()?)
                            }
                            Err(status) => Reply::Fail(status),
                        }
                    }
                    Smb2Command::Read => self.read(connection, body)?,
                    Smb2Command::Write => self.write(connection, body)?,
                    Smb2Command::Flush => {
                        let flush = Smb2FlushRequest::parse(body)?;
                        match self.open_path(connection, flush.file_id) {
                            Ok(_) => Reply::Done(Smb2EmptyBody.serialize()?),
                            Err(status) => Reply::Fail(status),
                        }
                    }
                    Smb2Command::Ioctl => {
                        let ioctl = Smb2IoctlRequest::parse(body)?;
                        self.stats.ioctls.fetch_add(1, Ordering::SeqCst);
                        match self.open_path(connection, ioctl.file_id) {
                            Ok(_) if ioctl.ctl_code == FSCTL_PIPE_TRANSCEIVE => {
                                let mut output = b"re:".to_vec();
                                output.extend_from_slice(&ioctl.input);
                                Reply::Done(
                                    Smb2IoctlResponse {
                                        ctl_code: ioctl.ctl_code,
                                        file_id: ioctl.file_id,
                                        output,
                                    }
                                    .serialize()?,
                                )
                            }
                            Ok(_) => Reply::Fail(NtStatus::NotSupported),
                            Err(status) => Reply::Fail(status),
                        }
                    }
                    Smb2Command::QueryInfo => {
                        let query = Smb2QueryInfoRequest::parse(body)?;
                        match self.open_path(connection, query.file_id) {
                            Ok(path) => {
                                let size = self.files.lock().get(&path).map_or(0, Vec::len);
                                let output = (size as u64).to_le_bytes().to_vec();
                                Reply::Done(Smb2QueryInfoResponse { output }.serialize()?)
                            }
                            Err(status) => Reply::Fail(status),
                        }
                    }
                    _ => Reply::Fail(NtStatus::NotSupported),
                }
            }
        };
        Ok(reply)
    }

    fn negotiate(&self, connection: &mut Connection, body: &[u8]) -> Result<Reply> {
        self.stats.negotiates.fetch_add(1, Ordering::SeqCst);
        let request = Smb2NegotiateRequest::parse(body)?;
        let Some(dialect) = self
            .dialects
            .iter()
            .copied()
            .filter(|dialect| request.dialects.contains(dialect))
            .max()
        else {
            return Ok(Reply::Fail(NtStatus::NotSupported));
        };
        connection.dialect = dialect;

        let mut response = Smb2NegotiateResponse::new(dialect);
        response.security_mode = if self.signing_required {
            SecurityMode::SIGNING_ENABLED | SecurityMode::SIGNING_REQUIRED
        } else {
            SecurityMode::SIGNING_ENABLED
        };
        response.capabilities = Smb2Capabilities::LARGE_MTU;
        if dialect.is_smb3() && request.capabilities.contains(Smb2Capabilities::ENCRYPTION) {
            response.capabilities |= Smb2Capabilities::ENCRYPTION;
            connection.cipher = Some(CipherAlgorithm::Aes128Ccm);
        }
        response.max_transact_size = MAX_IO;
        response.max_read_size = MAX_IO;
        response.max_write_size = MAX_IO;
        Ok(Reply::Done(response.serialize()?))
    }

    fn session_setup(
        &self,
        connection: &mut Connection,
        body: &[u8],
        ids: &mut Ids,
    ) -> Result<Reply> {
        self.stats.session_setups.fetch_add(1, Ordering::SeqCst);
        let request = Smb2SessionSetupRequest::parse(body)?;
        let token = request.security_blob.as_slice();
        if ids.session_id == 0 {
            ids.session_id = self.allocate();
        }

        if token.is_empty() {
            connection.sessions.insert(ids.session_id, None);
            return Ok(Reply::Done(
                Smb2SessionSetupResponse::new(SessionFlags::IS_NULL, Vec::new()).serialize()?,
            ));
        }
        if token == NEGOTIATE_TOKEN {
            return Ok(Reply::More(
                Smb2SessionSetupResponse::new(SessionFlags::empty(), CHALLENGE_TOKEN.to_vec())
                    .serialize()?,
            ));
        }
        match token.strip_prefix(AUTHENTICATE_PREFIX) {
            Some(password)
                if password == PASSWORD.as_bytes()
                    && !self.faults.reject_auth.load(Ordering::SeqCst) =>
            {
                let signer = Signer::for_session(connection.dialect, &SESSION_KEY, None)?;
                connection.sessions.insert(ids.session_id, Some(signer));
                let mut flags = SessionFlags::empty();
                if let Some(algorithm) = connection.cipher {
                    let (client_to_server, server_to_client) =
                        derive_keys(connection.dialect, &SESSION_KEY, None)?;
                    connection.ciphers.insert(
                        ids.session_id,
                        SessionCipher::new(algorithm, server_to_client, client_to_server),
                    );
                    if self.encrypt_sessions {
                        flags |= SessionFlags::ENCRYPT_DATA;
                        connection.encrypted_sessions.insert(ids.session_id);
                    }
                }
                Ok(Reply::Done(
                    Smb2SessionSetupResponse::new(flags, Vec::new()).serialize()?,
                ))
            }
            _ => Ok(Reply::Fail(NtStatus::LogonFailure)),
        }
    }

    fn tree_connect(
        &self,
        connection: &mut Connection,
        request: &Smb2Header,
        body: &[u8],
        ids: &mut Ids,
    ) -> Result<Reply> {
        if !connection.sessions.contains_key(&request.session_id) {
            return Ok(Reply::Fail(NtStatus::UserSessionDeleted));
        }
        let connect = Smb2TreeConnectRequest::parse(body)?;
        let share = connect.path.rsplit('\\').next().unwrap_or_default().to_string();
        let Some(known) = self.shares.iter().find(|s| s.eq_ignore_ascii_case(&share)) else {
            return Ok(Reply::Fail(NtStatus::BadNetworkName));
        };
        self.stats.tree_connects.fetch_add(1, Ordering::SeqCst);

        let tree_id = self.allocate() as u32;
        connection.trees.insert(tree_id, known.clone());
        ids.tree_id = tree_id;

        let ipc = known.eq_ignore_ascii_case("IPC$");
        let mut response =
            Smb2TreeConnectResponse::new(if ipc { ShareType::Pipe } else { ShareType::Disk });
        if self.encrypted_shares.contains(known) {
            response.share_flags |= ShareFlags::ENCRYPT_DATA;
        }
        Ok(Reply::Done(response.serialize()?))
    }

    /// Session and tree checks for everything bound to a tree.
    fn check_tree(&self, connection: &mut Connection, request: &Smb2Header) -> Option<NtStatus> {
        if take(&self.faults.expire_sessions) {
            connection.sessions.clear();
            connection.trees.clear();
            connection.opens.clear();
            return Some(NtStatus::UserSessionDeleted);
        }
        if !connection.sessions.contains_key(&request.session_id) {
            return Some(NtStatus::UserSessionDeleted);
        }
        if take(&self.faults.expire_trees) {
            connection.trees.clear();
            connection.opens.clear();
            return Some(NtStatus::NetworkNameDeleted);
        }
        if !connection.trees.contains_key(&request.tree_id) {
            return Some(NtStatus::NetworkNameDeleted);
        }
        None
    }

    fn open_path(
        &self,
        connection: &mut Connection,
        file_id: FileId,
    ) -> std::result::Result<String, NtStatus> {
        if take(&self.faults.expire_handles) {
            connection.opens.clear();
            return Err(NtStatus::FileClosed);
        }
        connection
            .opens
            .get(&file_id.volatile)
            .cloned()
            .ok_or(NtStatus::FileClosed)
    }

    fn create(&self, connection: &mut Connection, request: &Smb2Header, body: &[u8]) -> Result<Reply> {
        let create = Smb2CreateRequest::parse(body)?;
        self.stats.creates.fetch_add(1, Ordering::SeqCst);
        self.dispositions.lock().push(create.create_disposition);

        let pipe = connection
            .trees
            .get(&request.tree_id)
            .map_or(false, |share| share.eq_ignore_ascii_case("IPC$"));
        let path = create.file_name.clone();
        let mut size = 0;
        if !pipe {
            let mut files = self.files.lock();
            let exists = files.contains_key(&path);
            match create.create_disposition {
                CreateDisposition::Open | CreateDisposition::Overwrite if !exists => {
                    return Ok(Reply::Fail(NtStatus::ObjectNameNotFound));
                }
                CreateDisposition::Create if exists => {
                    return Ok(Reply::Fail(NtStatus::ObjectNameCollision));
                }
                CreateDisposition::Open | CreateDisposition::OpenIf => {
                    files.entry(path.clone()).or_default();
                }
                _ => {
                    files.insert(path.clone(), Vec::new());
                }
            }
            size = files.get(&path).map_or(0, Vec::len);
        }

        let id = self.allocate();
        connection.opens.insert(id, path);
        let mut response = Smb2CreateResponse::new(FileId::with_values(id, id));
        response.end_of_file = size as u64;
        Ok(Reply::Done(response.serialize()?))
    }

    fn read(&self, connection: &mut Connection, body: &[u8]) -> Result<Reply> {
        let read = Smb2ReadRequest::parse(body)?;
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.faults.fail_reads) {
            return Ok(Reply::Drop);
        }
        let path = match self.open_path(connection, read.file_id) {
            Ok(path) => path,
            Err(status) => return Ok(Reply::Fail(status)),
        };

        let files = self.files.lock();
        let data = files.get(&path).map(Vec::as_slice).unwrap_or_default();
        let start = read.offset as usize;
        if start >= data.len() {
            return Ok(Reply::Fail(NtStatus::EndOfFile));
        }
        let end = (start + read.length as usize).min(data.len());
        Ok(Reply::Done(Smb2ReadResponse::new(data[start..end].to_vec()).serialize()?))
    }

    fn write(&self, connection: &mut Connection, body: &[u8]) -> Result<Reply> {
        let write = Smb2WriteRequest::parse(body)?;
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.faults.fail_writes) {
            return Ok(Reply::Drop);
        }
        let path = match self.open_path(connection, write.file_id) {
            Ok(path) => path,
            Err(status) => return Ok(Reply::Fail(status)),
        };

        let mut files = self.files.lock();
        let file = files.entry(path).or_default();
        let start = write.offset as usize;
        let end = start + write.data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(&write.data);
        Ok(Reply::Done(
            Smb2WriteResponse {
                count: write.data.len() as u32,
            }
            .serialize()?,
        ))
    }
}

enum Reply {
    Done(Vec<u8>),
    More(Vec<u8>),
    Fail(NtStatus),
    Drop,
}

struct Ids {
    session_id: u64,
    tree_id: u32,
}

/// Per-socket server state
struct Connection {
    dialect: Smb2Dialect,
    cipher: Option<CipherAlgorithm>,
    /// Credits the client may still spend
    balance: i64,
    sessions: HashMap<u64, Option<Signer>>,
    /// Kept past logoff so the logoff response can still be sealed
    ciphers: HashMap<u64, SessionCipher>,
    encrypted_sessions: HashSet<u64>,
    trees: HashMap<u32, String>,
    opens: HashMap<u64, String>,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            dialect: Smb2Dialect::Smb202,
            cipher: None,
            balance: 1,
            sessions: HashMap::new(),
            ciphers: HashMap::new(),
            encrypted_sessions: HashSet::new(),
            trees: HashMap::new(),
            opens: HashMap::new(),
        }
    }
}

impl Connection {
    fn signer(&self, session_id: u64) -> Option<&Signer> {
        self.sessions.get(&session_id).and_then(Option::as_ref)
    }
}

/// Each connect spawns a fresh server task on an in-memory pipe.
pub struct MockConnector {
    pub server: Arc<MockServer>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _target: &ResolvedAddress, _port: u16) -> Result<BoxedStream> {
        self.server.stats.connections.fetch_add(1, Ordering::SeqCst);
        let (client, server) = duplex(4 * 1024 * 1024);
        tokio::spawn(self.server.clone().serve(server));
        Ok(Box::new(client))
    }
}
