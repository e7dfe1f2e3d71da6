//! Open files and pipes
//!
//! A handle opens lazily and reopens after the server forgot its file id
//! or its tree was reconnected. Every operation counts itself as pending
//! I/O; `close` flips the handle to closing, waits for those to drain and
//! only then sends CLOSE, so no request can race a released file id.

use super::tree::{TreeRoute, TreeTarget};
use super::ClientShared;
use crate::config::EofPolicy;
use crate::dispatcher::{Request, Route, Target};
use crate::error::{Error, NtStatus, Result};
use crate::protocol::messages::{
    Smb2CloseRequest, Smb2CreateRequest, Smb2CreateResponse, Smb2FlushRequest, Smb2IoctlRequest,
    Smb2IoctlResponse, Smb2QueryInfoRequest, Smb2QueryInfoResponse, Smb2ReadRequest,
    Smb2ReadResponse, Smb2WriteRequest, Smb2WriteResponse, SmbMessage,
};
use crate::protocol::smb2_constants::{
    CreateDisposition, CreateOptions, DesiredAccess, FileAttributes, InfoType, ShareAccess,
    Smb2Command, CREDIT_UNIT, FSCTL_PIPE_TRANSCEIVE,
};
use crate::protocol::FileId;
use crate::resource::{HandleKey, TreeKey};
use crate::transport::Response;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Closed,
    Opening,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    /// Named pipe; supports [`SmbHandle::transact`]
    Pipe,
}

/// How to open a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub desired_access: DesiredAccess,
    pub share_access: ShareAccess,
    pub disposition: CreateDisposition,
    pub create_options: CreateOptions,
    pub file_attributes: FileAttributes,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::read()
    }
}

impl OpenOptions {
    /// Existing file, read access
    pub fn read() -> Self {
        Self {
            desired_access: DesiredAccess::FILE_GENERIC_READ,
            share_access: ShareAccess::FILE_SHARE_READ | ShareAccess::FILE_SHARE_WRITE,
            disposition: CreateDisposition::Open,
            create_options: CreateOptions::FILE_NON_DIRECTORY_FILE,
            file_attributes: FileAttributes::NORMAL,
        }
    }

    /// Read and write, creating the file if missing
    pub fn write() -> Self {
        Self {
            desired_access: DesiredAccess::FILE_GENERIC_READ | DesiredAccess::FILE_GENERIC_WRITE,
            disposition: CreateDisposition::OpenIf,
            ..Self::read()
        }
    }

    /// Read and write, replacing any existing contents
    pub fn create() -> Self {
        Self {
            disposition: CreateDisposition::OverwriteIf,
            ..Self::write()
        }
    }

    pub(crate) fn pipe() -> Self {
        Self {
            desired_access: DesiredAccess::FILE_READ_DATA
                | DesiredAccess::FILE_WRITE_DATA
                | DesiredAccess::FILE_READ_ATTRIBUTES,
            create_options: CreateOptions::empty(),
            ..Self::read()
        }
    }

    pub fn access(mut self, access: DesiredAccess) -> Self {
        self.desired_access = access;
        self
    }

    pub fn share(mut self, share: ShareAccess) -> Self {
        self.share_access = share;
        self
    }

    pub fn disposition(mut self, disposition: CreateDisposition) -> Self {
        self.disposition = disposition;
        self
    }

    pub fn options(mut self, options: CreateOptions) -> Self {
        self.create_options = options;
        self
    }
}

struct HandleInner {
    state: HandleState,
    file_id: FileId,
    tree_generation: u64,
    opened_before: bool,
}

pub(crate) struct HandleRecord {
    pub key: HandleKey,
    pub tree: TreeKey,
    path: String,
    kind: HandleKind,
    options: OpenOptions,
    gate: tokio::sync::Mutex<()>,
    inner: parking_lot::Mutex<HandleInner>,
    closing: AtomicBool,
    pending_io: AtomicUsize,
    idle: Notify,
}

/// Pending-I/O marker, dropped when the operation finishes
struct IoGuard<'a>(&'a HandleRecord);

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        self.0.end_io();
    }
}

impl HandleRecord {
    pub fn new(
        key: HandleKey,
        tree: TreeKey,
        path: String,
        kind: HandleKind,
        options: OpenOptions,
    ) -> Self {
        Self {
            key,
            tree,
            path,
            kind,
            options,
            gate: tokio::sync::Mutex::new(()),
            inner: parking_lot::Mutex::new(HandleInner {
                state: HandleState::Closed,
                file_id: FileId::default(),
                tree_generation: 0,
                opened_before: false,
            }),
            closing: AtomicBool::new(false),
            pending_io: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn state(&self) -> HandleState {
        self.inner.lock().state
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn begin_io(&self) -> Result<IoGuard<'_>> {
        self.pending_io.fetch_add(1, Ordering::SeqCst);
        let guard = IoGuard(self);
        if self.is_closing() {
            return Err(Error::HandleClosed);
        }
        Ok(guard)
    }

    fn end_io(&self) {
        if self.pending_io.fetch_sub(1, Ordering::SeqCst) == 1 && self.is_closing() {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            let pending = self.pending_io.load(Ordering::SeqCst);
            if pending == 0 {
                return;
            }
            trace!("{} waiting for {} operation(s) before close", self.key, pending);
            idle.await;
        }
    }

    /// The file id if open on the tree connection `generation`.
    fn open_on(&self, generation: u64) -> Result<Option<FileId>> {
        if self.is_closing() {
            return Err(Error::HandleClosed);
        }
        let inner = self.inner.lock();
        Ok((inner.state == HandleState::Open && inner.tree_generation == generation)
            .then_some(inner.file_id))
    }

    /// Open, or reopen after the file id went stale.
    pub async fn ensure_open(&self, tree: &TreeRoute) -> Result<FileId> {
        if let Some(file_id) = self.open_on(tree.generation)? {
            return Ok(file_id);
        }
        let _gate = self.gate.lock().await;
        if let Some(file_id) = self.open_on(tree.generation)? {
            return Ok(file_id);
        }

        let reopen = self.inner.lock().opened_before;
        let mut request = Smb2CreateRequest::new(self.path.as_str());
        request.desired_access = self.options.desired_access;
        request.share_access = self.options.share_access;
        request.create_options = self.options.create_options;
        request.file_attributes = self.options.file_attributes;
        // Never replay a truncate or create
        request.create_disposition = if reopen && self.options.disposition.is_destructive() {
            CreateDisposition::Open
        } else {
            self.options.disposition
        };
        let message = tree
            .route(FileId::default())
            .message(Smb2Command::Create, request.serialize()?);

        self.inner.lock().state = HandleState::Opening;
        let opened = async {
            let response = tree.session.transport.call(message).await?;
            if !response.is_success() {
                return Err(Error::status_for(Smb2Command::Create, response.status()));
            }
            response.parse::<Smb2CreateResponse>()
        }
        .await;

        let mut inner = self.inner.lock();
        match opened {
            Ok(created) => {
                inner.state = HandleState::Open;
                inner.file_id = created.file_id;
                inner.tree_generation = tree.generation;
                inner.opened_before = true;
                debug!(
                    "{} {} {} ({:?})",
                    self.key,
                    if reopen { "reopened" } else { "opened" },
                    self.path,
                    request.create_disposition
                );
                Ok(created.file_id)
            }
            Err(e) => {
                inner.state = HandleState::Closed;
                Err(e)
            }
        }
    }

    /// The server forgot the file id; the next operation reopens.
    pub fn mark_stale(&self) {
        let mut inner = self.inner.lock();
        if inner.state == HandleState::Open {
            debug!("{} ({}) closed by server", self.key, self.path);
            inner.state = HandleState::Closed;
        }
    }

    /// Close on the wire if open and give the tree reference back. Only
    /// the first call does anything.
    pub async fn close(&self, shared: &ClientShared) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("{} already closed", self.key);
            return Ok(());
        }
        self.wait_idle().await;
        let _gate = self.gate.lock().await;

        let (state, file_id, generation) = {
            let mut inner = self.inner.lock();
            let snapshot = (inner.state, inner.file_id, inner.tree_generation);
            inner.state = HandleState::Closed;
            snapshot
        };

        let tree = shared.trees.get(self.tree);
        let route = tree
            .as_ref()
            .and_then(|tree| tree.current_route(shared))
            .filter(|route| route.generation == generation);
        let mut outcome = Ok(());
        if let (HandleState::Open, Some(route)) = (state, route) {
            outcome = self.send_close(&route, file_id).await;
        }

        shared.handles.remove(self.key);
        match tree {
            Some(tree) => shared.release_tree(&tree).await?,
            None => warn!("{} outlived {}", self.key, self.tree),
        }
        outcome
    }

    async fn send_close(&self, tree: &TreeRoute, file_id: FileId) -> Result<()> {
        let message = tree
            .route(file_id)
            .message(Smb2Command::Close, Smb2CloseRequest::new(file_id).serialize()?);
        let response = tree.session.transport.call(message).await?;
        if response.is_success() {
            return Ok(());
        }
        let stale = NtStatus::try_from(response.status()).map_or(false, NtStatus::is_stale_resource);
        if stale {
            debug!("{} was already gone on the server", self.key);
            return Ok(());
        }
        Err(Error::status_for(Smb2Command::Close, response.status()))
    }
}

pub(crate) struct HandleTarget<'a> {
    pub shared: &'a ClientShared,
    pub record: &'a HandleRecord,
}

#[async_trait]
impl Target for HandleTarget<'_> {
    async fn resolve(&self) -> Result<Route> {
        let tree = self.shared.trees.require(self.record.tree)?;
        let tree_route = tree.ensure_connected(self.shared).await?;
        let file_id = self.record.ensure_open(&tree_route).await?;
        Ok(tree_route.route(file_id))
    }

    async fn invalidate(&self, error: &Error) -> bool {
        match self.shared.trees.get(self.record.tree) {
            Some(tree) => self.shared.invalidate(
                error,
                tree.session,
                Some(tree.key),
                Some(self.record.key),
            ),
            None => false,
        }
    }
}

enum Direction {
    Read,
    Write,
}

/// Largest single read or write the connection allows
fn io_limit(route: &Route, configured: u32, direction: Direction) -> Result<u32> {
    let negotiated = route.transport.negotiated()?;
    let server = match direction {
        Direction::Read => negotiated.max_read_size,
        Direction::Write => negotiated.max_write_size,
    };
    let mut limit = configured.min(server);
    if !negotiated.multi_credit() {
        limit = limit.min(CREDIT_UNIT as u32);
    }
    Ok(limit.max(1))
}

/// An open file or pipe. Exclusively owned; close it when done.
pub struct SmbHandle {
    shared: Arc<ClientShared>,
    record: Arc<HandleRecord>,
}

impl std::fmt::Debug for SmbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbHandle")
            .field("key", &self.record.key)
            .field("path", &self.record.path)
            .field("state", &self.record.state())
            .finish()
    }
}

impl SmbHandle {
    pub(crate) fn new(shared: Arc<ClientShared>, record: Arc<HandleRecord>) -> Self {
        Self { shared, record }
    }

    pub(crate) fn record(&self) -> &HandleRecord {
        &self.record
    }

    pub fn key(&self) -> HandleKey {
        self.record.key
    }

    pub fn path(&self) -> &str {
        &self.record.path
    }

    pub fn kind(&self) -> HandleKind {
        self.record.kind
    }

    pub fn state(&self) -> HandleState {
        self.record.state()
    }

    fn target(&self) -> HandleTarget<'_> {
        HandleTarget {
            shared: &self.shared,
            record: &self.record,
        }
    }

    /// Reconnect the owning tree if needed.
    pub async fn ensure_tree_connected(&self) -> Result<()> {
        let _io = self.record.begin_io()?;
        let tree = self.shared.trees.require(self.record.tree)?;
        let target = TreeTarget {
            shared: &self.shared,
            record: &tree,
        };
        self.shared.dispatcher.establish(&target).await.map(|_| ())
    }

    /// Open or reopen now. A no-op when already open.
    pub async fn ensure_open(&self) -> Result<()> {
        let _io = self.record.begin_io()?;
        self.shared.dispatcher.establish(&self.target()).await.map(|_| ())
    }

    fn read_request(&self, offset: u64, length: u32) -> Request {
        let request = Request::new(Smb2Command::Read, move |route| {
            Smb2ReadRequest::new(route.file_id, offset, length).serialize()
        })
        .idempotent()
        .compoundable()
        .payload(length as usize);
        match self.shared.config.eof_policy {
            EofPolicy::Empty => request.accept(NtStatus::EndOfFile),
            EofPolicy::Error => request,
        }
    }

    fn read_data(response: Response) -> Result<Vec<u8>> {
        if response.status() == NtStatus::EndOfFile as u32 {
            return Ok(Vec::new());
        }
        Ok(response.parse::<Smb2ReadResponse>()?.data)
    }

    /// Read up to `length` bytes at `offset`. Reads larger than the
    /// connection allows come back short.
    pub async fn read(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let _io = self.record.begin_io()?;
        if length == 0 {
            return Ok(Vec::new());
        }
        let target = self.target();
        let route = self.shared.dispatcher.establish(&target).await?;
        let length = length.min(io_limit(&route, self.shared.config.max_read_size, Direction::Read)?);

        let request = self.read_request(offset, length);
        let response = self.shared.dispatcher.submit(&target, &request).await?;
        Self::read_data(response)
    }

    /// Several reads, compounded when batching is on. Results come back
    /// in the order of `ranges`.
    pub async fn read_many(&self, ranges: &[(u64, u32)]) -> Result<Vec<Result<Vec<u8>>>> {
        let _io = self.record.begin_io()?;
        let target = self.target();
        let route = self.shared.dispatcher.establish(&target).await?;
        let limit = io_limit(&route, self.shared.config.max_read_size, Direction::Read)?;

        let requests: Vec<Request> = ranges
            .iter()
            .map(|&(offset, length)| self.read_request(offset, length.min(limit)))
            .collect();
        let responses = self
            .shared
            .dispatcher
            .submit_compound(&target, &requests)
            .await?;
        Ok(responses
            .into_iter()
            .map(|response| response.and_then(Self::read_data))
            .collect())
    }

    /// Write `data` at `offset`, split into as many requests as the
    /// connection needs. Returns the bytes the server accepted. Writes are
    /// never retried; a failure part way leaves earlier chunks written.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let _io = self.record.begin_io()?;
        if data.is_empty() {
            return Ok(0);
        }
        let target = self.target();
        let route = self.shared.dispatcher.establish(&target).await?;
        let limit = io_limit(&route, self.shared.config.max_write_size, Direction::Write)? as usize;

        let mut written = 0usize;
        for chunk in data.chunks(limit) {
            let chunk_offset = offset + written as u64;
            let bytes = chunk.to_vec();
            let length = bytes.len();
            let request = Request::new(Smb2Command::Write, move |route| {
                Smb2WriteRequest::new(route.file_id, chunk_offset, bytes.clone()).serialize()
            })
            .payload(length);
            let response = self.shared.dispatcher.submit(&target, &request).await?;
            let count = response.parse::<Smb2WriteResponse>()?.count as usize;
            written += count;
            if count < length {
                debug!("{}: short write, {} of {} bytes", self.record.key, count, length);
                break;
            }
        }
        Ok(written)
    }

    /// File system control. STATUS_BUFFER_OVERFLOW yields the truncated output.
    pub async fn ioctl(&self, ctl_code: u32, input: &[u8], max_output: u32) -> Result<Vec<u8>> {
        let _io = self.record.begin_io()?;
        self.ioctl_inner(ctl_code, input, max_output).await
    }

    async fn ioctl_inner(&self, ctl_code: u32, input: &[u8], max_output: u32) -> Result<Vec<u8>> {
        let moved = input.len().max(max_output as usize);
        let input = input.to_vec();
        let request = Request::new(Smb2Command::Ioctl, move |route| {
            Smb2IoctlRequest::fsctl(ctl_code, route.file_id, input.clone(), max_output).serialize()
        })
        .payload(moved)
        .accept(NtStatus::BufferOverflow);
        let response = self.shared.dispatcher.submit(&self.target(), &request).await?;
        Ok(response.parse::<Smb2IoctlResponse>()?.output)
    }

    /// Write `input` to a pipe and read the reply in one round trip.
    pub async fn transact(&self, input: &[u8], max_output: u32) -> Result<Vec<u8>> {
        let _io = self.record.begin_io()?;
        if self.record.kind != HandleKind::Pipe {
            return Err(Error::InvalidState(format!(
                "{} is not a pipe",
                self.record.path
            )));
        }
        self.ioctl_inner(FSCTL_PIPE_TRANSCEIVE, input, max_output).await
    }

    /// QUERY_INFO for this handle.
    pub async fn query_info(
        &self,
        info_type: InfoType,
        file_info_class: u8,
        output_buffer_length: u32,
    ) -> Result<Vec<u8>> {
        let _io = self.record.begin_io()?;
        let request = Request::new(Smb2Command::QueryInfo, move |route| {
            Smb2QueryInfoRequest {
                info_type,
                file_info_class,
                output_buffer_length,
                additional_information: 0,
                file_id: route.file_id,
            }
            .serialize()
        })
        .idempotent()
        .compoundable()
        .payload(output_buffer_length as usize)
        .accept(NtStatus::BufferOverflow);
        let response = self.shared.dispatcher.submit(&self.target(), &request).await?;
        Ok(response.parse::<Smb2QueryInfoResponse>()?.output)
    }

    pub async fn flush(&self) -> Result<()> {
        let _io = self.record.begin_io()?;
        let request = Request::new(Smb2Command::Flush, |route| {
            Smb2FlushRequest {
                file_id: route.file_id,
            }
            .serialize()
        })
        .idempotent();
        self.shared.dispatcher.submit(&self.target(), &request).await?;
        Ok(())
    }

    /// Close the handle. Waits for operations in flight; later calls are
    /// no-ops and later operations fail with [`Error::HandleClosed`].
    pub async fn close(&self) -> Result<()> {
        self.record.close(&self.shared).await
    }
}

impl Drop for SmbHandle {
    fn drop(&mut self) {
        if self.record.is_closing() {
            return;
        }
        self.shared
            .report_leak(&format!("{} ({})", self.record.key, self.record.path));
        let shared = self.shared.clone();
        let record = self.record.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = record.close(&shared).await;
            });
        }
    }
}
