//! Request submission and retry policy
//!
//! A [`Target`] knows how to (re-)establish whatever a request needs and
//! yields a [`Route`]. The dispatcher builds the request body for that
//! route, sends it, and decides what to do with failures:
//!
//! * a stale tree, session or file id is recovered once by invalidating the
//!   record and resolving again, whatever the request;
//! * transient failures are retried with linear backoff, only for
//!   idempotent requests and at most `max_retries` times;
//! * everything else, signature failures and timeouts included, surfaces.
//!
//! Each attempt builds a new message, so it gets a new message id and a new
//! signature.

use crate::config::ClientConfig;
use crate::crypto::{SessionCipher, Signer};
use crate::error::{Error, NtStatus, Result};
use crate::protocol::smb2_constants::Smb2Command;
use crate::protocol::{FileId, Smb2Header};
use crate::transport::{OutgoingMessage, Response, Transport};
use async_trait::async_trait;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a request goes and under which identity
#[derive(Debug, Clone)]
pub struct Route {
    pub transport: Arc<Transport>,
    pub session_id: u64,
    pub tree_id: u32,
    pub file_id: FileId,
    pub signer: Option<Arc<Signer>>,
    pub cipher: Option<Arc<SessionCipher>>,
}

impl Route {
    pub fn message(&self, command: Smb2Command, body: Vec<u8>) -> OutgoingMessage {
        OutgoingMessage::new(command, body)
            .session(self.session_id)
            .tree(self.tree_id)
            .signed_with(self.signer.clone())
            .encrypted_with(self.cipher.clone())
    }
}

type BodyBuilder = Arc<dyn Fn(&Route) -> Result<Vec<u8>> + Send + Sync>;

/// One logical request. The body is rebuilt for every attempt so it picks
/// up ids that changed during recovery.
#[derive(Clone)]
pub struct Request {
    command: Smb2Command,
    idempotent: bool,
    compoundable: bool,
    payload_size: usize,
    accepted: Vec<u32>,
    body: BodyBuilder,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .field("idempotent", &self.idempotent)
            .field("compoundable", &self.compoundable)
            .field("payload_size", &self.payload_size)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn new<F>(command: Smb2Command, body: F) -> Self
    where
        F: Fn(&Route) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            command,
            idempotent: false,
            compoundable: false,
            payload_size: 0,
            accepted: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// Safe to send again after a transient failure.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// May share a frame with neighbouring requests.
    pub fn compoundable(mut self) -> Self {
        self.compoundable = true;
        self
    }

    /// Bytes moved, for the credit charge.
    pub fn payload(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    /// Treat `status` like success and hand the response to the caller.
    pub fn accept(mut self, status: NtStatus) -> Self {
        self.accepted.push(status as u32);
        self
    }

    pub fn command(&self) -> Smb2Command {
        self.command
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    fn build(&self, route: &Route) -> Result<OutgoingMessage> {
        let body = (self.body)(route)?;
        Ok(route.message(self.command, body).payload(self.payload_size))
    }

    fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if response.is_success() || self.accepted.contains(&status) {
            Ok(response)
        } else {
            Err(Error::status_for(self.command, status))
        }
    }

    fn wire_estimate(&self) -> usize {
        Smb2Header::SIZE + 128 + self.payload_size
    }
}

/// Something requests can be routed to, with lazy re-establishment.
#[async_trait]
pub trait Target: Send + Sync {
    /// Make sure every record on the path is usable and return the route.
    async fn resolve(&self) -> Result<Route>;

    /// Forget cached state that `error` proved stale. Returns whether a
    /// fresh `resolve` can fix it.
    async fn invalidate(&self, error: &Error) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(retry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Recover,
    Retry,
    Surface,
}

fn is_stale(error: &Error) -> bool {
    error.nt_status().map_or(false, NtStatus::is_stale_resource)
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    policy: RetryPolicy,
    batching: bool,
    max_compound_count: usize,
    max_compound_size: usize,
}

impl Dispatcher {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            policy: RetryPolicy {
                max_retries: config.max_retries,
                backoff: config.retry_backoff,
            },
            batching: config.use_batching,
            max_compound_count: config.max_compound_count,
            max_compound_size: config.max_compound_size,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn decide(&self, error: &Error, idempotent: bool, retries: u32, recovered: bool) -> Next {
        if is_stale(error) && !recovered {
            Next::Recover
        } else if idempotent && error.is_transient() && retries < self.policy.max_retries {
            Next::Retry
        } else {
            Next::Surface
        }
    }

    /// Send `request` to `target`, recovering and retrying per policy.
    pub async fn submit(&self, target: &dyn Target, request: &Request) -> Result<Response> {
        let mut retries = 0;
        let mut recovered = false;
        loop {
            let error = match self.attempt(target, request).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            match self.decide(&error, request.idempotent, retries, recovered) {
                Next::Recover => {
                    recovered = true;
                    if !target.invalidate(&error).await {
                        return Err(error);
                    }
                    debug!("{:?} hit stale state ({}), re-establishing", request.command, error);
                }
                Next::Retry => {
                    retries += 1;
                    target.invalidate(&error).await;
                    let delay = self.policy.delay(retries);
                    warn!(
                        "{:?} failed ({}), retry {}/{} in {:?}",
                        request.command, error, retries, self.policy.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Next::Surface => return Err(error),
            }
        }
    }

    /// Bring `target` up without sending a request of its own. A stale
    /// record found on the way is invalidated and re-established once.
    pub async fn establish(&self, target: &dyn Target) -> Result<Route> {
        match target.resolve().await {
            Err(e) if is_stale(&e) && target.invalidate(&e).await => {
                debug!("Stale state while establishing ({}), once more", e);
                target.resolve().await
            }
            other => other,
        }
    }

    async fn attempt(&self, target: &dyn Target, request: &Request) -> Result<Response> {
        let route = target.resolve().await?;
        let message = request.build(&route)?;
        let response = route.transport.call(message).await?;
        request.check(response)
    }

    /// Send several requests for one target. With batching enabled and
    /// every request compoundable they share frames; results come back in
    /// submission order either way.
    ///
    /// The outer error means a whole frame could not be delivered.
    pub async fn submit_compound(
        &self,
        target: &dyn Target,
        requests: &[Request],
    ) -> Result<Vec<Result<Response>>> {
        let mut results = Vec::with_capacity(requests.len());
        if !self.batching || requests.len() < 2 || !requests.iter().all(|r| r.compoundable) {
            for request in requests {
                results.push(self.submit(target, request).await);
            }
            return Ok(results);
        }

        for range in self.plan_chunks(requests) {
            let chunk = &requests[range];
            if chunk.len() == 1 {
                results.push(self.submit(target, &chunk[0]).await);
            } else {
                results.extend(self.submit_chunk(target, chunk).await?);
            }
        }
        Ok(results)
    }

    async fn submit_chunk(
        &self,
        target: &dyn Target,
        chunk: &[Request],
    ) -> Result<Vec<Result<Response>>> {
        let idempotent = chunk.iter().all(|r| r.idempotent);
        let mut retries = 0;
        let mut recovered = false;
        loop {
            let outcome = async {
                let route = target.resolve().await?;
                let messages = chunk
                    .iter()
                    .map(|request| request.build(&route))
                    .collect::<Result<Vec<_>>>()?;
                route.transport.call_compound(messages).await
            }
            .await;

            let error = match outcome {
                Ok(responses) => {
                    let results: Vec<Result<Response>> = responses
                        .into_iter()
                        .zip(chunk)
                        .map(|(response, request)| response.and_then(|r| request.check(r)))
                        .collect();
                    let stale = results.iter().find_map(|r| match r {
                        Err(e) if is_stale(e) => e.status(),
                        _ => None,
                    });
                    match stale {
                        Some(code) if idempotent && !recovered => {
                            recovered = true;
                            let error = Error::status_for(chunk[0].command, code);
                            if target.invalidate(&error).await {
                                debug!("Compound of {} hit stale state, re-establishing", chunk.len());
                                continue;
                            }
                            return Ok(results);
                        }
                        _ => return Ok(results),
                    }
                }
                Err(e) => e,
            };

            match self.decide(&error, idempotent, retries, true) {
                Next::Retry => {
                    retries += 1;
                    target.invalidate(&error).await;
                    let delay = self.policy.delay(retries);
                    warn!(
                        "Compound of {} failed ({}), retry {}/{} in {:?}",
                        chunk.len(),
                        error,
                        retries,
                        self.policy.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Next::Recover | Next::Surface => return Err(error),
            }
        }
    }

    /// Split `requests` into frames within the count and size limits.
    fn plan_chunks(&self, requests: &[Request]) -> Vec<Range<usize>> {
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut size = 0;
        for (index, request) in requests.iter().enumerate() {
            let estimate = request.wire_estimate();
            let full = index - start >= self.max_compound_count
                || (index > start && size + estimate > self.max_compound_size);
            if full {
                chunks.push(start..index);
                start = index;
                size = 0;
            }
            size += estimate;
        }
        if start < requests.len() {
            chunks.push(start..requests.len());
        }
        chunks
    }
}
