//! Stream establishment: TCP connect and the NetBIOS session handshake

use crate::error::{Error, Result};
use crate::netbios::{self, negative_response, NetBiosHeader, NetBiosMessageType};
use crate::resolver::ResolvedAddress;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Byte stream an SMB connection runs over
pub trait SmbStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SmbStream for T {}

pub type BoxedStream = Box<dyn SmbStream>;

/// Opens raw byte streams to a resolved server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ResolvedAddress, port: u16) -> Result<BoxedStream>;
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &ResolvedAddress, port: u16) -> Result<BoxedStream> {
        let addr = SocketAddr::new(target.addr, port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::ConnectionLost(format!(
                    "connect to {} timed out after {:?}",
                    addr, self.connect_timeout
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!("TCP connection to {} ({}) established", target.host, addr);
        Ok(Box::new(stream))
    }
}

/// Result of one NetBIOS session request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRequestOutcome {
    Accepted,
    /// Refused for this called name; another name may work
    WrongName(u8),
}

/// Send a session request on `stream` and read the verdict.
pub async fn request_netbios_session<S>(
    stream: &mut S,
    called: &str,
    calling: &str,
) -> Result<SessionRequestOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let packet = netbios::session_request(called, calling)?;
    stream.write_all(&packet).await?;
    stream.flush().await?;

    let mut header_bytes = [0u8; NetBiosHeader::SIZE];
    stream.read_exact(&mut header_bytes).await?;
    let header = NetBiosHeader::parse(&header_bytes)?;
    let mut trailer = vec![0u8; header.length as usize];
    stream.read_exact(&mut trailer).await?;

    match header.message_type {
        NetBiosMessageType::PositiveResponse => Ok(SessionRequestOutcome::Accepted),
        NetBiosMessageType::NegativeResponse => {
            let code = trailer
                .first()
                .copied()
                .unwrap_or(negative_response::UNSPECIFIED_ERROR);
            match code {
                negative_response::NOT_LISTENING_ON_CALLED_NAME
                | negative_response::CALLED_NAME_NOT_PRESENT => {
                    Ok(SessionRequestOutcome::WrongName(code))
                }
                other => Err(Error::Protocol(format!(
                    "NetBIOS session request rejected with error code: 0x{:02x}",
                    other
                ))),
            }
        }
        other => Err(Error::Protocol(format!(
            "Unexpected NetBIOS response type: {:?}",
            other
        ))),
    }
}

/// Open a stream ready for SMB2 frames.
///
/// With NetBIOS framing every called name is tried in turn, reconnecting
/// after each refusal for the wrong name.
pub async fn open_stream(
    connector: &dyn Connector,
    target: &ResolvedAddress,
    port: u16,
    netbios: bool,
    calling: &str,
) -> Result<BoxedStream> {
    if !netbios {
        return connector.connect(target, port).await;
    }

    let mut last_code = None;
    for called in target.called_names.clone() {
        let mut stream = connector.connect(target, port).await?;
        match request_netbios_session(&mut *stream, &called, calling).await? {
            SessionRequestOutcome::Accepted => {
                debug!("NetBIOS session to {} accepted as {}", target.host, called);
                return Ok(stream);
            }
            SessionRequestOutcome::WrongName(code) => {
                warn!(
                    "{} refused called name {} (0x{:02x}), trying the next one",
                    target.host, called, code
                );
                let _ = stream.shutdown().await;
                last_code = Some(code);
            }
        }
    }

    Err(Error::Protocol(format!(
        "no called name accepted by {} (last code {:?})",
        target.host, last_code
    )))
}
