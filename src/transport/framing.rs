//! Frame boundaries on the byte stream
//!
//! Every SMB2 frame is prefixed by a 4-byte session-service style header
//! with a 24-bit length. NetBIOS framing may interleave keepalives, which
//! are skipped; direct TCP carries session messages only.

use crate::error::{Error, Result};
use crate::netbios::{NetBiosHeader, NetBiosMessageType};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Wire envelope around each SMB2 frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Direct,
    NetBios,
}

impl Framing {
    fn skips(self, message_type: NetBiosMessageType) -> bool {
        self == Framing::NetBios && message_type == NetBiosMessageType::Keepalive
    }
}

/// Refuse payloads the 24-bit length cannot describe.
pub fn check_frame_length(length: usize) -> Result<u32> {
    u32::try_from(length)
        .ok()
        .filter(|length| *length <= NetBiosHeader::MAX_SESSION_MESSAGE_LENGTH)
        .ok_or_else(|| {
            Error::InvalidParameter(format!(
                "frame of {} bytes exceeds maximum {}",
                length,
                NetBiosHeader::MAX_SESSION_MESSAGE_LENGTH
            ))
        })
}

/// Prefix `payload` with its frame header. Both framings carry SMB2
/// messages the same way, so the framing only matters when reading.
pub fn encode_frame(_framing: Framing, payload: &[u8]) -> Result<Vec<u8>> {
    let length = check_frame_length(payload.len())?;
    let header = NetBiosHeader::new(NetBiosMessageType::SessionMessage, length)?;
    let mut frame = Vec::with_capacity(NetBiosHeader::SIZE + payload.len());
    header.write_to(&mut frame);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write one complete frame. The caller serializes writers.
pub async fn write_frame<W>(writer: &mut W, framing: Framing, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(framing, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reassembles frames from arbitrarily split reads.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    framing: Framing,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, framing: Framing, max_frame_size: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(65536),
            framing,
            max_frame_size,
        }
    }

    /// Next SMB2 frame payload, or `None` on a clean end of stream
    /// between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.try_split()? {
                return Ok(Some(frame));
            }
            if self.read_more().await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::ConnectionLost(format!(
                    "stream closed inside a frame ({} bytes buffered)",
                    self.buffer.len()
                )));
            }
        }
    }

    fn try_split(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.buffer.len() < NetBiosHeader::SIZE {
                return Ok(None);
            }
            let header = NetBiosHeader::parse(&self.buffer)?;
            let length = header.length as usize;
            if length > self.max_frame_size {
                return Err(Error::Protocol(format!(
                    "frame of {} bytes exceeds limit {}",
                    length, self.max_frame_size
                )));
            }
            let total = NetBiosHeader::SIZE + length;
            if self.buffer.len() < total {
                return Ok(None);
            }

            let mut frame = self.buffer.split_to(total);
            match header.message_type {
                NetBiosMessageType::SessionMessage => {
                    let payload = frame.split_off(NetBiosHeader::SIZE);
                    return Ok(Some(payload.freeze()));
                }
                other if self.framing.skips(other) => {
                    trace!("Skipping NetBIOS keepalive");
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected NetBIOS message {:?} on an established session",
                        other
                    )));
                }
            }
        }
    }

    async fn read_more(&mut self) -> Result<usize> {
        self.buffer.reserve(8192);
        let n = self.reader.read_buf(&mut self.buffer).await?;
        Ok(n)
    }
}
