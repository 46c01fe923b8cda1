//! Wire protocol framing
//!
//! TCP delivers the peer stream in arbitrary chunks. [`MessageFramer`]
//! buffers them and yields complete units: first a handshake, then
//! length-prefixed messages for the rest of the connection.

use bytes::BytesMut;
use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

use super::{Handshake, Message};
use crate::error::TorrentError;

/// Bytes of a handshake unit beyond the protocol string
const HANDSHAKE_FIXED_LEN: usize = 49;

/// Largest message accepted from a peer (bounds bitfields and blocks)
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// One complete unit read off the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake(Handshake),
    Message(Message),
}

/// Reassembles handshake and message units from partial reads
#[derive(Debug)]
pub struct MessageFramer {
    buf: BytesMut,
    expecting_handshake: bool,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(32 * 1024),
            expecting_handshake: true,
        }
    }

    /// Whether the next unit is still the handshake
    pub fn expecting_handshake(&self) -> bool {
        self.expecting_handshake
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer to read into directly
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of buffered bytes not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete unit, if the buffer holds one
    ///
    /// The handshake-to-message mode switch happens exactly once, right after
    /// the first unit is consumed, whether or not it decodes.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.expecting_handshake {
            let Some(&pstrlen) = self.buf.first() else {
                return Ok(None);
            };
            let unit_len = pstrlen as usize + HANDSHAKE_FIXED_LEN;
            if self.buf.len() < unit_len {
                return Ok(None);
            }
            let unit = self.buf.split_to(unit_len);
            self.expecting_handshake = false;
            trace!("Framed handshake unit of {} bytes", unit_len);
            return Handshake::deserialize(&unit).map(|h| Some(Frame::Handshake(h)));
        }

        if self.buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_FRAME_LEN {
            error!("Peer announced oversized frame: {} bytes", length);
            return Err(TorrentError::protocol_error_with_source(
                "Frame exceeds maximum size",
                format!("{} bytes", length),
            ).into());
        }
        if self.buf.len() < 4 + length {
            return Ok(None);
        }
        let unit = self.buf.split_to(4 + length);
        Message::deserialize(&unit).map(|m| Some(Frame::Message(m)))
    }
}

/// Read until the framer yields a unit; `None` means the peer closed the stream
///
/// Cancel-safe: bytes already read stay in the framer.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    framer: &mut MessageFramer,
) -> Result<Option<Frame>> {
    loop {
        if let Some(frame) = framer.next_frame()? {
            return Ok(Some(frame));
        }
        let n = reader.read_buf(framer.buffer_mut()).await.map_err(|e| {
            TorrentError::network_error_full("Failed to read from peer", "stream", e.to_string())
        })?;
        if n == 0 {
            return Ok(None);
        }
    }
}

/// Write a message to the stream
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&message.serialize()).await.map_err(|e| {
        TorrentError::network_error_full("Failed to write message", "stream", e.to_string())
    })?;
    writer.flush().await?;
    Ok(())
}

/// Write a handshake to the stream
pub async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W, handshake: &Handshake) -> Result<()> {
    writer.write_all(&handshake.serialize()).await.map_err(|e| {
        TorrentError::network_error_full("Failed to write handshake", "stream", e.to_string())
    })?;
    writer.flush().await?;
    Ok(())
}
