//! BitTorrent protocol messages
//!
//! The ten length-prefixed peer messages plus keep-alive, and the MSB-first
//! bitfield encoding used by `bitfield`.

use bytes::{Buf, BufMut, BytesMut};
use anyhow::Result;
use tracing::{error, trace};

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_error_with_source(
                    "Invalid message ID",
                    format!("value: {}", value),
                ).into())
            }
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::KeepAlive => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing message: {:?}", self.message_id());
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            _ => {}
        }

        buf.to_vec()
    }

    /// Deserialize one complete frame (including the length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            error!("Message shorter than its length prefix: {} bytes", data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Message too short",
                format!("{} bytes", data.len()),
            ).into());
        }

        let mut buf = data;
        let length = buf.get_u32() as usize;
        if buf.remaining() != length {
            return Err(TorrentError::protocol_error_with_source(
                "Length prefix does not match frame size",
                format!("prefix {}, payload {}", length, buf.remaining()),
            ).into());
        }

        if length == 0 {
            trace!("Received KeepAlive message");
            return Ok(Message::KeepAlive);
        }

        let message_id = MessageId::try_from(buf.get_u8())?;
        trace!("Decoding {:?} with {} payload bytes", message_id, buf.remaining());

        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                expect_payload(message_id, buf.remaining(), 4)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request => {
                expect_payload(message_id, buf.remaining(), 12)?;
                Message::Request { index: buf.get_u32(), begin: buf.get_u32(), length: buf.get_u32() }
            }
            MessageId::Piece => {
                if buf.remaining() < 8 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Piece message too short",
                        format!("expected at least 8 bytes, got {}", buf.remaining()),
                    ).into());
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
            MessageId::Cancel => {
                expect_payload(message_id, buf.remaining(), 12)?;
                Message::Cancel { index: buf.get_u32(), begin: buf.get_u32(), length: buf.get_u32() }
            }
            MessageId::Port => {
                expect_payload(message_id, buf.remaining(), 2)?;
                Message::Port { listen_port: buf.get_u16() }
            }
        };

        Ok(message)
    }
}

fn expect_payload(id: MessageId, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        error!("{:?} message has wrong payload size: expected {}, got {}", id, expected, got);
        return Err(TorrentError::protocol_error_with_source(
            format!("{:?} message has wrong payload size", id),
            format!("expected {} bytes, got {}", expected, got),
        ).into());
    }
    Ok(())
}

/// Expand a wire bitfield into one flag per piece
///
/// Bit 7 of byte 0 is piece 0. Trailing spare bits are dropped; a short
/// bitfield leaves the remaining pieces unavailable.
pub fn decode_bitfield(bytes: &[u8], piece_count: usize) -> Vec<bool> {
    (0..piece_count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|byte| byte & (0x80 >> (i % 8)) != 0)
                .unwrap_or(false)
        })
        .collect()
}

/// Pack per-piece flags into a wire bitfield
pub fn encode_bitfield(flags: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; flags.len().div_ceil(8)];
    for (i, _) in flags.iter().enumerate().filter(|(_, has)| **has) {
        bytes[i / 8] |= 0x80 >> (i % 8);
    }
    bytes
}
