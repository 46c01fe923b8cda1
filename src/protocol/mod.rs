//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, PeerId, HANDSHAKE_LEN, PROTOCOL_STRING, PROTOCOL_LENGTH};
pub use message::{decode_bitfield, encode_bitfield, Message, MessageId};
pub use wire::{read_frame, write_handshake, write_message, Frame, MessageFramer};
