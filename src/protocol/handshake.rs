//! BitTorrent handshake protocol
//!
//! Handles the initial 68-byte handshake between peers.

use bytes::{BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total size of an encoded handshake
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix of every generated peer id
pub const PEER_ID_PREFIX: &[u8; 8] = b"-BL0001-";

/// 20-byte peer identity, generated once per process and shared by every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generate a random peer ID with the client prefix
    pub fn generate() -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        Self(peer_id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved extension bytes, always sent as zero
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing handshake");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from one complete handshake unit
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        let protocol_length = *data.first().ok_or_else(|| {
            TorrentError::protocol_error("Empty handshake")
        })?;
        if protocol_length != PROTOCOL_LENGTH {
            error!("Invalid protocol length: expected {}, got {}", PROTOCOL_LENGTH, protocol_length);
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, protocol_length),
            ).into());
        }

        if data.len() != HANDSHAKE_LEN {
            error!("Handshake has wrong size: expected {} bytes, got {}", HANDSHAKE_LEN, data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Handshake has wrong size",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            ).into());
        }

        if &data[1..20] != PROTOCOL_STRING.as_bytes() {
            error!("Invalid protocol string");
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        debug!("Handshake info_hash: {}, peer_id: {}", hex::encode(info_hash), hex::encode(peer_id));

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validate the handshake against the info hash of our torrent
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<()> {
        if self.info_hash != *expected_info_hash {
            warn!("Handshake validation failed: info hash mismatch");
            warn!("  Expected: {}", hex::encode(expected_info_hash));
            warn!("  Got:      {}", hex::encode(self.info_hash));
            return Err(TorrentError::protocol_error_with_source(
                "Info hash mismatch",
                hex::encode(self.info_hash),
            ).into());
        }

        debug!("Handshake validation successful");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_handshake_serialize_deserialize() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let deserialized = Handshake::deserialize(&handshake.serialize()).unwrap();
        assert_eq!(deserialized, handshake);
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = PeerId::generate();
        assert_eq!(&peer_id.as_bytes()[..8], b"-BL0001-");
        assert_ne!(PeerId::generate(), peer_id);
    }

    #[test]
    fn test_handshake_validate() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]).is_ok());
        assert!(handshake.validate(&[3u8; 20]).is_err());
    }

    #[test]
    fn test_deserialize_rejects_wrong_protocol() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[1] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_deserialize_rejects_wrong_length() {
        let bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        assert!(Handshake::deserialize(&bytes[..60]).is_err());
        assert!(Handshake::deserialize(&[]).is_err());
    }
}
