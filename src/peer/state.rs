//! Peer state module
//!
//! Connection states and the per-peer availability bitfield.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Lifecycle of one peer connection
///
/// `Connecting -> Handshaking -> Choked | Unchoked -> Downloading -> Disconnected`.
/// Any state may drop straight to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// TCP connect in progress
    #[default]
    Connecting,
    /// Handshake sent, waiting for the peer's
    Handshaking,
    /// Handshake done, peer is not serving requests
    Choked,
    /// Peer is willing to serve requests
    Unchoked,
    /// At least one request is in flight
    Downloading,
    /// Socket closed; terminal
    Disconnected,
}

impl PeerState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: PeerState) -> bool {
        use PeerState::*;
        match (self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Choked | Unchoked) => true,
            (Choked, Unchoked) => true,
            (Unchoked | Downloading, Downloading) => true,
            _ => false,
        }
    }

    /// Handshake completed and the socket is still open
    pub fn is_established(&self) -> bool {
        matches!(self, PeerState::Choked | PeerState::Unchoked | PeerState::Downloading)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Connecting => "connecting",
            PeerState::Handshaking => "handshaking",
            PeerState::Choked => "choked",
            PeerState::Unchoked => "unchoked",
            PeerState::Downloading => "downloading",
            PeerState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Pieces a peer has announced, shared with the coordinator for endgame fan-out
pub type PeerBitfield = Arc<RwLock<Vec<bool>>>;

/// New bitfield with every piece unavailable
pub fn empty_bitfield(piece_count: usize) -> PeerBitfield {
    Arc::new(RwLock::new(vec![false; piece_count]))
}

/// Final counters of a finished connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub state: PeerState,
    pub blocks_received: u64,
    pub bytes_received: u64,
    pub requests_sent: u64,
}

impl PeerStats {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: PeerState::Connecting,
            blocks_received: 0,
            bytes_received: 0,
            requests_sent: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            PeerState::Connecting,
            PeerState::Handshaking,
            PeerState::Choked,
            PeerState::Unchoked,
            PeerState::Downloading,
            PeerState::Downloading,
            PeerState::Disconnected,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!PeerState::Connecting.can_transition_to(PeerState::Downloading));
        assert!(!PeerState::Handshaking.can_transition_to(PeerState::Downloading));
        assert!(!PeerState::Disconnected.can_transition_to(PeerState::Connecting));
        assert!(!PeerState::Downloading.can_transition_to(PeerState::Choked));
    }

    #[test]
    fn test_is_established() {
        assert!(!PeerState::Handshaking.is_established());
        assert!(PeerState::Unchoked.is_established());
        assert!(!PeerState::Disconnected.is_established());
        assert_eq!(PeerState::default(), PeerState::Connecting);
    }

    #[tokio::test]
    async fn test_empty_bitfield() {
        let bitfield = empty_bitfield(5);
        assert_eq!(bitfield.read().await.len(), 5);
        assert!(bitfield.read().await.iter().all(|b| !*b));
    }
}
