//! Peer connections
//!
//! Per-peer request queue, connection state and the message loop that
//! drives a single peer.

pub mod connection;
pub mod queue;
pub mod state;

pub use connection::{PeerCommand, PeerConnection};
pub use queue::{RequestQueue, DEFAULT_QUEUE_CAPACITY};
pub use state::{empty_bitfield, PeerBitfield, PeerState, PeerStats};
