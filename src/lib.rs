//! bitlit
//!
//! A BitTorrent download engine: wire codec, block tracking with request
//! expiry and endgame, per-peer connections, UDP/HTTP tracker discovery and
//! a download coordinator with pause/resume.

pub mod cli;
pub mod download;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use cli::{CliArgs, Config, ProgressDisplay};
pub use download::{
    CombinedSource, DownloadCoordinator, PeerSource, ProgressSink, SessionConfig, SessionContext, SessionStatus,
    StaticPeers, TracingSink, TransferRates,
};
pub use peer::{PeerCommand, PeerConnection, PeerState, PeerStats, RequestQueue};
pub use protocol::{Handshake, Message, MessageFramer, MessageId, PeerId};
pub use storage::{Block, OutputFile, PieceTracker};
pub use torrent::{TorrentInfo, TorrentParser, BLOCK_LEN};
pub use tracker::{AnnounceParams, AnnounceResponse, TrackerClient};
