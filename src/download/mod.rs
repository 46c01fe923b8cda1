//! Download session
//!
//! Configuration, peer sources, progress reporting and the coordinator that
//! ties them to the peer connections.

pub mod config;
pub mod coordinator;
pub mod progress;
pub mod source;

pub use config::SessionConfig;
pub use coordinator::{DownloadCoordinator, SessionContext, SessionStatus};
pub use progress::{ProgressSink, TracingSink, TransferRates};
pub use source::{CombinedSource, PeerSource, StaticPeers};
