//! Peer discovery feeds
//!
//! The coordinator only needs a list of addresses; where they come from
//! (trackers, manual entries, anything else) is behind [`PeerSource`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Something that can produce peer addresses on demand
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Query the source; the result should be deduplicated
    async fn peers(&self) -> Result<Vec<SocketAddr>>;

    fn name(&self) -> &str {
        "peers"
    }
}

/// Fixed list of addresses, e.g. from `--peer`
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    addrs: Vec<SocketAddr>,
}

impl StaticPeers {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        let mut seen = HashSet::new();
        let addrs = addrs.into_iter().filter(|a| seen.insert(*a)).collect();
        Self { addrs }
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

#[async_trait]
impl PeerSource for StaticPeers {
    async fn peers(&self) -> Result<Vec<SocketAddr>> {
        Ok(self.addrs.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Union of several sources
///
/// A failing source is logged and skipped so the others still contribute.
#[derive(Default)]
pub struct CombinedSource {
    sources: Vec<Arc<dyn PeerSource>>,
}

impl CombinedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn PeerSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl PeerSource for CombinedSource {
    async fn peers(&self) -> Result<Vec<SocketAddr>> {
        let mut seen = HashSet::new();
        let mut all = Vec::new();
        for source in &self.sources {
            match source.peers().await {
                Ok(addrs) => {
                    debug!("Source '{}' returned {} peers", source.name(), addrs.len());
                    all.extend(addrs.into_iter().filter(|a| seen.insert(*a)));
                }
                Err(e) => warn!("Peer source '{}' failed: {}", source.name(), e),
            }
        }
        Ok(all)
    }

    fn name(&self) -> &str {
        "combined"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TorrentError;

    struct FailingSource;

    #[async_trait]
    impl PeerSource for FailingSource {
        async fn peers(&self) -> Result<Vec<SocketAddr>> {
            Err(TorrentError::network_error("tracker unreachable").into())
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_static_peers_dedup() {
        let source = StaticPeers::new(vec![addr("10.0.0.1:6881"), addr("10.0.0.1:6881"), addr("10.0.0.2:51413")]);
        assert_eq!(source.peers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_combined_skips_failures_and_dedups() {
        let combined = CombinedSource::new()
            .with(Arc::new(StaticPeers::new(vec![addr("10.0.0.1:6881")])))
            .with(Arc::new(FailingSource))
            .with(Arc::new(StaticPeers::new(vec![addr("10.0.0.1:6881"), addr("10.0.0.3:6881")])));

        let peers = combined.peers().await.unwrap();
        assert_eq!(peers, vec![addr("10.0.0.1:6881"), addr("10.0.0.3:6881")]);
    }
}
