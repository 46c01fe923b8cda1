//! Tracker client
//!
//! Announces to every tracker URL of a torrent concurrently and collects the
//! union of the returned peers.

#[cfg(feature = "http-tracker")]
pub mod http;
pub mod udp;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::download::{PeerSource, ProgressSink};
use crate::torrent::TorrentInfo;

/// What we tell a tracker about ourselves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// Bytes still to download
    pub left: u64,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

/// Peer source backed by the torrent's announce URLs
pub struct TrackerClient {
    urls: Vec<Url>,
    params: AnnounceParams,
    connect_timeout: Duration,
    aggregation: Duration,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl TrackerClient {
    pub fn new(torrent: &TorrentInfo, peer_id: [u8; 20], port: u16) -> Self {
        let mut announce = vec![torrent.announce.clone()];
        announce.extend(torrent.announce_list.iter().cloned());

        let mut seen = HashSet::new();
        let urls = announce
            .into_iter()
            .filter(|u| seen.insert(u.clone()))
            .filter_map(|u| match Url::parse(&u) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("Skipping malformed tracker URL '{}': {}", u, e);
                    None
                }
            })
            .collect();

        Self {
            urls,
            params: AnnounceParams { info_hash: torrent.info_hash, peer_id, left: torrent.total_size(), port },
            connect_timeout: Duration::from_secs(2),
            aggregation: Duration::from_secs(2),
            sink: None,
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, aggregation: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.aggregation = aggregation;
        self
    }

    /// Report tracker progress to a sink as well as the log
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    fn status(&self, message: &str) {
        if let Some(sink) = &self.sink {
            sink.status(message);
        }
    }

    /// Announce to every URL and return the deduplicated peers collected
    /// before the deadline
    pub async fn announce_all(&self) -> Vec<SocketAddr> {
        let deadline = Instant::now() + self.connect_timeout + self.aggregation;
        let mut tasks = JoinSet::new();

        for url in &self.urls {
            let url = url.clone();
            let params = self.params;
            let connect_timeout = self.connect_timeout;
            match url.scheme() {
                "udp" => {
                    tasks.spawn(async move {
                        let result = udp::announce(&url, &params, connect_timeout).await;
                        (url, result)
                    });
                }
                #[cfg(feature = "http-tracker")]
                "http" | "https" => {
                    let request_timeout = connect_timeout + self.aggregation;
                    tasks.spawn(async move {
                        let result = http::announce(&url, &params, request_timeout).await;
                        (url, result)
                    });
                }
                other => warn!("Skipping tracker {} with unsupported scheme '{}'", url, other),
            }
        }

        if tasks.is_empty() {
            self.status("No usable trackers");
            return Vec::new();
        }
        self.status(&format!("Contacting {} trackers", tasks.len()));

        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((url, Ok(response)))) => {
                        info!("Tracker {} returned {} peers", url, response.peers.len());
                        peers.extend(response.peers.into_iter().filter(|p| seen.insert(*p)));
                    }
                    Some(Ok((url, Err(e)))) => warn!("Tracker {} failed: {}", url, e),
                    Some(Err(e)) => warn!("Tracker task failed: {}", e),
                    None => break,
                },
                _ = &mut expiry => {
                    debug!("Tracker aggregation window closed with {} requests in flight", tasks.len());
                    tasks.abort_all();
                    break;
                }
            }
        }

        self.status(&format!("Trackers returned {} peers", peers.len()));
        peers
    }
}

#[async_trait]
impl PeerSource for TrackerClient {
    async fn peers(&self) -> Result<Vec<SocketAddr>> {
        Ok(self.announce_all().await)
    }

    fn name(&self) -> &str {
        "tracker"
    }
}
