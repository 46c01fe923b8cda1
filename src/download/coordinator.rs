//! Download coordinator
//!
//! Owns the session state shared by all peer connections, starts and stops
//! connections, and runs the periodic sweeps: request expiry, endgame,
//! transfer statistics and rediscovery.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::download::config::SessionConfig;
use crate::download::progress::{ProgressSink, TransferRates};
use crate::download::source::PeerSource;
use crate::error::TorrentError;
use crate::peer::{empty_bitfield, PeerBitfield, PeerCommand, PeerConnection};
use crate::protocol::PeerId;
use crate::storage::{Block, OutputFile, PieceTracker};
use crate::torrent::TorrentInfo;

/// Buffered commands per peer before sweeps start dropping nudges
const PEER_COMMAND_BUFFER: usize = 32;

/// Where a session stands
#[derive(Debug, Clone)]
pub enum SessionStatus {
    Running,
    Paused,
    Complete,
    Failed(TorrentError),
}

impl SessionStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, SessionStatus::Complete)
    }

    /// Complete or failed; no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Failed(_))
    }
}

/// State shared by the coordinator and every peer connection of one session
pub struct SessionContext {
    pub torrent: Arc<TorrentInfo>,
    /// Process-wide identity sent in every handshake
    pub peer_id: PeerId,
    pub config: SessionConfig,
    pub pieces: Mutex<PieceTracker>,
    pub output: Arc<OutputFile>,
    pub sink: Arc<dyn ProgressSink>,
    paused: AtomicBool,
    downloaded: AtomicU64,
    status: watch::Sender<SessionStatus>,
}

impl SessionContext {
    /// Create the output file and an empty tracker
    pub async fn create(
        torrent: Arc<TorrentInfo>,
        peer_id: PeerId,
        config: SessionConfig,
        output_path: PathBuf,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Arc<Self>> {
        let output = OutputFile::create(&output_path, torrent.total_size()).await?;
        let pieces = PieceTracker::with_timeout(torrent.clone(), config.request_timeout());
        let (status, _) = watch::channel(SessionStatus::Running);

        Ok(Arc::new(Self {
            torrent,
            peer_id,
            config,
            pieces: Mutex::new(pieces),
            output: Arc::new(output),
            sink,
            paused: AtomicBool::new(false),
            downloaded: AtomicU64::new(0),
            status,
        }))
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                return false;
            }
            *status = if paused { SessionStatus::Paused } else { SessionStatus::Running };
            true
        });
    }

    /// Count payload bytes received from peers
    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Write one received block in the background
    ///
    /// The caller must already have called `output.begin_write()` while
    /// holding the tracker lock, so completion can never be observed before
    /// the write is counted.
    pub fn spawn_write(self: &Arc<Self>, offset: u64, data: Vec<u8>) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            let result = ctx.output.write_at(offset, &data).await;
            let remaining = ctx.output.end_write();
            match result {
                Ok(()) if remaining == 0 => ctx.check_complete().await,
                Ok(()) => {}
                Err(e) => ctx.fail(e),
            }
        });
    }

    /// Close the file and report completion once everything is on disk
    async fn check_complete(&self) {
        let done = self.pieces.lock().await.is_done();
        if !done || self.output.pending_writes() != 0 {
            return;
        }
        match self.output.close().await {
            Ok(true) => {
                info!("All {} pieces written to {}", self.torrent.piece_count(), self.output.path().display());
                let changed = self.status.send_if_modified(|status| {
                    if status.is_terminal() {
                        return false;
                    }
                    *status = SessionStatus::Complete;
                    true
                });
                if changed {
                    self.sink.missing_pieces(0, self.torrent.piece_count());
                    self.sink.completed();
                }
            }
            Ok(false) => {}
            Err(e) => self.fail(e),
        }
    }

    /// Report a fatal error; only the first one is surfaced
    fn fail(&self, err: anyhow::Error) {
        let typed = match err.downcast::<TorrentError>() {
            Ok(typed) => typed,
            Err(other) => TorrentError::disk_error(other.to_string()),
        };
        error!("Session failed: {}", typed);
        let changed = self.status.send_if_modified(|status| {
            if status.is_terminal() {
                return false;
            }
            *status = SessionStatus::Failed(typed.clone());
            true
        });
        if changed {
            self.sink.failed(&typed);
        }
    }
}

/// Coordinator-side view of one running connection
struct PeerHandle {
    id: u64,
    commands: mpsc::Sender<PeerCommand>,
    bitfield: PeerBitfield,
    task: JoinHandle<()>,
}

type PeerMap = Arc<RwLock<HashMap<SocketAddr, PeerHandle>>>;

/// Drives one download session
#[derive(Clone)]
pub struct DownloadCoordinator {
    ctx: Arc<SessionContext>,
    source: Arc<dyn PeerSource>,
    peers: PeerMap,
    next_peer_id: Arc<AtomicU64>,
    discovering: Arc<AtomicBool>,
    last_discovery: Arc<Mutex<Option<Instant>>>,
    /// Peers whose connection ended on its own; cleared by `resume`
    dropped: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl DownloadCoordinator {
    pub fn new(ctx: Arc<SessionContext>, source: Arc<dyn PeerSource>) -> Self {
        Self {
            ctx,
            source,
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_peer_id: Arc::new(AtomicU64::new(0)),
            discovering: Arc::new(AtomicBool::new(false)),
            last_discovery: Arc::new(Mutex::new(None)),
            dropped: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub async fn active_peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Run until the session completes or fails
    pub async fn run(&self) -> Result<SessionStatus> {
        info!(
            "Starting download of '{}' ({} pieces, {} bytes)",
            self.ctx.torrent.name,
            self.ctx.torrent.piece_count(),
            self.ctx.torrent.total_size()
        );
        let mut status_rx = self.ctx.subscribe();
        if self.ctx.pieces.lock().await.is_done() {
            self.ctx.check_complete().await;
        }
        self.spawn_discovery();

        let config = &self.ctx.config;
        let mut expiry = interval(config.expiry_sweep());
        let mut endgame = interval(config.endgame_sweep());
        let mut stats = interval(config.stats_interval());
        for ticker in [&mut expiry, &mut endgame, &mut stats] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        let mut last_sample = (Instant::now(), self.ctx.downloaded(), self.ctx.output.bytes_written());

        loop {
            let status = status_rx.borrow_and_update().clone();
            if status.is_terminal() {
                if status.is_complete() {
                    self.shutdown_peers().await;
                    self.ctx.sink.status("Download complete");
                }
                return Ok(status);
            }

            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Ok(self.ctx.status());
                    }
                }
                _ = expiry.tick() => {
                    self.expiry_sweep().await;
                    self.maybe_rediscover().await;
                }
                _ = endgame.tick() => self.endgame_sweep().await,
                _ = stats.tick() => {
                    last_sample = self.stats_sweep(last_sample).await;
                }
            }
        }
    }

    /// Close every peer socket and stop issuing requests
    pub async fn pause(&self) {
        if self.ctx.status().is_terminal() {
            return;
        }
        self.ctx.set_paused(true);
        let closed = self.shutdown_peers().await;
        info!("Paused, closed {} peer connections", closed);
        self.ctx.sink.status("Paused");
    }

    /// Rediscover peers and reconnect against the same tracker and file
    pub async fn resume(&self) {
        if self.ctx.status().is_terminal() {
            return;
        }
        self.ctx.set_paused(false);
        self.dropped.lock().await.clear();
        info!("Resuming download");
        self.ctx.sink.status("Downloading");
        self.spawn_discovery();
    }

    /// Flip between paused and running; returns true if now paused
    pub async fn toggle_pause(&self) -> bool {
        if self.ctx.is_paused() {
            self.resume().await;
            false
        } else {
            self.pause().await;
            self.ctx.is_paused()
        }
    }

    /// Abort every connection task; returns how many there were
    async fn shutdown_peers(&self) -> usize {
        let drained: Vec<PeerHandle> = self.peers.write().await.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.task.abort();
        }
        self.ctx.sink.peer_count(0);
        drained.len()
    }

    fn spawn_discovery(&self) {
        if self.discovering.swap(true, Ordering::SeqCst) {
            debug!("Discovery already in progress");
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.discover_and_connect().await;
            this.discovering.store(false, Ordering::SeqCst);
        });
    }

    /// Query the peer source and connect to every new address
    pub async fn discover_and_connect(&self) {
        *self.last_discovery.lock().await = Some(Instant::now());
        self.ctx.sink.status("Discovering peers");

        let addrs = match self.source.peers().await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("Peer discovery failed: {}", e);
                self.ctx.sink.status("Peer discovery failed");
                return;
            }
        };
        info!("Discovered {} peers", addrs.len());

        if self.ctx.is_paused() || self.ctx.status().is_terminal() {
            return;
        }

        let mut started = 0;
        for addr in addrs {
            if self.connect_peer(addr).await {
                started += 1;
            }
        }
        let active = self.active_peer_count().await;
        debug!("Started {} new connections ({} active)", started, active);
        self.ctx.sink.peer_count(active);
        self.ctx.sink.status(if active > 0 { "Downloading" } else { "No peers available" });
    }

    /// Start a connection task unless the address is connected, was dropped
    /// earlier in this run, or the limit is reached
    async fn connect_peer(&self, addr: SocketAddr) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&addr) || peers.len() >= self.ctx.config.max_connections {
            return false;
        }
        if self.dropped.lock().await.contains(&addr) {
            debug!("Not reconnecting to dropped peer {}", addr);
            return false;
        }

        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(PEER_COMMAND_BUFFER);
        let bitfield = empty_bitfield(self.ctx.torrent.piece_count());
        let connection = PeerConnection::new(addr, self.ctx.clone(), bitfield.clone());
        let registry = self.peers.clone();
        let dropped = self.dropped.clone();
        let ctx = self.ctx.clone();

        let task = tokio::spawn(async move {
            match connection.run(rx).await {
                Ok(stats) => info!(
                    "Peer {} finished: {} blocks, {} bytes",
                    stats.addr, stats.blocks_received, stats.bytes_received
                ),
                Err(e) => match e.downcast::<TorrentError>() {
                    Ok(typed) => {
                        let typed = typed.with_context(format!("peer {}", addr));
                        if typed.is_recoverable() {
                            warn!("Peer {} dropped: {}", addr, typed);
                        } else {
                            ctx.fail(typed.into());
                        }
                    }
                    Err(other) => warn!("Peer {} dropped: {}", addr, other),
                },
            }
            dropped.lock().await.insert(addr);
            let mut peers = registry.write().await;
            if peers.get(&addr).map(|h| h.id) == Some(id) {
                peers.remove(&addr);
            }
            ctx.sink.peer_count(peers.len());
        });

        peers.insert(addr, PeerHandle { id, commands: tx, bitfield, task });
        true
    }

    /// Release stale requests; nudge idle peers when anything was released
    async fn expiry_sweep(&self) {
        let expired = self.ctx.pieces.lock().await.expire_old_requests();
        if expired == 0 || self.ctx.is_paused() {
            return;
        }
        debug!("{} requests expired, nudging peers", expired);
        for handle in self.peers.read().await.values() {
            let _ = handle.commands.try_send(PeerCommand::Nudge);
        }
    }

    /// Fan out the remaining blocks to every peer that has them
    async fn endgame_sweep(&self) {
        if self.ctx.is_paused() {
            return;
        }
        let remaining: Vec<(u32, Vec<Block>)> = {
            let pieces = self.ctx.pieces.lock().await;
            if !pieces.is_endgame_mode() {
                return;
            }
            pieces
                .missing_pieces()
                .into_iter()
                .map(|piece| (piece, pieces.missing_blocks_for_piece(piece)))
                .collect()
        };
        debug!("Endgame: {} pieces remaining", remaining.len());

        for handle in self.peers.read().await.values() {
            let blocks: Vec<Block> = {
                let available = handle.bitfield.read().await;
                remaining
                    .iter()
                    .filter(|(piece, _)| available.get(*piece as usize).copied().unwrap_or(false))
                    .flat_map(|(_, blocks)| blocks.iter().copied())
                    .collect()
            };
            if !blocks.is_empty() {
                let _ = handle.commands.try_send(PeerCommand::Endgame(blocks));
            }
        }
    }

    /// Report rates since the previous sample
    async fn stats_sweep(&self, previous: (Instant, u64, u64)) -> (Instant, u64, u64) {
        let now = Instant::now();
        let downloaded = self.ctx.downloaded();
        let written = self.ctx.output.bytes_written();
        let elapsed = now.duration_since(previous.0).as_secs_f64();

        if elapsed > 0.0 {
            self.ctx.sink.rates(TransferRates {
                download: downloaded.saturating_sub(previous.1) as f64 / elapsed,
                upload: 0.0,
                disk_write: written.saturating_sub(previous.2) as f64 / elapsed,
            });
        }

        let missing = self.ctx.pieces.lock().await.missing_piece_count();
        self.ctx.sink.missing_pieces(missing, self.ctx.torrent.piece_count());
        self.ctx.sink.peer_count(self.active_peer_count().await);
        (now, downloaded, written)
    }

    /// Ask the source again when every peer is gone
    async fn maybe_rediscover(&self) {
        if self.ctx.is_paused() || self.discovering.load(Ordering::SeqCst) {
            return;
        }
        if self.active_peer_count().await > 0 || self.ctx.pieces.lock().await.is_done() {
            return;
        }
        let due = match *self.last_discovery.lock().await {
            Some(last) => last.elapsed() >= self.ctx.config.rediscover_interval(),
            None => true,
        };
        if due {
            info!("No active peers, rediscovering");
            self.spawn_discovery();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::progress::tests::RecordingSink;
    use crate::download::source::StaticPeers;
    use crate::protocol::{
        encode_bitfield, read_frame, write_handshake, write_message, Frame, Handshake, Message, MessageFramer,
    };
    use crate::torrent::info::tests::sample_torrent;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// How a fake seeder treats requests
    #[derive(Clone, Copy)]
    enum Behavior {
        Serve,
        /// Ignore the first request, serve the rest
        StallFirst,
    }

    fn block_byte(index: u32, begin: u32) -> u8 {
        (index as u8).wrapping_mul(31).wrapping_add((begin / 16_384) as u8) | 1
    }

    /// Seeder on 127.0.0.1 that has every piece
    async fn spawn_seeder(torrent: Arc<TorrentInfo>, behavior: Behavior) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let torrent = torrent.clone();
                tokio::spawn(async move {
                    let mut framer = MessageFramer::new();
                    let mut stalled = false;
                    while let Ok(Some(frame)) = read_frame(&mut socket, &mut framer).await {
                        match frame {
                            Frame::Handshake(h) => {
                                let reply = Handshake::new(h.info_hash, [5u8; 20]);
                                let all = vec![true; torrent.piece_count()];
                                if write_handshake(&mut socket, &reply).await.is_err()
                                    || write_message(&mut socket, &Message::Bitfield { bitfield: encode_bitfield(&all) })
                                        .await
                                        .is_err()
                                {
                                    return;
                                }
                            }
                            Frame::Message(Message::Interested) => {
                                if write_message(&mut socket, &Message::Unchoke).await.is_err() {
                                    return;
                                }
                            }
                            Frame::Message(Message::Request { index, begin, length }) => {
                                if matches!(behavior, Behavior::StallFirst) && !stalled {
                                    stalled = true;
                                    continue;
                                }
                                let block = vec![block_byte(index, begin); length as usize];
                                if write_message(&mut socket, &Message::Piece { index, begin, block }).await.is_err() {
                                    return;
                                }
                            }
                            _ => {}
                        }
                    }
                });
            }
        });
        addr
    }

    async fn session(
        dir: &std::path::Path,
        torrent: Arc<TorrentInfo>,
        config: SessionConfig,
        peers: Vec<SocketAddr>,
    ) -> (DownloadCoordinator, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let ctx = SessionContext::create(torrent, PeerId::generate(), config, dir.join("out.bin"), sink.clone())
            .await
            .unwrap();
        (DownloadCoordinator::new(ctx, Arc::new(StaticPeers::new(peers))), sink)
    }

    fn assert_contents(path: &std::path::Path, torrent: &TorrentInfo) {
        let contents = std::fs::read(path).unwrap();
        assert_eq!(contents.len() as u64, torrent.total_size());
        for piece in 0..torrent.piece_count() as u32 {
            for block in torrent.blocks(piece) {
                let start = torrent.file_offset(piece, block.offset) as usize;
                let bytes = &contents[start..start + block.length as usize];
                assert!(bytes.iter().all(|b| *b == block_byte(piece, block.offset)));
            }
        }
    }

    #[tokio::test]
    async fn test_two_seeders_complete_two_piece_torrent() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = Arc::new(sample_torrent(2 * 16_384, 16_384));
        let a = spawn_seeder(torrent.clone(), Behavior::Serve).await;
        let b = spawn_seeder(torrent.clone(), Behavior::Serve).await;
        let (coordinator, sink) = session(dir.path(), torrent.clone(), SessionConfig::default(), vec![a, b]).await;

        let status = timeout(Duration::from_secs(10), coordinator.run()).await.unwrap().unwrap();
        assert!(status.is_complete());
        assert!(coordinator.context().output.is_closed());
        assert_eq!(*sink.completions.lock().unwrap(), 1);
        assert!(sink.failures.lock().unwrap().is_empty());
        assert_eq!(coordinator.active_peer_count().await, 0);
        assert_contents(&dir.path().join("out.bin"), &torrent);
    }

    #[tokio::test]
    async fn test_multi_block_pieces_complete() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = Arc::new(sample_torrent(3 * 32_768 + 1000, 32_768));
        let seeder = spawn_seeder(torrent.clone(), Behavior::Serve).await;
        let (coordinator, sink) = session(dir.path(), torrent.clone(), SessionConfig::default(), vec![seeder]).await;

        let status = timeout(Duration::from_secs(10), coordinator.run()).await.unwrap().unwrap();
        assert!(status.is_complete());
        assert_eq!(*sink.completions.lock().unwrap(), 1);
        assert_contents(&dir.path().join("out.bin"), &torrent);
    }

    #[tokio::test]
    async fn test_stalled_request_is_reissued_after_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = Arc::new(sample_torrent(2 * 16_384, 16_384));
        let seeder = spawn_seeder(torrent.clone(), Behavior::StallFirst).await;
        let config = SessionConfig {
            request_timeout_ms: 200,
            expiry_sweep_ms: 100,
            endgame_sweep_ms: 60_000,
            ..SessionConfig::default()
        };
        let (coordinator, sink) = session(dir.path(), torrent.clone(), config, vec![seeder]).await;

        let status = timeout(Duration::from_secs(10), coordinator.run()).await.unwrap().unwrap();
        assert!(status.is_complete());
        assert_eq!(*sink.completions.lock().unwrap(), 1);
        assert_contents(&dir.path().join("out.bin"), &torrent);
    }

    #[tokio::test]
    async fn test_pause_closes_peers_and_resume_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = Arc::new(sample_torrent(2 * 16_384, 16_384));
        // Stalls its first request, so nothing completes before we pause
        let seeder = spawn_seeder(torrent.clone(), Behavior::StallFirst).await;
        let config = SessionConfig {
            request_timeout_ms: 60_000,
            endgame_sweep_ms: 60_000,
            ..SessionConfig::default()
        };
        let (coordinator, _sink) = session(dir.path(), torrent.clone(), config, vec![seeder]).await;

        coordinator.discover_and_connect().await;
        assert_eq!(coordinator.active_peer_count().await, 1);

        assert!(coordinator.toggle_pause().await);
        assert!(coordinator.context().is_paused());
        assert_eq!(coordinator.active_peer_count().await, 0);
        assert!(matches!(coordinator.context().status(), SessionStatus::Paused));

        assert!(!coordinator.toggle_pause().await);
        timeout(Duration::from_secs(5), async {
            while coordinator.active_peer_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(coordinator.context().status(), SessionStatus::Running));
    }

    /// Peer that answers the handshake with a choke; counts accepted connections
    async fn spawn_choking_peer(accepts: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut framer = MessageFramer::new();
                    while let Ok(Some(frame)) = read_frame(&mut socket, &mut framer).await {
                        if let Frame::Handshake(h) = frame {
                            let reply = Handshake::new(h.info_hash, [6u8; 20]);
                            if write_handshake(&mut socket, &reply).await.is_err()
                                || write_message(&mut socket, &Message::Choke).await.is_err()
                            {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_choking_peer_not_reconnected_until_resume() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = Arc::new(sample_torrent(2 * 16_384, 16_384));
        let accepts = Arc::new(AtomicUsize::new(0));
        let peer = spawn_choking_peer(accepts.clone()).await;
        let config = SessionConfig {
            expiry_sweep_ms: 100,
            endgame_sweep_ms: 60_000,
            rediscover_interval_secs: 1,
            ..SessionConfig::default()
        };
        let (coordinator, _sink) = session(dir.path(), torrent, config, vec![peer]).await;

        // Several rediscovery rounds pass without a second connection
        assert!(timeout(Duration::from_millis(3500), coordinator.run()).await.is_err());
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.active_peer_count().await, 0);

        coordinator.resume().await;
        timeout(Duration::from_secs(5), async {
            while accepts.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_endgame_sweep_fans_out_to_peers_with_piece() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = Arc::new(sample_torrent(2 * 16_384, 16_384));
        let (coordinator, _sink) = session(dir.path(), torrent.clone(), SessionConfig::default(), vec![]).await;

        let (tx_has, mut rx_has) = mpsc::channel(4);
        let (tx_lacks, mut rx_lacks) = mpsc::channel(4);
        {
            let mut peers = coordinator.peers.write().await;
            let has = empty_bitfield(2);
            *has.write().await = vec![true, true];
            peers.insert(
                "127.0.0.1:10".parse().unwrap(),
                PeerHandle { id: 0, commands: tx_has, bitfield: has, task: tokio::spawn(async {}) },
            );
            peers.insert(
                "127.0.0.1:11".parse().unwrap(),
                PeerHandle { id: 1, commands: tx_lacks, bitfield: empty_bitfield(2), task: tokio::spawn(async {}) },
            );
        }

        coordinator.endgame_sweep().await;
        match rx_has.try_recv().unwrap() {
            PeerCommand::Endgame(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("unexpected command {:?}", other),
        }
        assert!(rx_lacks.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disk_failure_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = Arc::new(sample_torrent(16_384, 16_384));
        let (coordinator, sink) = session(dir.path(), torrent, SessionConfig::default(), vec![]).await;
        let ctx = coordinator.context().clone();

        ctx.fail(TorrentError::disk_error("disk full").into());
        ctx.fail(TorrentError::disk_error("second").into());
        assert_eq!(sink.failures.lock().unwrap().len(), 1);

        let status = coordinator.run().await.unwrap();
        assert!(matches!(status, SessionStatus::Failed(TorrentError::DiskError { .. })));
    }

    #[tokio::test]
    async fn test_out_of_bounds_write_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = Arc::new(sample_torrent(16_384, 16_384));
        let (coordinator, sink) = session(dir.path(), torrent, SessionConfig::default(), vec![]).await;
        let ctx = coordinator.context().clone();
        let mut status = ctx.subscribe();

        ctx.output.begin_write();
        ctx.spawn_write(ctx.output.len() + 10, vec![1u8; 4]);

        timeout(Duration::from_secs(5), status.wait_for(|s| s.is_terminal())).await.unwrap().unwrap();
        assert!(matches!(ctx.status(), SessionStatus::Failed(TorrentError::DiskError { .. })));
        assert_eq!(ctx.output.pending_writes(), 0);
        let failures = sink.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("exceeds file length"));
    }
}
