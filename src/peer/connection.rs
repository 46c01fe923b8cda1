//! Peer connection module
//!
//! One task per remote peer. The task owns the socket, the peer's request
//! queue and its choke state; it shares the piece tracker and output file
//! with every other connection through the [`SessionContext`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::download::SessionContext;
use crate::error::TorrentError;
use crate::peer::queue::RequestQueue;
use crate::peer::state::{PeerBitfield, PeerState, PeerStats};
use crate::protocol::{
    decode_bitfield, read_frame, write_handshake, write_message, Frame, Handshake, Message, MessageFramer,
};
use crate::storage::Block;

/// Instructions from the coordinator to a running connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Run request issuance again (sent after stale requests expired)
    Nudge,
    /// Endgame: request these blocks right away, even if other peers have them in flight
    Endgame(Vec<Block>),
}

/// Whether the dispatch loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// State of one peer connection
pub struct PeerConnection {
    addr: SocketAddr,
    ctx: Arc<SessionContext>,
    queue: RequestQueue,
    bitfield: PeerBitfield,
    state: PeerState,
    stats: PeerStats,
}

impl PeerConnection {
    pub fn new(addr: SocketAddr, ctx: Arc<SessionContext>, bitfield: PeerBitfield) -> Self {
        let queue = RequestQueue::new(ctx.config.queue_capacity);
        Self {
            addr,
            ctx,
            queue,
            bitfield,
            state: PeerState::Connecting,
            stats: PeerStats::new(addr),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Connect over TCP and drive the connection until it ends
    pub async fn run(self, commands: mpsc::Receiver<PeerCommand>) -> Result<PeerStats> {
        let addr = self.addr;
        debug!("Connecting to peer: {}", addr);

        let stream = timeout(self.ctx.config.peer_connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|e| {
                debug!("Connection timeout to {}", addr);
                TorrentError::network_error_full("Connection timeout", addr.to_string(), e.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;

        info!("Connected to peer: {}", addr);
        self.run_on(stream, commands).await
    }

    /// Drive the connection over an already-open stream
    pub async fn run_on<S>(mut self, stream: S, mut commands: mpsc::Receiver<PeerCommand>) -> Result<PeerStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let handshake = Handshake::new(self.ctx.torrent.info_hash, *self.ctx.peer_id.as_bytes());
        write_handshake(&mut writer, &handshake).await.map_err(|e| {
            TorrentError::peer_error_full("Failed to send handshake", self.addr.to_string(), e.to_string())
        })?;
        self.transition(PeerState::Handshaking);

        let mut framer = MessageFramer::new();
        let result = loop {
            tokio::select! {
                frame = read_frame(&mut reader, &mut framer) => {
                    let flow = match frame {
                        Ok(Some(Frame::Handshake(peer_handshake))) => {
                            self.on_handshake(peer_handshake, &mut writer).await
                        }
                        Ok(Some(Frame::Message(message))) => self.on_message(message, &mut writer).await,
                        Ok(None) if self.state == PeerState::Handshaking => Err(TorrentError::peer_error_with_peer(
                            "Connection closed during handshake",
                            self.addr.to_string(),
                        )
                        .into()),
                        Ok(None) => {
                            info!("Peer {} closed the connection", self.addr);
                            Ok(Flow::Close)
                        }
                        Err(e) => Err(e),
                    };
                    match flow {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                command = commands.recv() => {
                    let outcome = match command {
                        Some(PeerCommand::Nudge) => self.request_piece(&mut writer).await,
                        Some(PeerCommand::Endgame(blocks)) => self.send_endgame(blocks, &mut writer).await,
                        None => break Ok(()),
                    };
                    if let Err(e) = outcome {
                        break Err(e);
                    }
                }
            }
        };

        self.transition(PeerState::Disconnected);
        self.stats.state = self.state;
        result.map(|_| self.stats)
    }

    fn transition(&mut self, next: PeerState) {
        if self.state == next {
            return;
        }
        if self.state.can_transition_to(next) {
            trace!("Peer {}: {} -> {}", self.addr, self.state, next);
            self.state = next;
        } else {
            debug!("Peer {}: ignoring transition {} -> {}", self.addr, self.state, next);
        }
    }

    async fn on_handshake<W>(&mut self, handshake: Handshake, writer: &mut W) -> Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        handshake.validate(&self.ctx.torrent.info_hash).map_err(|e| {
            warn!("Dropping peer {}: {}", self.addr, e);
            e
        })?;
        debug!("Handshake from {} (peer id {})", self.addr, hex::encode(handshake.peer_id));

        write_message(writer, &Message::Interested).await?;
        self.transition(PeerState::Choked);
        Ok(Flow::Continue)
    }

    async fn on_message<W>(&mut self, message: Message, writer: &mut W) -> Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        match message {
            Message::KeepAlive => trace!("KeepAlive from {}", self.addr),
            Message::Choke => {
                info!("Peer {} choked us, closing", self.addr);
                self.queue.set_choked(true);
                return Ok(Flow::Close);
            }
            Message::Unchoke => {
                debug!("Peer {} unchoked us", self.addr);
                self.queue.set_choked(false);
                self.transition(PeerState::Unchoked);
                self.request_piece(writer).await?;
            }
            Message::Have { piece_index } => self.on_have(piece_index, writer).await?,
            Message::Bitfield { bitfield } => {
                let queue_was_empty = self.queue.is_empty();
                let flags = decode_bitfield(&bitfield, self.ctx.torrent.piece_count());
                debug!(
                    "Peer {} has {}/{} pieces",
                    self.addr,
                    flags.iter().filter(|f| **f).count(),
                    flags.len()
                );
                *self.bitfield.write().await = flags;
                if queue_was_empty {
                    self.request_piece(writer).await?;
                }
            }
            Message::Piece { index, begin, block } => self.on_piece(index, begin, block, writer).await?,
            other => trace!("Ignoring {:?} from {}", other.message_id(), self.addr),
        }
        Ok(Flow::Continue)
    }

    async fn on_have<W>(&mut self, piece_index: u32, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if piece_index as usize >= self.ctx.torrent.piece_count() {
            warn!("Peer {} announced unknown piece {}", self.addr, piece_index);
            return Ok(());
        }
        if let Some(slot) = self.bitfield.write().await.get_mut(piece_index as usize) {
            *slot = true;
        }

        let queue_was_empty = self.queue.is_empty();
        {
            let mut pieces = self.ctx.pieces.lock().await;
            for block in self.ctx.torrent.blocks(piece_index) {
                if pieces.needed(&block) {
                    self.queue.enqueue_block(block, false);
                }
            }
        }
        if queue_was_empty {
            self.request_piece(writer).await?;
        }
        Ok(())
    }

    async fn on_piece<W>(&mut self, index: u32, begin: u32, data: Vec<u8>, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(block) = self.ctx.torrent.block_at(index, begin, data.len() as u32) else {
            warn!(
                "Peer {} sent block outside torrent geometry: index={}, begin={}, len={}",
                self.addr, index, begin, data.len()
            );
            return Ok(());
        };

        let (fresh, missing, done) = {
            let mut pieces = self.ctx.pieces.lock().await;
            let fresh = pieces.add_received(&block);
            if fresh {
                self.ctx.output.begin_write();
            }
            (fresh, pieces.missing_piece_count(), pieces.is_done())
        };

        self.stats.blocks_received += 1;
        self.stats.bytes_received += data.len() as u64;
        self.ctx.record_downloaded(data.len() as u64);

        if fresh {
            trace!("Block {}:{} from {}", index, begin, self.addr);
            self.ctx.sink.missing_pieces(missing, self.ctx.torrent.piece_count());
            let offset = self.ctx.torrent.file_offset(index, begin);
            self.ctx.spawn_write(offset, data);
        } else {
            trace!("Duplicate block {}:{} from {} dropped", index, begin, self.addr);
        }

        if !done {
            self.request_piece(writer).await?;
        }
        Ok(())
    }

    /// Issue at most one request for the next still-needed block
    async fn request_piece<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.ctx.is_paused() || self.queue.is_choked() {
            return Ok(());
        }

        let available = if self.queue.is_empty() {
            Some(self.bitfield.read().await.clone())
        } else {
            None
        };

        let next = {
            let mut pieces = self.ctx.pieces.lock().await;
            if let Some(available) = available {
                if !pieces.is_done() {
                    for block in pieces.missing_blocks_for_peer(&available) {
                        if pieces.needed(&block) && !self.queue.enqueue_block(block, false) {
                            break;
                        }
                    }
                }
            }

            let mut next = None;
            while let Some(block) = self.queue.dequeue() {
                if pieces.needed(&block) {
                    pieces.add_requested(&block);
                    next = Some(block);
                    break;
                }
            }
            next
        };

        if let Some(block) = next {
            self.send_request(&block, writer).await?;
            self.transition(PeerState::Downloading);
        }
        Ok(())
    }

    async fn send_endgame<W>(&mut self, blocks: Vec<Block>, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.ctx.is_paused() || !self.state.is_established() {
            return Ok(());
        }
        debug!("Endgame: requesting {} blocks from {}", blocks.len(), self.addr);
        for block in blocks {
            self.ctx.pieces.lock().await.add_requested(&block);
            self.send_request(&block, writer).await?;
        }
        Ok(())
    }

    async fn send_request<W>(&mut self, block: &Block, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        trace!("Requesting {}:{} ({} bytes) from {}", block.piece_index, block.offset, block.length, self.addr);
        let request = Message::Request {
            index: block.piece_index,
            begin: block.offset,
            length: block.length,
        };
        write_message(writer, &request).await.map_err(|e| {
            error!("Failed to send request to {}: {}", self.addr, e);
            TorrentError::peer_error_full("Failed to send request", self.addr.to_string(), e.to_string())
        })?;
        self.stats.requests_sent += 1;
        Ok(())
    }
}
