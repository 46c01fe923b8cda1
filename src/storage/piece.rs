//! Piece and block completion tracking
//!
//! One [`PieceTracker`] is shared by every peer connection of a session. It
//! keeps two `[piece][block]` matrices, `requested` and `received`, plus the
//! time each outstanding request was issued. Callers hold it behind a mutex so
//! every method runs as one atomic unit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::torrent::{TorrentInfo, BLOCK_LEN};

/// Requests older than this are released for re-request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Endgame is considered when at most this many pieces are missing
pub const ENDGAME_PIECE_THRESHOLD: usize = 10;

/// A block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    /// Piece index this block belongs to
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
}

impl Block {
    /// Create a new block
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }

    /// Position of this block within its piece
    pub fn block_index(&self) -> u32 {
        self.offset / BLOCK_LEN
    }

    /// Deduplication key used by request queues
    pub fn key(&self) -> (u32, u32) {
        (self.piece_index, self.offset)
    }
}

/// Requested/received bookkeeping for every block of a torrent
#[derive(Debug)]
pub struct PieceTracker {
    torrent: Arc<TorrentInfo>,
    requested: Vec<Vec<bool>>,
    received: Vec<Vec<bool>>,
    requested_count: usize,
    received_count: usize,
    total_blocks: usize,
    request_times: HashMap<(u32, u32), Instant>,
    request_timeout: Duration,
}

impl PieceTracker {
    pub fn new(torrent: Arc<TorrentInfo>) -> Self {
        Self::with_timeout(torrent, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(torrent: Arc<TorrentInfo>, request_timeout: Duration) -> Self {
        let matrix: Vec<Vec<bool>> = (0..torrent.piece_count() as u32)
            .map(|piece| vec![false; torrent.blocks_per_piece(piece) as usize])
            .collect();
        let total_blocks = matrix.iter().map(Vec::len).sum();
        debug!(
            "Tracking {} pieces, {} blocks, request timeout {:?}",
            matrix.len(),
            total_blocks,
            request_timeout
        );

        Self {
            torrent,
            requested: matrix.clone(),
            received: matrix,
            requested_count: 0,
            received_count: 0,
            total_blocks,
            request_times: HashMap::new(),
            request_timeout,
        }
    }

    fn position(&self, block: &Block) -> Option<(usize, usize)> {
        let piece = block.piece_index as usize;
        let index = block.block_index() as usize;
        (piece < self.received.len() && index < self.received[piece].len()).then_some((piece, index))
    }

    /// Mark a block as requested and start its expiry clock
    pub fn add_requested(&mut self, block: &Block) {
        self.add_requested_at(block, Instant::now());
    }

    pub fn add_requested_at(&mut self, block: &Block, now: Instant) {
        let Some((p, b)) = self.position(block) else { return };
        if !self.requested[p][b] {
            self.requested[p][b] = true;
            self.requested_count += 1;
        }
        self.request_times.insert((p as u32, b as u32), now);
    }

    /// Mark a block as received
    ///
    /// Returns true the first time a block arrives; duplicates return false
    /// and change nothing. A received block also counts as requested.
    pub fn add_received(&mut self, block: &Block) -> bool {
        let Some((p, b)) = self.position(block) else { return false };
        self.request_times.remove(&(p as u32, b as u32));
        if self.received[p][b] {
            trace!("Duplicate block {}:{} ignored", p, b);
            return false;
        }
        self.received[p][b] = true;
        self.received_count += 1;
        if !self.requested[p][b] {
            self.requested[p][b] = true;
            self.requested_count += 1;
        }
        true
    }

    /// Whether a block should be requested now
    ///
    /// Once every block has been requested but some are still missing,
    /// `requested` is reset to a copy of `received` so undelivered blocks
    /// become requestable again.
    pub fn needed(&mut self, block: &Block) -> bool {
        if self.requested_count == self.total_blocks && self.received_count < self.total_blocks {
            debug!("All blocks requested, recycling {} undelivered", self.total_blocks - self.received_count);
            self.requested = self.received.clone();
            self.requested_count = self.received_count;
        }
        match self.position(block) {
            Some((p, b)) => !self.requested[p][b],
            None => false,
        }
    }

    /// Release requests older than the request timeout, returning how many
    pub fn expire_old_requests(&mut self) -> usize {
        self.expire_old_requests_at(Instant::now())
    }

    pub fn expire_old_requests_at(&mut self, now: Instant) -> usize {
        let timeout = self.request_timeout;
        let expired: Vec<(u32, u32)> = self
            .request_times
            .iter()
            .filter(|(_, issued)| now.saturating_duration_since(**issued) > timeout)
            .map(|(key, _)| *key)
            .collect();

        for (p, b) in &expired {
            self.request_times.remove(&(*p, *b));
            let (p, b) = (*p as usize, *b as usize);
            if self.requested[p][b] && !self.received[p][b] {
                self.requested[p][b] = false;
                self.requested_count -= 1;
            }
        }

        if !expired.is_empty() {
            debug!("Expired {} stale block requests", expired.len());
        }
        expired.len()
    }

    /// True iff every block of every piece is received
    pub fn is_done(&self) -> bool {
        self.received_count == self.total_blocks
    }

    /// Number of pieces with at least one missing block
    pub fn missing_piece_count(&self) -> usize {
        self.received.iter().filter(|blocks| !blocks.iter().all(|r| *r)).count()
    }

    /// Indices of pieces with at least one missing block, ascending
    pub fn missing_pieces(&self) -> Vec<u32> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, blocks)| !blocks.iter().all(|r| *r))
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn piece_count(&self) -> usize {
        self.received.len()
    }

    /// Bytes received so far
    pub fn received_bytes(&self) -> u64 {
        self.received
            .iter()
            .enumerate()
            .flat_map(|(p, blocks)| {
                blocks
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| **r)
                    .map(move |(b, _)| (p as u32, b as u32))
            })
            .map(|(p, b)| self.torrent.block_len(p, b) as u64)
            .sum()
    }

    /// Unreceived blocks of every piece the peer announced
    pub fn missing_blocks_for_peer(&self, peer_bitfield: &[bool]) -> Vec<Block> {
        self.received
            .iter()
            .enumerate()
            .filter(|(piece, _)| peer_bitfield.get(*piece).copied().unwrap_or(false))
            .flat_map(|(piece, _)| self.missing_blocks_for_piece(piece as u32))
            .collect()
    }

    /// Unreceived blocks of one piece
    pub fn missing_blocks_for_piece(&self, piece_index: u32) -> Vec<Block> {
        let Some(blocks) = self.received.get(piece_index as usize) else {
            return Vec::new();
        };
        blocks
            .iter()
            .enumerate()
            .filter(|(_, received)| !**received)
            .map(|(b, _)| self.torrent.block(piece_index, b as u32))
            .collect()
    }

    /// Near-completion trigger for duplicating requests across peers
    ///
    /// True when 1 to 10 pieces are missing and the highest-indexed missing
    /// piece still has a missing block.
    pub fn is_endgame_mode(&self) -> bool {
        let missing = self.missing_pieces();
        if missing.is_empty() || missing.len() > ENDGAME_PIECE_THRESHOLD {
            return false;
        }
        missing
            .last()
            .map(|last| !self.missing_blocks_for_piece(*last).is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::tests::sample_torrent;

    fn tracker(total: u64, piece_length: u64) -> PieceTracker {
        PieceTracker::new(Arc::new(sample_torrent(total, piece_length)))
    }

    fn all_blocks(t: &PieceTracker) -> Vec<Block> {
        (0..t.piece_count() as u32)
            .flat_map(|p| t.torrent.blocks(p))
            .collect()
    }

    #[test]
    fn test_block_index_and_key() {
        let block = Block::new(3, 2 * BLOCK_LEN, 100);
        assert_eq!(block.block_index(), 2);
        assert_eq!(block.key(), (3, 2 * BLOCK_LEN));
    }

    #[test]
    fn test_is_done_iff_all_received() {
        let mut t = tracker(50_000, 32_768);
        let blocks = all_blocks(&t);
        assert_eq!(blocks.len(), 4);
        for (i, block) in blocks.iter().enumerate() {
            assert!(!t.is_done());
            assert!(t.add_received(block));
            assert_eq!(t.is_done(), i == blocks.len() - 1);
        }
        assert_eq!(t.missing_piece_count(), 0);
        assert_eq!(t.received_bytes(), 50_000);
    }

    #[test]
    fn test_add_received_idempotent() {
        let mut t = tracker(32_768, 16_384);
        let block = t.torrent.block(0, 0);
        assert!(t.add_received(&block));
        assert!(!t.add_received(&block));
        assert_eq!(t.missing_piece_count(), 1);
        assert!(!t.needed(&block));
    }

    #[test]
    fn test_needed_after_request() {
        let mut t = tracker(65_536, 32_768);
        let block = t.torrent.block(0, 0);
        assert!(t.needed(&block));
        t.add_requested(&block);
        assert!(!t.needed(&block));
    }

    #[test]
    fn test_needed_recycles_on_saturation() {
        let mut t = tracker(65_536, 32_768);
        let blocks = all_blocks(&t);
        for block in &blocks {
            t.add_requested(block);
        }
        t.add_received(&blocks[0]);

        assert!(t.needed(&blocks[1]));
        assert!(!t.needed(&blocks[0]));
    }

    #[test]
    fn test_expire_old_requests() {
        let mut t = tracker(65_536, 32_768);
        let block = t.torrent.block(1, 1);
        let start = Instant::now();
        t.add_requested_at(&block, start);

        assert_eq!(t.expire_old_requests_at(start + Duration::from_secs(5)), 0);
        assert!(!t.needed(&block));

        assert_eq!(t.expire_old_requests_at(start + Duration::from_secs(11)), 1);
        assert!(t.needed(&block));
        assert_eq!(t.expire_old_requests_at(start + Duration::from_secs(30)), 0);
    }

    #[test]
    fn test_received_block_not_expired_back() {
        let mut t = tracker(65_536, 32_768);
        let block = t.torrent.block(0, 0);
        let start = Instant::now();
        t.add_requested_at(&block, start);
        t.add_received(&block);
        assert_eq!(t.expire_old_requests_at(start + Duration::from_secs(60)), 0);
        assert!(!t.needed(&block));
    }

    #[test]
    fn test_missing_blocks_for_peer() {
        let mut t = tracker(3 * 32_768, 32_768);
        t.add_received(&t.torrent.block(1, 0));

        let blocks = t.missing_blocks_for_peer(&[false, true, true]);
        let keys: Vec<(u32, u32)> = blocks.iter().map(|b| (b.piece_index, b.block_index())).collect();
        assert_eq!(keys, vec![(1, 1), (2, 0), (2, 1)]);

        assert!(t.missing_blocks_for_peer(&[]).is_empty());
    }

    #[test]
    fn test_missing_blocks_for_piece() {
        let mut t = tracker(50_000, 32_768);
        let last = t.missing_blocks_for_piece(1);
        assert_eq!(last.len(), 2);
        assert_eq!(last[1].length, 50_000 - 32_768 - BLOCK_LEN);
        t.add_received(&last[0]);
        assert_eq!(t.missing_blocks_for_piece(1), vec![last[1]]);
        assert!(t.missing_blocks_for_piece(9).is_empty());
    }

    #[test]
    fn test_endgame_trigger() {
        let mut t = tracker(12 * 16_384, 16_384);
        assert!(!t.is_endgame_mode());

        let blocks = all_blocks(&t);
        t.add_received(&blocks[0]);
        assert!(!t.is_endgame_mode());
        t.add_received(&blocks[1]);
        assert!(t.is_endgame_mode());

        for block in &blocks[2..] {
            t.add_received(block);
        }
        assert!(!t.is_endgame_mode());
    }

    #[test]
    fn test_out_of_range_block_ignored() {
        let mut t = tracker(16_384, 16_384);
        let bogus = Block::new(5, 0, BLOCK_LEN);
        t.add_requested(&bogus);
        assert!(!t.add_received(&bogus));
        assert!(!t.needed(&bogus));
    }
}
