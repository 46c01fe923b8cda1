//! Per-peer request queue
//!
//! Bounded FIFO of blocks waiting to be requested from one peer. Blocks are
//! deduplicated by `(piece, begin)` unless a duplicate is explicitly allowed
//! for endgame fan-out.

use std::collections::{HashSet, VecDeque};

use tracing::trace;

use crate::storage::Block;
use crate::torrent::TorrentInfo;

/// Default bound on queued blocks per peer
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub struct RequestQueue {
    queue: VecDeque<Block>,
    queued: HashSet<(u32, u32)>,
    capacity: usize,
    choked: bool,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl RequestQueue {
    /// Empty queue; starts choked
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            capacity,
            choked: true,
        }
    }

    /// Enqueue every block of a piece that is not already queued
    ///
    /// Returns the number of blocks added. Stops at capacity.
    pub fn enqueue_piece(&mut self, torrent: &TorrentInfo, piece_index: u32) -> usize {
        let mut added = 0;
        for block in torrent.blocks(piece_index) {
            if self.queue.len() >= self.capacity {
                break;
            }
            if self.enqueue_block(block, false) {
                added += 1;
            }
        }
        trace!("Queued {} blocks of piece {}", added, piece_index);
        added
    }

    /// Enqueue one block, returning whether it was added
    ///
    /// With `allow_duplicate` the dedup set is neither consulted nor updated.
    pub fn enqueue_block(&mut self, block: Block, allow_duplicate: bool) -> bool {
        if self.queue.len() >= self.capacity {
            return false;
        }
        if !allow_duplicate && !self.queued.insert(block.key()) {
            return false;
        }
        self.queue.push_back(block);
        true
    }

    /// Pop the oldest block
    pub fn dequeue(&mut self) -> Option<Block> {
        let block = self.queue.pop_front()?;
        self.queued.remove(&block.key());
        Some(block)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_choked(&mut self, choked: bool) {
        self.choked = choked;
    }
}
