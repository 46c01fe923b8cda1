//! Torrent metadata and piece/block geometry
//!
//! All geometry is derived from the total length, the standard piece length
//! and the fixed block length. Nothing about piece or block sizes is stored.

use sha1::{Digest, Sha1};
use anyhow::Result;

use crate::error::TorrentError;
use crate::storage::Block;

/// Standard block length requested over the wire (16 KiB)
pub const BLOCK_LEN: u32 = 16 * 1024;

/// Represents a file in a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// Parsed torrent descriptor, immutable for the lifetime of a session
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Primary tracker announce URL
    pub announce: String,
    /// All tracker announce URLs, primary first, deduplicated
    pub announce_list: Vec<String>,
    /// SHA1 hash of the encoded info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u64,
    /// Piece hashes, 20 bytes each
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Single file size (None for multi-file torrents)
    pub length: Option<u64>,
    /// Files in multi-file torrents (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
}

impl TorrentInfo {
    /// Total size of all files in the torrent
    pub fn total_size(&self) -> u64 {
        if let Some(length) = self.length {
            length
        } else if let Some(files) = &self.files {
            files.iter().map(|f| f.length).sum()
        } else {
            0
        }
    }

    /// Number of pieces in the torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Info hash of the torrent
    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    /// Info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.files.is_some()
    }

    /// Byte length of one piece
    ///
    /// Every piece has the standard length except the last one, which holds
    /// whatever remains of the total length.
    pub fn piece_len(&self, piece_index: u32) -> u32 {
        let total = self.total_size();
        if total == 0 || self.piece_length == 0 {
            return 0;
        }
        let last_index = (total - 1) / self.piece_length;
        if piece_index as u64 == last_index {
            (total - self.piece_length * last_index) as u32
        } else {
            self.piece_length as u32
        }
    }

    /// Number of blocks in one piece
    pub fn blocks_per_piece(&self, piece_index: u32) -> u32 {
        self.piece_len(piece_index).div_ceil(BLOCK_LEN)
    }

    /// Byte length of one block
    ///
    /// The last block of a piece carries the remainder; when the piece is an
    /// exact multiple of the block length it is a full block, never zero.
    pub fn block_len(&self, piece_index: u32, block_index: u32) -> u32 {
        let piece_len = self.piece_len(piece_index);
        let blocks = piece_len.div_ceil(BLOCK_LEN);
        if blocks > 0 && block_index == blocks - 1 {
            piece_len - BLOCK_LEN * (blocks - 1)
        } else {
            BLOCK_LEN
        }
    }

    /// Block descriptor for a (piece, block) position
    pub fn block(&self, piece_index: u32, block_index: u32) -> Block {
        Block::new(
            piece_index,
            block_index * BLOCK_LEN,
            self.block_len(piece_index, block_index),
        )
    }

    /// All blocks of one piece, in offset order
    pub fn blocks(&self, piece_index: u32) -> Vec<Block> {
        (0..self.blocks_per_piece(piece_index))
            .map(|block_index| self.block(piece_index, block_index))
            .collect()
    }

    /// Resolve a wire-level (index, begin, length) triple to a known block
    ///
    /// Returns None when the piece does not exist, the offset is not block
    /// aligned, or the length does not match the geometry.
    pub fn block_at(&self, piece_index: u32, begin: u32, length: u32) -> Option<Block> {
        if piece_index as usize >= self.piece_count() || begin % BLOCK_LEN != 0 {
            return None;
        }
        let block_index = begin / BLOCK_LEN;
        if block_index >= self.blocks_per_piece(piece_index) {
            return None;
        }
        let block = self.block(piece_index, block_index);
        (block.length == length).then_some(block)
    }

    /// Absolute file offset of a block
    pub fn file_offset(&self, piece_index: u32, begin: u32) -> u64 {
        piece_index as u64 * self.piece_length + begin as u64
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from the concatenated `pieces` field
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error_with_source(
                "Pieces field length must be a multiple of 20",
                format!("got {} bytes", pieces_bytes.len()),
            ).into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Single-file torrent with the given geometry, for tests across the crate
    pub(crate) fn sample_torrent(total: u64, piece_length: u64) -> TorrentInfo {
        let piece_count = total.div_ceil(piece_length) as usize;
        TorrentInfo {
            announce: "udp://tracker.example.com:6969/announce".to_string(),
            announce_list: vec!["udp://tracker.example.com:6969/announce".to_string()],
            info_hash: [7u8; 20],
            piece_length,
            pieces: vec![[0u8; 20]; piece_count],
            name: "sample.bin".to_string(),
            length: Some(total),
            files: None,
        }
    }

    #[test]
    fn test_total_size_multi_file() {
        let mut info = sample_torrent(1024, 1024);
        info.length = None;
        info.files = Some(vec![
            TorrentFile { path: vec!["a.txt".to_string()], length: 500 },
            TorrentFile { path: vec!["b.txt".to_string()], length: 524 },
        ]);
        assert_eq!(info.total_size(), 1024);
        assert!(info.is_multi_file());
    }

    #[test]
    fn test_piece_len_last_piece_remainder() {
        let info = sample_torrent(40_000, 16_384);
        assert_eq!(info.piece_count(), 3);
        assert_eq!(info.piece_len(0), 16_384);
        assert_eq!(info.piece_len(1), 16_384);
        assert_eq!(info.piece_len(2), 40_000 - 2 * 16_384);
    }

    #[test]
    fn test_piece_len_exact_multiple() {
        let info = sample_torrent(3 * 32_768, 32_768);
        assert_eq!(info.piece_len(2), 32_768);
    }

    #[test]
    fn test_block_len_never_zero_on_aligned_piece() {
        let info = sample_torrent(2 * 32_768, 32_768);
        assert_eq!(info.blocks_per_piece(1), 2);
        assert_eq!(info.block_len(1, 0), BLOCK_LEN);
        assert_eq!(info.block_len(1, 1), BLOCK_LEN);
    }

    #[test]
    fn test_block_len_short_last_block() {
        let info = sample_torrent(50_000, 32_768);
        assert_eq!(info.blocks_per_piece(1), 2);
        assert_eq!(info.block_len(1, 0), BLOCK_LEN);
        assert_eq!(info.block_len(1, 1), 50_000 - 32_768 - BLOCK_LEN);
    }

    #[test]
    fn test_geometry_sums_match() {
        let cases = [
            (1u64, 16_384u64),
            (16_384, 16_384),
            (16_385, 16_384),
            (100_000, 32_768),
            (262_144 * 3 + 7, 262_144),
            (1_048_576, 262_144),
            (999_999, 49_152),
        ];
        for (total, piece_length) in cases {
            let info = sample_torrent(total, piece_length);
            let mut sum_pieces = 0u64;
            for piece in 0..info.piece_count() as u32 {
                let blocks: u64 = (0..info.blocks_per_piece(piece))
                    .map(|b| {
                        let len = info.block_len(piece, b);
                        assert!(len > 0, "zero block for total={} piece={}", total, piece);
                        len as u64
                    })
                    .sum();
                assert_eq!(blocks, info.piece_len(piece) as u64);
                sum_pieces += info.piece_len(piece) as u64;
            }
            assert_eq!(sum_pieces, total);
        }
    }

    #[test]
    fn test_block_at_validates_geometry() {
        let info = sample_torrent(50_000, 32_768);
        assert!(info.block_at(0, 0, BLOCK_LEN).is_some());
        assert!(info.block_at(1, BLOCK_LEN, 50_000 - 32_768 - BLOCK_LEN).is_some());
        assert!(info.block_at(1, BLOCK_LEN, BLOCK_LEN).is_none());
        assert!(info.block_at(0, 100, BLOCK_LEN).is_none());
        assert!(info.block_at(2, 0, BLOCK_LEN).is_none());
    }

    #[test]
    fn test_file_offset() {
        let info = sample_torrent(100_000, 32_768);
        assert_eq!(info.file_offset(2, BLOCK_LEN), 2 * 32_768 + BLOCK_LEN as u64);
    }

    #[test]
    fn test_parse_piece_hashes_valid() {
        let hashes: Vec<u8> = (0..40).map(|i| i as u8).collect();
        let result = TorrentInfo::parse_piece_hashes(&hashes).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1][0], 20);
    }

    #[test]
    fn test_parse_piece_hashes_invalid() {
        assert!(TorrentInfo::parse_piece_hashes(&[1u8; 21]).is_err());
    }

    #[test]
    fn test_generate_info_hash() {
        let hash = TorrentInfo::generate_info_hash(b"abc");
        assert_eq!(hex::encode(hash), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
