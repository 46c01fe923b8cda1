//! Torrent file handling module
//!
//! Parsing of .torrent descriptors and the piece/block geometry derived from them.

pub mod parser;
pub mod info;

pub use parser::TorrentParser;
pub use info::{TorrentInfo, TorrentFile, BLOCK_LEN};
