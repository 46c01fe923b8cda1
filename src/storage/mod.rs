//! Storage module
//!
//! Block completion tracking and the shared output file.

pub mod piece;
pub mod file;

pub use piece::{Block, PieceTracker, DEFAULT_REQUEST_TIMEOUT, ENDGAME_PIECE_THRESHOLD};
pub use file::OutputFile;
