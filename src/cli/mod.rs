//! CLI module
//!
//! Command-line arguments, run configuration and the terminal progress display.

pub mod args;
pub mod config;
pub mod progress;

pub use args::CliArgs;
pub use config::Config;
pub use progress::ProgressDisplay;
