//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the downloader
#[derive(Debug, Parser)]
#[command(name = "bitlit")]
#[command(about = "Download a single-file torrent from its trackers", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR", default_value = "./downloads")]
    pub output_dir: PathBuf,

    /// Port announced to trackers (overrides the config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of peer connections (overrides the config file)
    #[arg(short, long)]
    pub max_connections: Option<usize>,

    /// JSON session config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Extra peer to connect to, may be repeated
    #[arg(long = "peer", value_name = "IP:PORT")]
    pub peers: Vec<SocketAddr>,

    /// Skip tracker announces and use only --peer addresses
    #[arg(long)]
    pub no_tracker: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
