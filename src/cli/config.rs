//! CLI configuration module
//!
//! Merges the optional JSON session config with command-line overrides.

use crate::cli::args::CliArgs;
use crate::download::SessionConfig;
use crate::error::TorrentError;
use anyhow::Result;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Configuration for one run of the downloader
#[derive(Debug, Clone)]
pub struct Config {
    /// Download directory
    pub output_dir: PathBuf,
    /// Manually supplied peers
    pub peers: Vec<SocketAddr>,
    /// Announce to the torrent's trackers
    pub use_tracker: bool,
    pub session: SessionConfig,
}

impl Config {
    /// Create configuration from CLI arguments; flags win over the config file
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut session = match &args.config {
            Some(path) => SessionConfig::from_json_file(path)?,
            None => SessionConfig::default(),
        };
        if let Some(port) = args.port {
            session.listen_port = port;
        }
        if let Some(max) = args.max_connections {
            session.max_connections = max;
        }

        Ok(Self {
            output_dir: args.output_dir.clone(),
            peers: args.peers.clone(),
            use_tracker: !args.no_tracker,
            session,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;

        if self.output_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("Output directory cannot be empty", "output_dir").into());
        }

        if !self.use_tracker && self.peers.is_empty() {
            return Err(TorrentError::config_error_with_field(
                "--no-tracker needs at least one --peer",
                "peer",
            )
            .into());
        }

        Ok(())
    }

    /// Where the torrent's file is written
    pub fn output_path(&self, name: &str) -> PathBuf {
        let file_name = Path::new(name).file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("download"));
        self.output_dir.join(file_name)
    }
}
