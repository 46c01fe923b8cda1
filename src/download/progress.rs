//! Progress reporting
//!
//! The engine never renders anything itself; it reports to a [`ProgressSink`].

use tracing::{error, info};

use crate::error::TorrentError;

/// Instantaneous transfer rates in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferRates {
    pub download: f64,
    pub upload: f64,
    pub disk_write: f64,
}

/// Consumer of session progress events
pub trait ProgressSink: Send + Sync {
    /// Free-form connection or tracker status
    fn status(&self, message: &str);

    /// Number of connected peers changed
    fn peer_count(&self, count: usize);

    /// Pieces still missing out of the total
    fn missing_pieces(&self, missing: usize, total: usize);

    fn rates(&self, rates: TransferRates);

    /// Every block is on disk and the file is closed; fires once
    fn completed(&self);

    /// Fatal session error
    fn failed(&self, error: &TorrentError);
}

/// Sink that reports through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn status(&self, message: &str) {
        info!("Status: {}", message);
    }

    fn peer_count(&self, count: usize) {
        info!("Connected peers: {}", count);
    }

    fn missing_pieces(&self, missing: usize, total: usize) {
        info!("Missing pieces: {}/{}", missing, total);
    }

    fn rates(&self, rates: TransferRates) {
        info!(
            "Rates: down {:.1} KiB/s, up {:.1} KiB/s, disk {:.2} MiB/s",
            rates.download / 1024.0,
            rates.upload / 1024.0,
            rates.disk_write / (1024.0 * 1024.0)
        );
    }

    fn completed(&self) {
        info!("Download complete");
    }

    fn failed(&self, error: &TorrentError) {
        error!("Download failed: {}", error);
    }
}
