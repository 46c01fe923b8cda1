//! Progress display module
//!
//! Terminal rendering of session progress: one status line rewritten in
//! place, plus a summary when the download ends.

use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::download::{ProgressSink, TransferRates};
use crate::error::TorrentError;

/// Latest values reported by the session
#[derive(Debug, Clone, Default)]
struct DisplayState {
    status: String,
    peers: usize,
    missing: usize,
    total_pieces: usize,
    rates: TransferRates,
    finished: bool,
}

/// Progress display for the CLI
pub struct ProgressDisplay {
    start_time: Instant,
    total_bytes: u64,
    quiet: bool,
    state: Mutex<DisplayState>,
}

impl ProgressDisplay {
    /// Create a new progress display for a download of `total_bytes`
    pub fn new(total_bytes: u64, total_pieces: usize, quiet: bool) -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes,
            quiet,
            state: Mutex::new(DisplayState {
                missing: total_pieces,
                total_pieces,
                status: "Starting".to_string(),
                ..DisplayState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DisplayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Format bytes to human readable string
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_index])
    }

    /// Format speed to human readable string
    pub fn format_speed(bytes_per_sec: f64) -> String {
        format!("{}/s", Self::format_bytes(bytes_per_sec as u64))
    }

    /// Format duration to human readable string
    pub fn format_duration(duration: Duration) -> String {
        let total_secs = duration.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    fn render_line(state: &DisplayState) -> String {
        let done = state.total_pieces.saturating_sub(state.missing);
        let percent = if state.total_pieces == 0 { 100.0 } else { done as f64 * 100.0 / state.total_pieces as f64 };

        let bar_width: usize = 30;
        let filled = ((percent / 100.0) * bar_width as f64) as usize;
        let bar = "=".repeat(filled) + &" ".repeat(bar_width.saturating_sub(filled));

        format!(
            "[{}] {:.1}% | missing {}/{} | ↓ {} | ↑ {} | disk {} | peers {} | {}",
            bar,
            percent,
            state.missing,
            state.total_pieces,
            Self::format_speed(state.rates.download),
            Self::format_speed(state.rates.upload),
            Self::format_speed(state.rates.disk_write),
            state.peers,
            state.status,
        )
    }

    fn redraw(&self, state: &DisplayState) {
        if self.quiet || state.finished {
            return;
        }
        let mut out = io::stdout().lock();
        let _ = write!(out, "\r\x1b[2K{}", Self::render_line(state));
        let _ = out.flush();
    }

    /// Completion summary with elapsed time and average speed
    fn summary(&self) -> String {
        let elapsed = self.start_time.elapsed();
        let secs = elapsed.as_secs_f64();
        let average = if secs > 0.0 { self.total_bytes as f64 / secs } else { 0.0 };
        format!(
            "Download complete: {} in {} (average {})",
            Self::format_bytes(self.total_bytes),
            Self::format_duration(elapsed),
            Self::format_speed(average)
        )
    }

    /// Get the elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

impl ProgressSink for ProgressDisplay {
    fn status(&self, message: &str) {
        let mut state = self.state();
        state.status = message.to_string();
        self.redraw(&state);
    }

    fn peer_count(&self, count: usize) {
        let mut state = self.state();
        state.peers = count;
        self.redraw(&state);
    }

    fn missing_pieces(&self, missing: usize, total: usize) {
        let mut state = self.state();
        state.missing = missing;
        state.total_pieces = total;
        self.redraw(&state);
    }

    fn rates(&self, rates: TransferRates) {
        let mut state = self.state();
        state.rates = rates;
        self.redraw(&state);
    }

    fn completed(&self) {
        let mut state = self.state();
        state.missing = 0;
        state.finished = true;
        if !self.quiet {
            println!("\r\x1b[2K{}", self.summary());
        }
    }

    fn failed(&self, error: &TorrentError) {
        let mut state = self.state();
        state.finished = true;
        eprintln!("\r\x1b[2KError: {}", error);
    }
}
