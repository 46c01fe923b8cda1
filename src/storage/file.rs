//! Output file
//!
//! The whole torrent is written into one preallocated file at absolute
//! offsets. Writes are counted so the file is closed only once the tracker
//! reports completion and no write is still in flight.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;

/// Shared output file for one session
#[derive(Debug)]
pub struct OutputFile {
    path: PathBuf,
    length: u64,
    file: Mutex<Option<fs::File>>,
    pending_writes: AtomicUsize,
    closed: AtomicBool,
    bytes_written: AtomicUsize,
}

impl OutputFile {
    /// Create (or truncate) the file and preallocate it to `length` bytes
    pub async fn create(path: impl AsRef<Path>, length: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Creating output file {} ({} bytes)", path.display(), length);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                error!("Failed to create directory '{}': {}", parent.display(), e);
                TorrentError::disk_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
            })?;
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| {
                error!("Failed to create file '{}': {}", path.display(), e);
                TorrentError::disk_error_full("Failed to create file", path.display().to_string(), e.to_string())
            })?;

        file.set_len(length).await.map_err(|e| {
            error!("Failed to set file length for '{}': {}", path.display(), e);
            TorrentError::disk_error_full("Failed to preallocate file", path.display().to_string(), e.to_string())
        })?;

        Ok(Self {
            path,
            length,
            file: Mutex::new(Some(file)),
            pending_writes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            bytes_written: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Register a write about to be issued
    pub fn begin_write(&self) {
        self.pending_writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Register a finished write, returning how many are still pending
    pub fn end_write(&self) -> usize {
        let previous = self.pending_writes.fetch_sub(1, Ordering::SeqCst);
        previous.saturating_sub(1)
    }

    pub fn pending_writes(&self) -> usize {
        self.pending_writes.load(Ordering::SeqCst)
    }

    /// Total bytes written since creation
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed) as u64
    }

    /// Positional write of one block
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.length {
            return Err(TorrentError::disk_error_full(
                format!("Write of {} bytes at offset {} exceeds file length {}", data.len(), offset, self.length),
                self.path.display().to_string(),
                "out of bounds",
            ).into());
        }

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| {
            TorrentError::disk_error_full("Write after close", self.path.display().to_string(), "file closed")
        })?;

        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|e| {
            error!("Failed to seek to offset {} in '{}': {}", offset, self.path.display(), e);
            TorrentError::disk_error_full("Failed to seek", self.path.display().to_string(), e.to_string())
        })?;
        file.write_all(data).await.map_err(|e| {
            error!("Failed to write {} bytes at offset {} in '{}': {}", data.len(), offset, self.path.display(), e);
            TorrentError::disk_error_full("Failed to write block", self.path.display().to_string(), e.to_string())
        })?;

        self.bytes_written.fetch_add(data.len(), Ordering::Relaxed);
        trace!("Wrote {} bytes at offset {}", data.len(), offset);
        Ok(())
    }

    /// Flush and close the file
    ///
    /// Only the first call closes; later calls return `Ok(false)`.
    pub async fn close(&self) -> Result<bool> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Output file already closed");
            return Ok(false);
        }

        let Some(mut file) = self.file.lock().await.take() else {
            return Ok(false);
        };
        file.flush().await.map_err(|e| {
            TorrentError::disk_error_full("Failed to flush file", self.path.display().to_string(), e.to_string())
        })?;
        file.sync_all().await.map_err(|e| {
            error!("Failed to sync '{}': {}", self.path.display(), e);
            TorrentError::disk_error_full("Failed to sync file", self.path.display().to_string(), e.to_string())
        })?;

        info!("Closed output file {}", self.path.display());
        Ok(true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
