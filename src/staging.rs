//! Staging Module
//!
//! Provides durable temporary storage for upload bodies between receipt from the
//! client and handoff to the backend. Each upload streams into its own
//! `<uuid>.upload.tmp` file which is flushed before the write counts as staged
//! and removed exactly once when the owning [`StagedUpload`] is dropped.

use crate::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::Body;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

const STAGING_SUFFIX: &str = ".upload.tmp";

/// Directory holding staged upload bodies
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

/// A fully flushed upload body on disk
///
/// Owns the staging file: dropping the value removes it.
#[derive(Debug)]
pub struct StagedUpload {
    key: String,
    path: PathBuf,
    size: u64,
    /// In-memory copy, kept only while the body stays small enough to cache
    memory: Option<Bytes>,
    reclaimed: bool,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the staging directory and purge anything left by a previous run
    ///
    /// Leftover files cannot be trusted to represent a complete, acknowledged
    /// write, so they are removed rather than replayed.
    pub async fn initialize(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            error!(
                "Failed to create staging directory: path={:?}, error={}",
                self.dir, e
            );
            ProxyError::StagingError(format!("Failed to create staging directory: {}", e))
        })?;

        let removed = self.purge().await?;
        if removed > 0 {
            info!(
                "Purged {} leftover staging files from {:?}",
                removed, self.dir
            );
        }
        Ok(removed)
    }

    /// Remove every staging file in the directory, returning how many were removed
    pub async fn purge(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(ProxyError::StagingError(format!(
                    "Failed to read staging directory {:?}: {}",
                    self.dir, e
                )))
            }
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_staging_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(STAGING_SUFFIX))
                .unwrap_or(false);
            if !is_staging_file {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed staging file: {:?}", path);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove staging file: path={:?}, error={}", path, e),
            }
        }
        Ok(removed)
    }

    /// Stream `body` into a new staging file and flush it to disk
    ///
    /// A copy of the body is also kept in memory as long as it stays below
    /// `memory_limit` bytes, so the caller can populate the RAM cache without
    /// reading the file back.
    ///
    /// # Errors
    ///
    /// Returns `StagingError` when the file cannot be created, written or
    /// flushed, and `HttpError` when the body stream fails. The partial file is
    /// removed in both cases.
    pub async fn stage<B>(&self, key: &str, mut body: B, memory_limit: u64) -> Result<StagedUpload>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let path = self
            .dir
            .join(format!("{}{}", uuid::Uuid::new_v4(), STAGING_SUFFIX));

        let mut file = File::create(&path).await.map_err(|e| {
            error!(
                "Failed to create staging file: key={}, path={:?}, error={}",
                key, path, e
            );
            ProxyError::StagingError(format!("Failed to create staging file: {}", e))
        })?;

        // From here on, dropping `staged` removes the file.
        let mut staged = StagedUpload {
            key: key.to_string(),
            path,
            size: 0,
            memory: None,
            reclaimed: false,
        };
        let mut memory = Some(BytesMut::new());

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| {
                warn!("Upload body failed while staging: key={}, error={}", key, e);
                ProxyError::HttpError(format!("Failed to read request body: {}", e))
            })?;
            let Ok(data) = frame.into_data() else {
                continue;
            };

            file.write_all(&data).await.map_err(|e| {
                error!(
                    "Failed to write staging file: key={}, path={:?}, error={}",
                    key, staged.path, e
                );
                ProxyError::StagingError(format!("Failed to write staging file: {}", e))
            })?;
            staged.size += data.len() as u64;

            if staged.size >= memory_limit {
                memory = None;
            } else if let Some(buffer) = memory.as_mut() {
                buffer.extend_from_slice(&data);
            }
        }

        file.flush().await?;
        file.sync_all().await.map_err(|e| {
            error!(
                "Failed to sync staging file: key={}, path={:?}, error={}",
                key, staged.path, e
            );
            ProxyError::StagingError(format!("Failed to sync staging file: {}", e))
        })?;
        drop(file);

        staged.memory = memory.map(BytesMut::freeze);
        debug!(
            "Staged upload: key={}, path={:?}, size={}",
            key, staged.path, staged.size
        );
        Ok(staged)
    }
}

impl StagedUpload {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// In-memory copy of the body, if it was small enough to keep
    pub fn cached_copy(&self) -> Option<Bytes> {
        self.memory.clone()
    }

    /// Read the staged body back from disk
    pub async fn read(&self) -> Result<Bytes> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            error!(
                "Failed to read staging file: key={}, path={:?}, error={}",
                self.key, self.path, e
            );
            ProxyError::StagingError(format!("Failed to read staging file: {}", e))
        })?;
        Ok(Bytes::from(data))
    }

    /// Remove the staging file without blocking the runtime
    pub async fn reclaim(mut self) {
        self.reclaimed = true;
        remove_logged(tokio::fs::remove_file(&self.path).await, &self.path);
    }
}

fn remove_logged(result: std::io::Result<()>, path: &Path) {
    match result {
        Ok(()) => debug!("Reclaimed staging file: {:?}", path),
        // Purged already by shutdown.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staging file: path={:?}, error={}", path, e),
    }
}

impl Drop for StagedUpload {
    // Fallback for error and cancellation paths. A single small unlink, so
    // the blocking call on a runtime thread is tolerated.
    fn drop(&mut self) {
        if self.reclaimed {
            return;
        }
        remove_logged(std::fs::remove_file(&self.path), &self.path);
    }
}
