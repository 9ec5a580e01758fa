//! In-flight upload tracker for per-key de-duplication.
//!
//! Content-addressed keys mean two uploads of the same key carry the same bytes,
//! so a second `PUT` arriving while the first is still pending is redundant. The
//! tracker lets exactly one upload own a key until its backend call resolves.
//!
//! # Lifecycle
//!
//! 1. The first request for a key registers and receives an [`UploadGuard`]
//! 2. Later requests for the same key see [`UploadRole::Redundant`]
//! 3. Dropping the guard (resolution, rejection, cancellation or panic) frees the key

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks keys whose upload is currently pending.
///
/// Uses a `DashMap` for concurrent access from multiple Tokio tasks. Each entry
/// maps a key to the instant its upload was admitted.
pub struct InFlightTracker {
    pending: Arc<DashMap<String, Instant>>,
}

/// Role assigned to an upload after registration.
pub enum UploadRole {
    /// First upload for this key - responsible for driving it to the backend.
    Uploader(UploadGuard),
    /// Another upload of this key is already pending.
    Redundant,
}

/// RAII guard that owns a key's in-flight slot and frees it on drop.
pub struct UploadGuard {
    key: String,
    started: Instant,
    pending: Arc<DashMap<String, Instant>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Attempts to claim the in-flight slot for `key`.
    ///
    /// The check and the insert happen under one map entry lock, so two
    /// concurrent callers can never both become the uploader.
    pub fn try_register(&self, key: &str) -> UploadRole {
        match self.pending.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let started = Instant::now();
                vacant.insert(started);
                UploadRole::Uploader(UploadGuard {
                    key: key.to_string(),
                    started,
                    pending: Arc::clone(&self.pending),
                })
            }
            dashmap::mapref::entry::Entry::Occupied(_) => UploadRole::Redundant,
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Returns the number of uploads currently pending.
    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Time since the upload was admitted
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}
