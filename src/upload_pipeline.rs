//! Upload Pipeline Module
//!
//! Drives an inbound `PUT` body from the client to the backend. Admission is a
//! fast, synchronous decision; the backend upload itself always runs in a
//! detached task that owns every resource tied to the upload.
//!
//! # Admission Order
//!
//! 1. An upload of the same key is already pending: redundant, succeed at once
//! 2. Stage the body to disk and flush it
//! 3. Backend paused: discard the staged copy, cache the bytes, succeed
//! 4. Over the per-upload limit or the pending-bytes ceiling: discard, succeed
//! 5. Reserve budget, cache the bytes, start the backend upload
//!
//! In asynchronous mode the client is answered as soon as step 5 starts. In
//! synchronous mode the response waits for the upload; ignorable connectivity
//! failures still count as success.
//!
//! The detached task holds the [`UploadGuard`], the [`BudgetReservation`] and
//! the [`StagedUpload`], so the key, the budget and the staging file are each
//! released exactly once when the backend call resolves. A request timeout or
//! a dropped client connection never cancels it.

use crate::backend::{BackendError, ObjectStore};
use crate::backend_access::BackendAccessController;
use crate::capacity_manager::{BudgetReservation, PendingBudget, RejectReason};
use crate::inflight_tracker::{InFlightTracker, UploadGuard, UploadRole};
use crate::ram_cache::SharedRamCache;
use crate::staging::{StagedUpload, StagingArea};
use crate::ProxyError;
use bytes::Bytes;
use hyper::body::Body;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Successful result of handing an upload to the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// Another upload of the same key was already pending
    Redundant,
    /// Backend paused; the bytes were kept in the RAM cache only
    StoredLocally,
    /// Not admitted to the backend; the client is still told it succeeded
    Skipped(RejectReason),
    /// Backend upload started and will finish in the background
    Scheduled,
    /// Backend upload finished before responding
    Uploaded,
    /// Backend upload hit an ignorable connectivity failure before responding
    Degraded,
}

/// Failure that must be surfaced to the client
#[derive(Error, Debug, Clone)]
pub enum UploadError {
    /// Local resource failure while staging or reading back the body
    #[error("staging failed: {0}")]
    Staging(#[from] ProxyError),

    /// Non-ignorable backend failure (synchronous mode only)
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Answer the client before the backend upload resolves
    pub async_enabled: bool,
    /// Ceiling on bytes staged but not yet resolved
    pub max_pending_bytes: u64,
    /// Per-upload limit, `0` disables it
    pub max_upload_size: u64,
}

/// The write-behind upload pipeline
pub struct UploadPipeline {
    settings: UploadSettings,
    staging: StagingArea,
    tracker: InFlightTracker,
    budget: PendingBudget,
    access: Arc<BackendAccessController>,
    store: Arc<dyn ObjectStore>,
    cache: SharedRamCache,
}

impl UploadPipeline {
    pub fn new(
        settings: UploadSettings,
        staging: StagingArea,
        access: Arc<BackendAccessController>,
        store: Arc<dyn ObjectStore>,
        cache: SharedRamCache,
    ) -> Self {
        let budget = PendingBudget::new(settings.max_pending_bytes, settings.max_upload_size);
        Self {
            settings,
            staging,
            tracker: InFlightTracker::new(),
            budget,
            access,
            store,
            cache,
        }
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Bytes reserved by uploads that have not resolved yet
    pub fn pending_bytes(&self) -> u64 {
        self.budget.pending()
    }

    pub fn in_flight_count(&self) -> usize {
        self.tracker.in_flight_count()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.tracker.is_pending(key)
    }

    /// Accept an upload body for `key`
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::Staging`] when the body cannot be staged, and
    /// [`UploadError::Backend`] in synchronous mode when the backend reports a
    /// failure that is not ignorable.
    pub async fn store<B>(&self, key: &str, body: B) -> Result<UploadOutcome, UploadError>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let guard = match self.tracker.try_register(key) {
            UploadRole::Uploader(guard) => guard,
            UploadRole::Redundant => {
                debug!("Upload of {} already pending, skipping", key);
                return Ok(UploadOutcome::Redundant);
            }
        };

        let staged = self
            .staging
            .stage(key, body, self.cache.entry_limit())
            .await?;

        if self.access.is_paused() {
            debug!(
                "Backend paused, keeping {} ({} bytes) locally only",
                key,
                staged.size()
            );
            self.populate_cache(&staged);
            staged.reclaim().await;
            return Ok(UploadOutcome::StoredLocally);
        }

        let reservation = match self.budget.try_reserve(staged.size()) {
            Ok(reservation) => reservation,
            Err(reason) => {
                info!("Skipping backend upload of {}: {}", key, reason);
                staged.reclaim().await;
                return Ok(UploadOutcome::Skipped(reason));
            }
        };

        self.populate_cache(&staged);
        let completion = self.spawn_upload(guard, reservation, staged);

        if self.settings.async_enabled {
            return Ok(UploadOutcome::Scheduled);
        }

        match completion.await {
            Ok(Ok(())) => Ok(UploadOutcome::Uploaded),
            Ok(Err(UploadError::Backend(err))) if self.access.is_ignorable(&err) => {
                debug!("Hiding connectivity failure for upload of {}: {}", key, err);
                Ok(UploadOutcome::Degraded)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(UploadError::Staging(ProxyError::SystemError(
                "upload task ended without reporting a result".to_string(),
            ))),
        }
    }

    fn populate_cache(&self, staged: &StagedUpload) {
        if let Some(payload) = staged.cached_copy() {
            self.cache.put(staged.key(), payload);
        }
    }

    fn spawn_upload(
        &self,
        guard: UploadGuard,
        reservation: BudgetReservation,
        staged: StagedUpload,
    ) -> oneshot::Receiver<Result<(), UploadError>> {
        let (tx, rx) = oneshot::channel();
        let access = Arc::clone(&self.access);
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let result = upload_staged(&access, store.as_ref(), &staged).await;
            match &result {
                Ok(()) => info!(
                    "Uploaded {} ({} bytes) in {:?}",
                    guard.key(),
                    reservation.bytes(),
                    guard.elapsed()
                ),
                Err(UploadError::Backend(err)) if err.is_connectivity() => warn!(
                    "Upload of {} abandoned, backend unavailable: {}",
                    guard.key(),
                    err
                ),
                Err(err) => error!("Upload of {} failed: {}", guard.key(), err),
            }

            // Release order: staging file, then budget, then the key itself.
            staged.reclaim().await;
            drop(reservation);
            drop(guard);

            // The receiver is gone in asynchronous mode.
            let _ = tx.send(result);
        });

        rx
    }
}

async fn upload_staged(
    access: &BackendAccessController,
    store: &dyn ObjectStore,
    staged: &StagedUpload,
) -> Result<(), UploadError> {
    let data = staged.read().await?;
    access
        .call("put", || store.put_object(staged.key(), data))
        .await?;
    Ok(())
}
