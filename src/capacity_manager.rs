//! Capacity Manager Module
//!
//! Admission control for uploads headed to the backend. A single byte counter
//! tracks data that is staged but whose backend upload has not yet resolved;
//! an upload is only started when it fits under the configured ceiling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Decision on whether an upload may proceed to the backend
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    /// Reserve budget and upload
    Admit,
    /// Skip the backend upload
    Reject(RejectReason),
}

/// Reason for skipping a backend upload
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// The object is larger than the per-upload limit
    TooLarge { size: u64, limit: u64 },
    /// Accepting the object would push pending bytes over the ceiling
    Overloaded { size: u64, pending: u64, ceiling: u64 },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::TooLarge { size, limit } => {
                write!(f, "upload of {} bytes exceeds the {} byte limit", size, limit)
            }
            RejectReason::Overloaded {
                size,
                pending,
                ceiling,
            } => write!(
                f,
                "upload of {} bytes with {} bytes pending exceeds the {} byte ceiling",
                size, pending, ceiling
            ),
        }
    }
}

/// Decide whether an upload of `size` bytes may start
///
/// # Arguments
///
/// * `size` - Staged size of the upload
/// * `max_upload_size` - Per-upload limit, `0` disables it
/// * `pending` - Bytes currently reserved by unresolved uploads
/// * `ceiling` - Maximum bytes that may be pending at once
///
/// # Examples
///
/// ```
/// use s3_build_cache::capacity_manager::{check_admission, AdmissionDecision};
///
/// assert_eq!(check_admission(100, 0, 0, 1000), AdmissionDecision::Admit);
/// assert!(matches!(
///     check_admission(600, 0, 500, 1000),
///     AdmissionDecision::Reject(_)
/// ));
/// ```
pub fn check_admission(size: u64, max_upload_size: u64, pending: u64, ceiling: u64) -> AdmissionDecision {
    if max_upload_size > 0 && size > max_upload_size {
        return AdmissionDecision::Reject(RejectReason::TooLarge {
            size,
            limit: max_upload_size,
        });
    }

    if pending.saturating_add(size) > ceiling {
        return AdmissionDecision::Reject(RejectReason::Overloaded {
            size,
            pending,
            ceiling,
        });
    }

    AdmissionDecision::Admit
}

/// Byte budget shared by every pending upload
#[derive(Debug)]
pub struct PendingBudget {
    ceiling: u64,
    max_upload_size: u64,
    pending: Arc<AtomicU64>,
}

/// RAII reservation; returns its bytes to the budget exactly once, on drop
#[derive(Debug)]
pub struct BudgetReservation {
    bytes: u64,
    pending: Arc<AtomicU64>,
}

impl PendingBudget {
    pub fn new(ceiling: u64, max_upload_size: u64) -> Self {
        Self {
            ceiling,
            max_upload_size,
            pending: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bytes currently reserved
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Atomically check admission and reserve `size` bytes
    pub fn try_reserve(&self, size: u64) -> Result<BudgetReservation, RejectReason> {
        let mut rejection = None;
        let result = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                match check_admission(size, self.max_upload_size, pending, self.ceiling) {
                    AdmissionDecision::Admit => Some(pending + size),
                    AdmissionDecision::Reject(reason) => {
                        rejection = Some(reason);
                        None
                    }
                }
            });

        match result {
            Ok(previous) => {
                debug!(
                    "Reserved {} bytes of pending budget ({} -> {} of {})",
                    size,
                    previous,
                    previous + size,
                    self.ceiling
                );
                Ok(BudgetReservation {
                    bytes: size,
                    pending: Arc::clone(&self.pending),
                })
            }
            Err(pending) => {
                let reason = rejection.unwrap_or(RejectReason::Overloaded {
                    size,
                    pending,
                    ceiling: self.ceiling,
                });
                warn!("Upload not admitted: {}", reason);
                Err(reason)
            }
        }
    }
}

impl BudgetReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for BudgetReservation {
    fn drop(&mut self) {
        self.pending.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}
