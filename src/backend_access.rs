//! Backend access controller.
//!
//! Every backend call goes through [`BackendAccessController::call`], which
//! short-circuits while access is paused and classifies each outcome to drive a
//! consecutive-failure counter.
//!
//! # State Machine
//!
//! ```text
//! Active --[errors_before_pausing consecutive connectivity failures]--> Paused
//! Paused --[pause_duration elapsed]--> Active (counter reset)
//! ```
//!
//! While paused, calls return [`BackendError::Paused`] without contacting the
//! backend. The pause deadline is fixed when the pause begins; failures reported
//! by calls that were already in flight do not extend it.
//!
//! # Thread Safety
//!
//! The counter and deadline live behind one `Mutex`, so the
//! increment-then-threshold-check is a single critical section. The lock is
//! never held across an `.await`.

use crate::backend::{BackendError, BackendResult};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Offline-degradation policy.
#[derive(Debug, Clone)]
pub struct OfflinePolicy {
    /// Hide connectivity failures from clients and allow pausing.
    pub allow_offline: bool,
    /// Consecutive connectivity failures that trip the pause (0 disables pausing).
    pub errors_before_pausing: u32,
    /// How long backend access stays paused.
    pub pause_duration: Duration,
    /// Count backend rejections toward pausing as well as connectivity failures.
    pub count_rejections: bool,
}

impl Default for OfflinePolicy {
    fn default() -> Self {
        Self {
            allow_offline: true,
            errors_before_pausing: 2,
            pause_duration: Duration::from_secs(60),
            count_rejections: false,
        }
    }
}

/// Snapshot of the controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAccessState {
    pub consecutive_failures: u32,
    pub paused: bool,
    pub pause_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct AccessInner {
    consecutive_failures: u32,
    pause_until: Option<Instant>,
}

impl AccessInner {
    /// Clear an elapsed pause; returns whether still paused.
    fn refresh(&mut self, now: Instant) -> bool {
        match self.pause_until {
            Some(until) if now >= until => {
                self.pause_until = None;
                self.consecutive_failures = 0;
                info!("Backend pause elapsed, resuming backend access");
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// Backend access controller implementing offline degradation and circuit breaking.
pub struct BackendAccessController {
    policy: OfflinePolicy,
    inner: Mutex<AccessInner>,
}

impl std::fmt::Debug for BackendAccessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendAccessController")
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish()
    }
}

impl BackendAccessController {
    pub fn new(policy: OfflinePolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(AccessInner::default()),
        }
    }

    pub fn policy(&self) -> &OfflinePolicy {
        &self.policy
    }

    /// Whether backend calls are currently short-circuited.
    pub fn is_paused(&self) -> bool {
        let mut inner = self.lock();
        inner.refresh(Instant::now())
    }

    pub fn state(&self) -> BackendAccessState {
        let mut inner = self.lock();
        let paused = inner.refresh(Instant::now());
        BackendAccessState {
            consecutive_failures: inner.consecutive_failures,
            paused,
            pause_until: inner.pause_until,
        }
    }

    /// Whether a failure may be replaced by a success-shaped response.
    ///
    /// Only connectivity failures qualify, and only when offline operation is allowed.
    pub fn is_ignorable(&self, error: &BackendError) -> bool {
        self.policy.allow_offline && error.is_connectivity()
    }

    /// Run a backend operation through the controller.
    ///
    /// While paused, returns [`BackendError::Paused`] without invoking `operation`.
    pub async fn call<T, F, Fut>(&self, operation: &str, f: F) -> BackendResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        if self.is_paused() {
            debug!("Skipping backend {}: access paused", operation);
            return Err(BackendError::Paused);
        }

        let result = f().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) => self.record_failure(operation, err),
        }
        result
    }

    /// A completed round trip resets the failure counter.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
    }

    /// Classify a failure and update the counter, pausing at the threshold.
    pub fn record_failure(&self, operation: &str, error: &BackendError) {
        let counts = match error {
            BackendError::Unreachable(_) => true,
            BackendError::Rejected { .. } => self.policy.count_rejections,
            // Synthetic while paused; an authoritative not-found is a successful round trip.
            BackendError::Paused | BackendError::NotFound(_) => false,
        };

        let mut inner = self.lock();
        if !counts {
            if !matches!(error, BackendError::Paused) {
                inner.consecutive_failures = 0;
            }
            return;
        }

        let now = Instant::now();
        if inner.refresh(now) {
            return;
        }

        inner.consecutive_failures += 1;
        warn!(
            "Backend {} failed ({} consecutive): {}",
            operation, inner.consecutive_failures, error
        );

        if self.pausing_enabled() && inner.consecutive_failures >= self.policy.errors_before_pausing {
            inner.pause_until = Some(now + self.policy.pause_duration);
            warn!(
                "Pausing backend access for {:?} after {} consecutive failures",
                self.policy.pause_duration, inner.consecutive_failures
            );
        }
    }

    fn pausing_enabled(&self) -> bool {
        self.policy.allow_offline
            && self.policy.errors_before_pausing > 0
            && !self.policy.pause_duration.is_zero()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AccessInner> {
        // The state is two integers; a panic elsewhere cannot leave it inconsistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(errors: u32, pause: Duration) -> OfflinePolicy {
        OfflinePolicy {
            allow_offline: true,
            errors_before_pausing: errors,
            pause_duration: pause,
            count_rejections: false,
        }
    }

    fn unreachable() -> BackendResult<()> {
        Err(BackendError::Unreachable("connection refused".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_pauses_after_threshold() {
        let controller = BackendAccessController::new(policy(2, Duration::from_secs(60)));

        let _ = controller.call("get", || async { unreachable() }).await;
        assert!(!controller.is_paused());
        let _ = controller.call("get", || async { unreachable() }).await;
        assert!(controller.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_calls_do_not_reach_backend() {
        let controller = BackendAccessController::new(policy(1, Duration::from_secs(60)));
        let _ = controller.call("get", || async { unreachable() }).await;

        let calls = AtomicUsize::new(0);
        let result = controller
            .call("get", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(result, Err(BackendError::Paused));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_expires_and_resets_counter() {
        let controller = BackendAccessController::new(policy(1, Duration::from_secs(60)));
        let _ = controller.call("put", || async { unreachable() }).await;
        assert!(controller.is_paused());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(controller.is_paused());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!controller.is_paused());
        assert_eq!(controller.state().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let controller = BackendAccessController::new(policy(2, Duration::from_secs(60)));
        let _ = controller.call("get", || async { unreachable() }).await;
        let _ = controller.call("get", || async { Ok(()) }).await;
        let _ = controller.call("get", || async { unreachable() }).await;

        assert!(!controller.is_paused());
        assert_eq!(controller.state().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_counts_as_round_trip() {
        let controller = BackendAccessController::new(policy(2, Duration::from_secs(60)));
        let _ = controller.call("get", || async { unreachable() }).await;
        let result: BackendResult<()> = controller
            .call("get", || async { Err(BackendError::NotFound("k".into())) })
            .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(controller.state().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_only_count_when_configured() {
        let rejected = || async {
            Err::<(), _>(BackendError::Rejected {
                status: 403,
                code: "AccessDenied".into(),
                message: "denied".into(),
            })
        };

        let lenient = BackendAccessController::new(policy(1, Duration::from_secs(60)));
        let _ = lenient.call("delete", rejected).await;
        assert!(!lenient.is_paused());

        let strict = BackendAccessController::new(OfflinePolicy {
            count_rejections: true,
            ..policy(1, Duration::from_secs(60))
        });
        let _ = strict.call("delete", rejected).await;
        assert!(strict.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_does_not_extend_pause() {
        let controller = BackendAccessController::new(policy(1, Duration::from_secs(60)));
        controller.record_failure("get", &BackendError::Unreachable("x".into()));
        let first_deadline = controller.state().pause_until;

        tokio::time::advance(Duration::from_secs(30)).await;
        controller.record_failure("get", &BackendError::Unreachable("x".into()));
        assert_eq!(controller.state().pause_until, first_deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_pauses_without_offline_mode() {
        let controller = BackendAccessController::new(OfflinePolicy {
            allow_offline: false,
            ..policy(1, Duration::from_secs(60))
        });
        let _ = controller.call("get", || async { unreachable() }).await;
        let _ = controller.call("get", || async { unreachable() }).await;
        assert!(!controller.is_paused());
        assert!(!controller.is_ignorable(&BackendError::Unreachable("x".into())));
    }

    #[test]
    fn test_ignorable_only_for_connectivity() {
        let controller = BackendAccessController::new(OfflinePolicy::default());
        assert!(controller.is_ignorable(&BackendError::Unreachable("x".into())));
        assert!(controller.is_ignorable(&BackendError::Paused));
        assert!(!controller.is_ignorable(&BackendError::NotFound("k".into())));
        assert!(!controller.is_ignorable(&BackendError::Rejected {
            status: 400,
            code: "InvalidRequest".into(),
            message: "bad".into()
        }));
    }
}
