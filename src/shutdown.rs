//! Shutdown Module
//!
//! Idle-lifecycle control: tracks request activity, runs the idle timer,
//! listens for termination signals and publishes the shutdown decision to
//! every component.
//!
//! The decision lives in a `watch` channel holding `Option<ShutdownReason>`.
//! The first request wins; later ones are ignored. Subscribers created after
//! the decision still observe it.

use crate::{ProxyError, Result};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why the proxy is shutting down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No request arrived within the idle timeout
    Idle(Duration),
    /// `GET /shutdown`
    Requested,
    /// Termination signal (`SIGINT` or `SIGTERM`)
    Signal(&'static str),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Idle(timeout) => {
                write!(f, "no requests received for {:?}", timeout)
            }
            ShutdownReason::Requested => write!(f, "shutdown requested by client"),
            ShutdownReason::Signal(name) => write!(f, "received {}", name),
        }
    }
}

/// Shutdown coordinator for the idle lifecycle
pub struct ShutdownCoordinator {
    sender: watch::Sender<Option<ShutdownReason>>,
    last_activity: Mutex<Instant>,
    idle_timeout: Option<Duration>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator; `None` disables the idle timer
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender,
            last_activity: Mutex::new(Instant::now()),
            idle_timeout,
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Restart the idle countdown
    pub fn record_activity(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Publish a shutdown decision; returns false if one was already made
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        let mut accepted = false;
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            info!("Initiating shutdown: {}", reason);
            *current = Some(reason.clone());
            accepted = true;
            true
        });
        if !accepted {
            debug!("Shutdown already in progress, ignoring {}", reason);
        }
        accepted
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.sender.borrow().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// Get a shutdown signal for components to wait on
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Spawn the idle timer; does nothing when idle shutdown is disabled
    pub fn start_idle_timer(self: &Arc<Self>) {
        let Some(idle_timeout) = self.idle_timeout else {
            debug!("Idle shutdown disabled");
            return;
        };

        info!("Idle shutdown after {:?} without requests", idle_timeout);
        let coordinator = Arc::downgrade(self);
        let mut signal = self.subscribe();
        let handle = tokio::spawn(async move {
            run_idle_timer(coordinator, idle_timeout, &mut signal).await;
        });
        lock(&self.timers).push(handle);
    }

    /// Spawn a listener that turns SIGINT/SIGTERM into a shutdown request
    pub fn listen_for_signals(self: &Arc<Self>) -> Result<()> {
        info!("Starting shutdown signal listener");

        // Listen for SIGINT (Ctrl+C) and SIGTERM
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
            ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
        })?;
        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        let coordinator = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.request_shutdown(ShutdownReason::Signal(name));
            }
        });
        lock(&self.timers).push(handle);
        Ok(())
    }

    /// Abort the idle timer and signal listener
    pub fn cancel_timers(&self) {
        let handles: Vec<_> = lock(&self.timers).drain(..).collect();
        if !handles.is_empty() {
            debug!("Cancelling {} lifecycle tasks", handles.len());
        }
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

async fn run_idle_timer(
    coordinator: Weak<ShutdownCoordinator>,
    idle_timeout: Duration,
    signal: &mut ShutdownSignal,
) {
    loop {
        let Some(deadline) = coordinator
            .upgrade()
            .map(|c| c.last_activity() + idle_timeout)
        else {
            return;
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = signal.wait_for_shutdown() => return,
        }

        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };
        // Activity during the sleep moves the deadline; go around again.
        if Instant::now() >= coordinator.last_activity() + idle_timeout {
            coordinator.request_shutdown(ShutdownReason::Idle(idle_timeout));
            return;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shutdown signal wrapper for components
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Wait for the shutdown decision
    ///
    /// Returns `None` only if the coordinator was dropped without deciding.
    pub async fn wait_for_shutdown(&mut self) -> Option<ShutdownReason> {
        match self.receiver.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone(),
            Err(_) => {
                warn!("Shutdown coordinator dropped without a decision");
                None
            }
        }
    }
}
