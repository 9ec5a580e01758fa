//! In-process object store
//!
//! A [`ObjectStore`] backed by a concurrent map, with switches for simulating
//! an unreachable backend, backend rejections and slow uploads. Every operation
//! is counted, so callers can assert whether the backend was contacted.

use crate::backend::{BackendError, BackendResult, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{watch, Notify};
use tracing::debug;

/// Per-operation call counters
#[derive(Debug, Default)]
struct CallCounts {
    get: AtomicUsize,
    head: AtomicUsize,
    put: AtomicUsize,
    delete: AtomicUsize,
}

pub struct MemoryStore {
    objects: DashMap<String, Bytes>,
    unreachable: AtomicBool,
    rejection: Mutex<Option<(u16, String)>>,
    /// Uploads wait while this is `true`
    hold_puts: watch::Sender<bool>,
    stored: Notify,
    calls: CallCounts,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (hold_puts, _) = watch::channel(false);
        Self {
            objects: DashMap::new(),
            unreachable: AtomicBool::new(false),
            rejection: Mutex::new(None),
            hold_puts,
            stored: Notify::new(),
            calls: CallCounts::default(),
        }
    }

    /// Seed an object without counting a call
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.objects.insert(key.to_string(), data.into());
        self.stored.notify_waiters();
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Make every operation fail as if the network were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make every operation fail with the given status and error code
    pub fn set_rejection(&self, rejection: Option<(u16, &str)>) {
        *self.lock_rejection() = rejection.map(|(status, code)| (status, code.to_string()));
    }

    /// Park uploads until [`release_puts`](Self::release_puts) is called
    pub fn hold_puts(&self) {
        self.hold_puts.send_replace(true);
    }

    pub fn release_puts(&self) {
        self.hold_puts.send_replace(false);
    }

    /// Wait until `key` has been stored
    pub async fn wait_for_object(&self, key: &str) {
        loop {
            let notified = self.stored.notified();
            if self.objects.contains_key(key) {
                return;
            }
            notified.await;
        }
    }

    pub fn get_calls(&self) -> usize {
        self.calls.get.load(Ordering::SeqCst)
    }

    pub fn head_calls(&self) -> usize {
        self.calls.head.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.calls.put.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.calls.delete.load(Ordering::SeqCst)
    }

    /// Total calls across all operations
    pub fn total_calls(&self) -> usize {
        self.get_calls() + self.head_calls() + self.put_calls() + self.delete_calls()
    }

    fn check_faults(&self, key: &str) -> BackendResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable(format!(
                "connection refused while accessing {}",
                key
            )));
        }
        if let Some((status, code)) = self.lock_rejection().clone() {
            return Err(BackendError::Rejected {
                status,
                message: format!("{} rejected by test backend", key),
                code,
            });
        }
        Ok(())
    }

    fn lock_rejection(&self) -> std::sync::MutexGuard<'_, Option<(u16, String)>> {
        self.rejection.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_object(&self, key: &str) -> BackendResult<Bytes> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        self.check_faults(key)?;
        self.object(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn head_object(&self, key: &str) -> BackendResult<u64> {
        self.calls.head.fetch_add(1, Ordering::SeqCst);
        self.check_faults(key)?;
        self.objects
            .get(key)
            .map(|entry| entry.value().len() as u64)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn put_object(&self, key: &str, data: Bytes) -> BackendResult<()> {
        self.calls.put.fetch_add(1, Ordering::SeqCst);

        let mut hold = self.hold_puts.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = hold.wait_for(|held| !*held).await;

        self.check_faults(key)?;
        debug!("MemoryStore stored {} ({} bytes)", key, data.len());
        self.insert(key, data);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.check_faults(key)?;
        // S3 deletes are idempotent.
        self.objects.remove(key);
        Ok(())
    }
}
