//! Upload pipeline admission and resource accounting
//!
//! Exercises per-key de-duplication under concurrency, the pending-bytes
//! ceiling, and reclamation of staging files and budget once uploads resolve.

use bytes::Bytes;
use http_body_util::Full;
use s3_build_cache::backend_access::{BackendAccessController, OfflinePolicy};
use s3_build_cache::capacity_manager::RejectReason;
use s3_build_cache::memory_store::MemoryStore;
use s3_build_cache::ram_cache::{RamCache, SharedRamCache};
use s3_build_cache::staging::StagingArea;
use s3_build_cache::upload_pipeline::{UploadOutcome, UploadPipeline, UploadSettings};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct TestPipeline {
    pipeline: Arc<UploadPipeline>,
    store: Arc<MemoryStore>,
    cache: SharedRamCache,
    temp_dir: TempDir,
}

async fn create_pipeline(settings: UploadSettings) -> TestPipeline {
    let temp_dir = TempDir::new().unwrap();
    let staging = StagingArea::new(temp_dir.path());
    staging.initialize().await.unwrap();

    let store = Arc::new(MemoryStore::new());
    let access = Arc::new(BackendAccessController::new(OfflinePolicy::default()));
    let cache = SharedRamCache::new(RamCache::new(true, 1_000_000, 50_000_000));
    let pipeline = Arc::new(UploadPipeline::new(
        settings,
        staging,
        access,
        store.clone(),
        cache.clone(),
    ));

    TestPipeline {
        pipeline,
        store,
        cache,
        temp_dir,
    }
}

fn async_settings(max_pending_bytes: u64) -> UploadSettings {
    UploadSettings {
        async_enabled: true,
        max_pending_bytes,
        max_upload_size: 0,
    }
}

fn body(data: &[u8]) -> Full<Bytes> {
    Full::new(Bytes::copy_from_slice(data))
}

fn staged_files(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).unwrap().count()
}

async fn wait_until_idle(pipeline: &UploadPipeline) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.in_flight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("uploads did not resolve");
}

#[tokio::test]
async fn test_concurrent_puts_of_same_key_upload_once() {
    let t = create_pipeline(async_settings(1_000_000)).await;
    t.store.hold_puts();

    let first = {
        let pipeline = Arc::clone(&t.pipeline);
        tokio::spawn(async move { pipeline.store("cas/same", body(b"artifact")).await })
    };
    let second = {
        let pipeline = Arc::clone(&t.pipeline);
        tokio::spawn(async move { pipeline.store("cas/same", body(b"artifact")).await })
    };

    let mut outcomes = vec![
        first.await.unwrap().unwrap(),
        second.await.unwrap().unwrap(),
    ];
    outcomes.sort_by_key(|o| matches!(o, UploadOutcome::Redundant));
    assert_eq!(outcomes, vec![UploadOutcome::Scheduled, UploadOutcome::Redundant]);

    t.store.release_puts();
    t.store.wait_for_object("cas/same").await;
    wait_until_idle(&t.pipeline).await;

    assert_eq!(t.store.put_calls(), 1);
    assert_eq!(t.store.object("cas/same"), Some(Bytes::from_static(b"artifact")));
}

#[tokio::test]
async fn test_same_key_uploads_again_after_resolution() {
    let t = create_pipeline(async_settings(1_000_000)).await;

    t.pipeline.store("ac/k", body(b"one")).await.unwrap();
    t.store.wait_for_object("ac/k").await;
    wait_until_idle(&t.pipeline).await;

    let outcome = t.pipeline.store("ac/k", body(b"two")).await.unwrap();
    assert_eq!(outcome, UploadOutcome::Scheduled);
    wait_until_idle(&t.pipeline).await;
    assert_eq!(t.store.put_calls(), 2);
    assert_eq!(t.store.object("ac/k"), Some(Bytes::from_static(b"two")));
}

#[tokio::test]
async fn test_put_over_pending_ceiling_never_reaches_backend() {
    let t = create_pipeline(async_settings(10)).await;

    let outcome = t
        .pipeline
        .store("cas/large", body(&[0u8; 64]))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        UploadOutcome::Skipped(RejectReason::Overloaded { .. })
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(t.store.put_calls(), 0);
    assert_eq!(t.pipeline.pending_bytes(), 0);
    assert_eq!(staged_files(&t.temp_dir), 0);
}

#[tokio::test]
async fn test_pending_budget_is_shared_between_uploads() {
    let t = create_pipeline(async_settings(10)).await;
    t.store.hold_puts();

    let first = t.pipeline.store("cas/a", body(&[1u8; 6])).await.unwrap();
    let second = t.pipeline.store("cas/b", body(&[2u8; 6])).await.unwrap();

    assert_eq!(first, UploadOutcome::Scheduled);
    assert!(matches!(second, UploadOutcome::Skipped(_)));
    assert_eq!(t.pipeline.pending_bytes(), 6);

    t.store.release_puts();
    wait_until_idle(&t.pipeline).await;
    assert_eq!(t.pipeline.pending_bytes(), 0);

    // Budget is back; the same size is admitted now.
    let third = t.pipeline.store("cas/b", body(&[2u8; 6])).await.unwrap();
    assert_eq!(third, UploadOutcome::Scheduled);
}

#[tokio::test]
async fn test_per_upload_limit() {
    let t = create_pipeline(UploadSettings {
        async_enabled: false,
        max_pending_bytes: 1_000_000,
        max_upload_size: 8,
    })
    .await;

    let small = t.pipeline.store("ac/small", body(b"tiny")).await.unwrap();
    let large = t.pipeline.store("ac/large", body(b"too large for it")).await.unwrap();

    assert_eq!(small, UploadOutcome::Uploaded);
    assert!(matches!(large, UploadOutcome::Skipped(RejectReason::TooLarge { .. })));
    assert_eq!(t.store.put_calls(), 1);
}

#[tokio::test]
async fn test_staging_files_reclaimed_after_async_upload() {
    let t = create_pipeline(async_settings(1_000_000)).await;
    t.store.hold_puts();

    t.pipeline.store("ac/s", body(b"staged")).await.unwrap();
    assert_eq!(staged_files(&t.temp_dir), 1);
    assert_eq!(t.cache.get("ac/s"), Some(Bytes::from_static(b"staged")));

    t.store.release_puts();
    wait_until_idle(&t.pipeline).await;
    assert_eq!(staged_files(&t.temp_dir), 0);
}

#[tokio::test]
async fn test_failed_async_upload_releases_resources() {
    let t = create_pipeline(async_settings(1_000_000)).await;
    t.store.set_rejection(Some((403, "AccessDenied")));

    let outcome = t.pipeline.store("ac/f", body(b"denied")).await.unwrap();
    assert_eq!(outcome, UploadOutcome::Scheduled);

    wait_until_idle(&t.pipeline).await;
    assert_eq!(t.pipeline.pending_bytes(), 0);
    assert_eq!(staged_files(&t.temp_dir), 0);
    assert!(!t.pipeline.is_pending("ac/f"));
}
