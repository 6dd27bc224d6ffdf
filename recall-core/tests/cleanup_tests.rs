//! Integration tests for maintenance and degraded-store behavior
//!
//! The wrappers below sit in front of a `MemoryStore` and inject failures
//! or latency into selected calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recall_core::cache::{CacheEntry, CacheStore, EntryState, InvalidationManager};
use recall_core::config::RetryPolicy;
use recall_core::storage::{
    CacheBackend, EntryCounts, EntryScan, MemoryStore, SessionBackend, SqliteStore, UpsertOutcome,
};
use recall_core::{RecallConfig, RecallError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HOUR: Duration = Duration::from_secs(3600);

/// Fails the first `failures` calls to `mark_invalid`, sleeps in `get_by_hash`
struct FaultyBackend {
    inner: MemoryStore,
    failures: usize,
    invalid_calls: AtomicUsize,
    lookup_delay: Duration,
}

impl FaultyBackend {
    fn failing_invalidations(inner: MemoryStore, failures: usize) -> Self {
        Self {
            inner,
            failures,
            invalid_calls: AtomicUsize::new(0),
            lookup_delay: Duration::ZERO,
        }
    }

    fn slow_lookups(inner: MemoryStore, delay: Duration) -> Self {
        Self {
            inner,
            failures: 0,
            invalid_calls: AtomicUsize::new(0),
            lookup_delay: delay,
        }
    }
}

#[async_trait]
impl CacheBackend for FaultyBackend {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn upsert_entry(&self, entry: &CacheEntry) -> Result<UpsertOutcome> {
        self.inner.upsert_entry(entry).await
    }

    async fn get_entry(&self, id: &str) -> Result<Option<CacheEntry>> {
        self.inner.get_entry(id).await
    }

    async fn get_by_hash(&self, query_hash: &str) -> Result<Option<CacheEntry>> {
        if !self.lookup_delay.is_zero() {
            tokio::time::sleep(self.lookup_delay).await;
        }
        self.inner.get_by_hash(query_hash).await
    }

    async fn record_hit(&self, id: &str, score: f32, at: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        self.inner.record_hit(id, score, at).await
    }

    async fn reverify(&self, id: &str, at: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        self.inner.reverify(id, at).await
    }

    async fn mark_stale(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize> {
        self.inner.mark_stale(ids, at).await
    }

    async fn mark_invalid(&self, ids: &[String], reason: &str, at: DateTime<Utc>) -> Result<usize> {
        let call = self.invalid_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(RecallError::TransientStore("database is locked".to_string()));
        }
        self.inner.mark_invalid(ids, reason, at).await
    }

    async fn scan_entries(&self, scan: &EntryScan) -> Result<Vec<CacheEntry>> {
        self.inner.scan_entries(scan).await
    }

    async fn entries_with_entity(&self, entity: &str) -> Result<Vec<String>> {
        self.inner.entries_with_entity(entity).await
    }

    async fn purge_invalid(&self, before: DateTime<Utc>, limit: usize) -> Result<usize> {
        self.inner.purge_invalid(before, limit).await
    }

    async fn count_entries(&self) -> Result<EntryCounts> {
        self.inner.count_entries().await
    }
}

fn fast_retry_config() -> RecallConfig {
    RecallConfig::builder()
        .retry(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        })
        .cleanup_concurrency(1)
        .build()
        .unwrap()
}

async fn manager_over(
    backend: Arc<dyn CacheBackend>,
    sessions: Arc<dyn SessionBackend>,
    config: RecallConfig,
) -> (InvalidationManager, CacheStore) {
    let cache = CacheStore::open(backend, config.clone()).await.unwrap();
    (InvalidationManager::new(cache.clone(), sessions, config), cache)
}

async fn seed_auth_entries(cache: &CacheStore) -> Vec<String> {
    let mut ids = Vec::new();
    for (i, text) in ["how are tokens signed", "where do sessions expire", "which service issues keys"]
        .iter()
        .enumerate()
    {
        let vector = vec![1.0, i as f32 + 1.0];
        let entry = CacheEntry::new("default", *text, vector, "answer", HOUR).with_entities(["auth"]);
        ids.push(cache.put(entry).await.unwrap().id);
    }
    ids.sort();
    ids
}

#[tokio::test]
async fn test_failed_batch_is_requeued() {
    let store = MemoryStore::new();
    // Exhausts the three local attempts once, then fails one more time
    let backend = Arc::new(FaultyBackend::failing_invalidations(store.clone(), 4));
    let (manager, cache) = manager_over(backend, Arc::new(store), fast_retry_config()).await;
    let ids = seed_auth_entries(&cache).await;

    let event = manager.invalidate_on_event("auth").await.unwrap();

    assert!(event.is_complete());
    let mut applied = event.ids.clone();
    applied.sort();
    assert_eq!(applied, ids);
    for id in &ids {
        assert_eq!(cache.get(id).await.unwrap().unwrap().state, EntryState::Invalid);
    }
}

#[tokio::test]
async fn test_batch_gives_up_after_max_retries() {
    let store = MemoryStore::new();
    let backend = Arc::new(FaultyBackend::failing_invalidations(store.clone(), usize::MAX));
    let (manager, cache) = manager_over(backend, Arc::new(store), fast_retry_config()).await;
    let ids = seed_auth_entries(&cache).await;

    let event = manager.invalidate_on_event("auth").await.unwrap();

    assert!(!event.is_complete());
    assert!(event.ids.is_empty());
    let mut failed = event.failed_ids.clone();
    failed.sort();
    assert_eq!(failed, ids);
    for id in &ids {
        assert_eq!(cache.get(id).await.unwrap().unwrap().state, EntryState::Fresh);
    }
}

#[tokio::test]
async fn test_slow_store_degrades_to_miss() {
    let store = MemoryStore::new();
    let backend = Arc::new(FaultyBackend::slow_lookups(store, Duration::from_secs(2)));
    let cache = CacheStore::open(backend, RecallConfig::default()).await.unwrap();
    cache
        .put(CacheEntry::new("default", "how are tokens signed", vec![1.0, 0.0], "ed25519", HOUR))
        .await
        .unwrap();

    let started = Instant::now();
    let lookup = cache.lookup("default", "how are tokens signed", &[1.0, 0.0]).await;

    assert!(!lookup.is_hit());
    assert!(lookup.is_degraded());
    assert!(started.elapsed() < Duration::from_secs(1));
    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.degraded_misses, 1);
}

#[tokio::test]
async fn test_full_cycle_on_sqlite() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let config = RecallConfig::builder()
        .invalid_retention(Duration::ZERO)
        .build()
        .unwrap();
    let (manager, cache) = manager_over(store.clone(), store, config).await;

    let mut recent = CacheEntry::new("default", "recently expired question", vec![1.0, 0.0], "a", HOUR);
    recent.last_verified_at = Utc::now() - chrono::Duration::minutes(90);
    let recent = cache.put(recent).await.unwrap().id;

    let mut ancient = CacheEntry::new("default", "long expired question", vec![0.0, 1.0], "b", HOUR);
    ancient.last_verified_at = Utc::now() - chrono::Duration::hours(3);
    let ancient = cache.put(ancient).await.unwrap().id;

    let live = cache
        .put(CacheEntry::new("default", "still fresh question", vec![1.0, 1.0], "c", HOUR))
        .await
        .unwrap()
        .id;

    let first = manager.run_cycle().await;
    assert!(first.is_clean(), "{:?}", first.errors);
    assert_eq!(first.expired, 2);
    assert_eq!(first.stale_invalidated, 1);
    assert_eq!(first.purged, 0);

    assert_eq!(cache.get(&recent).await.unwrap().unwrap().state, EntryState::Stale);
    assert_eq!(cache.get(&ancient).await.unwrap().unwrap().state, EntryState::Invalid);
    assert_eq!(cache.get(&live).await.unwrap().unwrap().state, EntryState::Fresh);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = manager.run_cycle().await;
    assert_eq!(second.expired, 0);
    assert_eq!(second.purged, 1);
    assert!(cache.get(&ancient).await.unwrap().is_none());
}

#[tokio::test]
async fn test_maintenance_loop_runs_and_stops() {
    let store = Arc::new(MemoryStore::new());
    let (manager, cache) = manager_over(store.clone(), store, RecallConfig::default()).await;

    let mut entry = CacheEntry::new("default", "an expired question here", vec![1.0, 0.0], "a", HOUR);
    entry.last_verified_at = Utc::now() - chrono::Duration::minutes(90);
    let id = cache.put(entry).await.unwrap().id;

    let handle = manager.spawn(Duration::from_millis(20));
    assert!(handle.is_running());

    let deadline = Instant::now() + Duration::from_secs(2);
    while cache.get(&id).await.unwrap().unwrap().state != EntryState::Stale {
        assert!(Instant::now() < deadline, "maintenance loop never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown().await;
}
