//! Integration tests for the semantic cache
//!
//! - Exact and semantic hits against the namespace threshold
//! - TTL expiry and re-verification
//! - Upsert idempotence and hit counting
//! - Persistence across SQLite reopen

use chrono::Utc;
use recall_core::cache::{CacheEntry, CacheLookup, CacheStore, EntryState, LookupKind};
use recall_core::storage::{MemoryStore, SqliteStore};
use recall_core::{Generation, Recall, RecallConfig};
use std::sync::Arc;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

/// Unit vector at cosine `similarity` to [1, 0]
fn at_similarity(similarity: f32) -> Vec<f32> {
    vec![similarity, (1.0 - similarity * similarity).sqrt()]
}

async fn memory_cache() -> CacheStore {
    CacheStore::open(Arc::new(MemoryStore::new()), RecallConfig::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_semantic_hit_above_threshold() {
    let cache = memory_cache().await;
    cache
        .put(CacheEntry::new("default", "how is the connection pool sized", vec![1.0, 0.0], "four connections", HOUR))
        .await
        .unwrap();

    let lookup = cache
        .lookup("default", "what size is the connection pool", &at_similarity(0.90))
        .await;

    match lookup {
        CacheLookup::Hit { entry, score, kind } => {
            assert_eq!(kind, LookupKind::Semantic);
            assert!((score - 0.90).abs() < 1e-4, "score was {score}");
            assert_eq!(entry.response_text, "four connections");
            assert_eq!(entry.hit_count, 1);
        }
        other => panic!("expected a hit, got {other:?}"),
    }
}

#[tokio::test]
async fn test_short_query_semantic_hit_keeps_cosine() {
    let cache = memory_cache().await;
    cache
        .put(CacheEntry::new("default", "connection pool size", vec![1.0, 0.0], "four connections", HOUR))
        .await
        .unwrap();

    // Two tokens, one shared; the lexical blend alone would score 0.705
    let lookup = cache.lookup("default", "pool limits", &at_similarity(0.90)).await;

    assert!(lookup.is_hit(), "short query missed: {lookup:?}");
    assert!((lookup.score().unwrap() - 0.90).abs() < 1e-4);
}

#[tokio::test]
async fn test_miss_below_threshold() {
    let cache = memory_cache().await;
    cache
        .put(CacheEntry::new("default", "how is the connection pool sized", vec![1.0, 0.0], "four connections", HOUR))
        .await
        .unwrap();

    let lookup = cache
        .lookup("default", "what does the release checklist contain", &at_similarity(0.50))
        .await;

    assert!(!lookup.is_hit());
    assert!(!lookup.is_degraded());
    assert!((lookup.score().unwrap() - 0.50).abs() < 1e-4);
}

#[tokio::test]
async fn test_namespace_threshold_override() {
    let config = RecallConfig::builder()
        .namespace_threshold("strict", 0.95)
        .build()
        .unwrap();
    let cache = CacheStore::open(Arc::new(MemoryStore::new()), config).await.unwrap();

    for namespace in ["default", "strict"] {
        cache
            .put(CacheEntry::new(namespace, "how is the connection pool sized", vec![1.0, 0.0], "four", HOUR))
            .await
            .unwrap();
    }

    let query = at_similarity(0.90);
    assert!(cache.lookup("default", "pool sizing rules for connections", &query).await.is_hit());
    assert!(!cache.lookup("strict", "pool sizing rules for connections", &query).await.is_hit());
}

#[tokio::test]
async fn test_expired_entry_excluded_until_reverified() {
    let cache = memory_cache().await;
    let mut entry = CacheEntry::new("default", "which queue backs the mailer", vec![1.0, 0.0], "redis", HOUR);
    entry.last_verified_at = Utc::now() - chrono::Duration::hours(2);
    let id = cache.put(entry).await.unwrap().id;

    assert!(!cache.lookup("default", "which queue backs the mailer", &[1.0, 0.0]).await.is_hit());
    assert!(!cache.lookup("default", "mailer queue backing store", &[1.0, 0.0]).await.is_hit());
    assert_eq!(cache.get(&id).await.unwrap().unwrap().state, EntryState::Stale);

    let refreshed = cache.reverify(&id).await.unwrap().unwrap();
    assert_eq!(refreshed.state, EntryState::Fresh);

    let lookup = cache.lookup("default", "which queue backs the mailer", &[1.0, 0.0]).await;
    assert!(lookup.is_hit());
    assert_eq!(cache.stats().await.unwrap().reverified, 1);
}

#[tokio::test]
async fn test_store_generation_is_idempotent() {
    let recall = Recall::in_memory(RecallConfig::default()).await.unwrap();
    let vector = recall.embed("where are migrations kept");

    let first = recall
        .store_generation(Generation::new("where are migrations kept", vector.clone(), "in storage/sqlite.rs"))
        .await
        .unwrap();
    let second = recall
        .store_generation(Generation::new("Where are  migrations kept", vector, "in storage/sqlite.rs"))
        .await
        .unwrap();

    assert_eq!(first, second);
    let stats = recall.cache_stats().await.unwrap();
    assert_eq!(stats.entries.total(), 1);
    let entry = recall.cache().get(&first).await.unwrap().unwrap();
    assert_eq!(entry.hit_count, 1);
}

#[tokio::test]
async fn test_hit_count_monotonic_until_invalidation() {
    let recall = Recall::in_memory(RecallConfig::default()).await.unwrap();
    let text = "what does the scheduler retry";
    let vector = recall.embed(text);
    let id = recall
        .store_generation(Generation::new(text, vector.clone(), "three times").with_entities(["scheduler"]))
        .await
        .unwrap();

    let mut last = 0;
    for _ in 0..5 {
        let lookup = recall.cache().lookup("default", text, &vector).await;
        let count = lookup.entry().unwrap().hit_count;
        assert!(count > last);
        last = count;
    }

    // A different response keeps the count
    recall
        .store_generation(Generation::new(text, vector.clone(), "five times").with_entities(["scheduler"]))
        .await
        .unwrap();
    assert_eq!(recall.cache().get(&id).await.unwrap().unwrap().hit_count, last);

    recall
        .invalidate(recall_core::InvalidationTarget::Entity("scheduler".to_string()))
        .await
        .unwrap();
    recall
        .store_generation(Generation::new(text, vector, "five times"))
        .await
        .unwrap();
    let restarted = recall.cache().get(&id).await.unwrap().unwrap();
    assert_eq!(restarted.state, EntryState::Fresh);
    assert_eq!(restarted.hit_count, 0);
}

#[tokio::test]
async fn test_dimension_mismatch_rejected() {
    let cache = memory_cache().await;
    cache
        .put(CacheEntry::new("default", "first question here", vec![1.0, 0.0], "a", HOUR))
        .await
        .unwrap();

    let err = cache
        .put(CacheEntry::new("default", "second question here", vec![1.0, 0.0, 0.0], "b", HOUR))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), recall_core::ErrorKind::PermanentValidation);

    let err = cache
        .put(CacheEntry::new("default", "third question here", vec![f32::NAN, 1.0], "c", HOUR))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), recall_core::ErrorKind::PermanentValidation);
}

#[tokio::test]
async fn test_sqlite_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recall.db");

    let id = {
        let store = Arc::new(SqliteStore::open(&path).await.unwrap());
        let cache = CacheStore::open(store.clone(), RecallConfig::default()).await.unwrap();
        let id = cache
            .put(
                CacheEntry::new("default", "how is the connection pool sized", vec![1.0, 0.0], "four", HOUR)
                    .with_entities(["db"]),
            )
            .await
            .unwrap()
            .id;
        store.close().await;
        id
    };

    let store = Arc::new(SqliteStore::open(&path).await.unwrap());
    let cache = CacheStore::open(store, RecallConfig::default()).await.unwrap();

    let lookup = cache
        .lookup("default", "what size is the connection pool", &at_similarity(0.92))
        .await;
    let entry = lookup.into_entry().expect("semantic hit after reopen");
    assert_eq!(entry.id, id);
    assert!(entry.entities.contains("db"));
    assert_eq!(entry.query_embedding, vec![1.0, 0.0]);
}
