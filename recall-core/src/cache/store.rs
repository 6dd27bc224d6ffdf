//! Semantic cache store: exact-hash fast path, similarity fallback

use crate::cache::{
    entry::{CacheEntry, EntryState},
    invalidation::InvalidationReason,
    types::{CacheLookup, CacheStats, LookupKind},
};
use crate::config::RecallConfig;
use crate::error::{RecallError, Result};
use crate::similarity::vector::{self, IndexDiagnostic};
use crate::similarity::SimilarityIndex;
use crate::storage::{with_retry, CacheBackend, EntryScan};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Persistent (query → response) cache with per-namespace similarity indexes
///
/// - Writes are upserts keyed by `query_hash`
/// - Lookups never fail: store errors and the warm-path timeout degrade to a miss
/// - Only fresh entries are held in the similarity indexes
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    indexes: Arc<RwLock<HashMap<String, SimilarityIndex>>>,
    thresholds: Arc<RwLock<HashMap<String, f32>>>,
    stats: Arc<RwLock<CacheStats>>,
    config: RecallConfig,
}

impl CacheStore {
    /// Create a store with empty indexes. See [`open`](Self::open).
    pub fn new(backend: Arc<dyn CacheBackend>, config: RecallConfig) -> Self {
        Self {
            backend,
            indexes: Arc::new(RwLock::new(HashMap::new())),
            thresholds: Arc::new(RwLock::new(config.namespace_thresholds.clone())),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            config,
        }
    }

    /// Create a store and rebuild its indexes from the backend's fresh rows
    pub async fn open(backend: Arc<dyn CacheBackend>, config: RecallConfig) -> Result<Self> {
        info!("Opening cache store on {} backend", backend.name());
        let store = Self::new(backend, config);
        store.rebuild_index().await?;
        Ok(store)
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    /// Reload every fresh entry into the similarity indexes
    pub async fn rebuild_index(&self) -> Result<usize> {
        let mut rebuilt: HashMap<String, SimilarityIndex> = HashMap::new();
        let mut after: Option<String> = None;
        let mut loaded = 0;
        let mut skipped = 0;

        loop {
            let scan = EntryScan::new(self.config.cleanup_batch_size)
                .state(EntryState::Fresh)
                .after(after.take());
            let page = with_retry(&self.config.retry, "scan_entries", || self.backend.scan_entries(&scan)).await?;

            for entry in &page {
                let index = rebuilt
                    .entry(entry.namespace.clone())
                    .or_insert_with(|| SimilarityIndex::new(self.config.index.clone()));
                match index.insert_with_text(
                    entry.id.clone(),
                    entry.query_embedding.clone(),
                    &entry.query_text,
                    entry.last_verified_at,
                ) {
                    Ok(()) => loaded += 1,
                    Err(diagnostic) => {
                        warn!(entry_id = %entry.id, %diagnostic, "Skipping entry during index rebuild");
                        skipped += 1;
                    }
                }
            }

            if page.len() < scan.limit {
                break;
            }
            after = page.last().map(|e| e.id.clone());
        }

        *self.indexes.write().await = rebuilt;
        info!("Rebuilt cache index: {} vectors ({} skipped)", loaded, skipped);
        Ok(loaded)
    }

    /// Look up a query. Exact hash first, then the namespace's similarity index.
    ///
    /// Bounded by the warm-path timeout; failures are logged and reported as
    /// a degraded miss.
    pub async fn lookup(&self, namespace: &str, query_text: &str, vector: &[f32]) -> CacheLookup {
        let timeout = self.config.warm_path_timeout();
        let result = tokio::time::timeout(timeout, self.lookup_inner(namespace, query_text, vector)).await;

        let lookup = match result {
            Ok(Ok(lookup)) => lookup,
            Ok(Err(e)) => {
                warn!(namespace, error = %e, "Cache store unavailable, treating as miss");
                CacheLookup::degraded()
            }
            Err(_) => {
                warn!(
                    namespace,
                    timeout_ms = timeout.as_millis() as u64,
                    "Cache lookup exceeded warm-path timeout, treating as miss"
                );
                CacheLookup::degraded()
            }
        };

        let mut stats = self.stats.write().await;
        match &lookup {
            CacheLookup::Hit { kind: LookupKind::Exact, .. } => stats.exact_hits += 1,
            CacheLookup::Hit { kind: LookupKind::Semantic, .. } => stats.semantic_hits += 1,
            CacheLookup::Miss { degraded, .. } => {
                stats.misses += 1;
                if *degraded {
                    stats.degraded_misses += 1;
                }
            }
        }
        lookup
    }

    async fn lookup_inner(&self, namespace: &str, query_text: &str, vector: &[f32]) -> Result<CacheLookup> {
        let now = Utc::now();
        let hash = CacheEntry::hash_query(namespace, query_text);

        let exact = with_retry(&self.config.retry, "get_by_hash", || self.backend.get_by_hash(&hash)).await?;
        if let Some(entry) = exact {
            if entry.state == EntryState::Fresh {
                if entry.is_expired_at(now) {
                    self.expire(&entry).await?;
                } else if let Some(hit) = self.register_hit(&entry.id, 1.0, now).await? {
                    debug!(entry_id = %hit.id, "Cache hit (exact)");
                    return Ok(CacheLookup::Hit {
                        entry: hit,
                        score: 1.0,
                        kind: LookupKind::Exact,
                    });
                }
            }
        }

        let threshold = self.threshold_for(namespace).await;
        let hits = {
            let indexes = self.indexes.read().await;
            match indexes.get(namespace) {
                Some(index) => index.search_text(vector, query_text, self.config.index.search_k),
                None => Vec::new(),
            }
        };
        let best_score = hits.first().map(|hit| hit.score);

        for hit in hits.into_iter().take_while(|hit| hit.score >= threshold) {
            let candidate = with_retry(&self.config.retry, "get_entry", || self.backend.get_entry(&hit.id)).await?;
            match candidate {
                Some(entry) if entry.state == EntryState::Fresh => {
                    if entry.is_expired_at(now) {
                        self.expire(&entry).await?;
                        continue;
                    }
                    if let Some(updated) = self.register_hit(&entry.id, hit.score, now).await? {
                        debug!(entry_id = %updated.id, score = hit.score, "Cache hit (semantic)");
                        return Ok(CacheLookup::Hit {
                            entry: updated,
                            score: hit.score,
                            kind: LookupKind::Semantic,
                        });
                    }
                }
                _ => self.unindex(std::slice::from_ref(&hit.id)).await,
            }
        }

        debug!(namespace, best_score = ?best_score, threshold, "Cache miss");
        Ok(CacheLookup::Miss {
            best_score,
            degraded: false,
        })
    }

    async fn register_hit(&self, id: &str, score: f32, at: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let updated = with_retry(&self.config.retry, "record_hit", || self.backend.record_hit(id, score, at)).await?;
        if let Some(entry) = &updated {
            let mut indexes = self.indexes.write().await;
            if let Some(index) = indexes.get_mut(&entry.namespace) {
                index.touch(id, at);
            }
        }
        Ok(updated)
    }

    /// Transition a fresh entry whose TTL elapsed to stale
    async fn expire(&self, entry: &CacheEntry) -> Result<()> {
        let changed = self.mark_stale(std::slice::from_ref(&entry.id)).await?;
        if changed > 0 {
            debug!("Cache entry expired: {}", entry.id);
        }
        Ok(())
    }

    /// Store a generation (upsert keyed by query hash)
    pub async fn put(&self, entry: CacheEntry) -> Result<CacheEntry> {
        vector::validate(&entry.query_embedding)?;
        if let Some(expected) = self
            .indexes
            .read()
            .await
            .get(&entry.namespace)
            .and_then(|index| index.dimension())
        {
            let got = entry.query_embedding.len();
            if expected != got {
                return Err(IndexDiagnostic::DimensionMismatch { expected, got }.into());
            }
        }

        let outcome = with_retry(&self.config.retry, "upsert_entry", || self.backend.upsert_entry(&entry)).await?;
        self.index_entry(&outcome.entry).await;
        self.stats.write().await.upserts += 1;

        if outcome.inserted {
            debug!(entry_id = %outcome.entry.id, namespace = %outcome.entry.namespace, "Inserted cache entry");
        } else {
            debug!(
                entry_id = %outcome.entry.id,
                hit_count = outcome.entry.hit_count,
                "Updated existing cache entry"
            );
        }
        Ok(outcome.entry)
    }

    pub async fn get(&self, id: &str) -> Result<Option<CacheEntry>> {
        with_retry(&self.config.retry, "get_entry", || self.backend.get_entry(id)).await
    }

    /// Refresh `last_verified_at` of a fresh entry without counting a hit
    pub async fn touch(&self, id: &str) -> Result<Option<CacheEntry>> {
        match self.get(id).await? {
            Some(entry) if entry.state == EntryState::Fresh => self.refresh(id).await,
            _ => Ok(None),
        }
    }

    /// stale → fresh after the caller confirmed the response still holds
    pub async fn reverify(&self, id: &str) -> Result<Option<CacheEntry>> {
        let before = self.get(id).await?;
        let refreshed = self.refresh(id).await?;
        if refreshed.is_some() && before.is_some_and(|e| e.state == EntryState::Stale) {
            self.stats.write().await.reverified += 1;
            info!(entry_id = %id, "Cache entry re-verified");
        }
        Ok(refreshed)
    }

    async fn refresh(&self, id: &str) -> Result<Option<CacheEntry>> {
        let now = Utc::now();
        let entry = with_retry(&self.config.retry, "reverify", || self.backend.reverify(id, now)).await?;
        if let Some(entry) = &entry {
            self.index_entry(entry).await;
        }
        Ok(entry)
    }

    /// fresh|stale → invalid for a single entry
    pub async fn invalidate(&self, id: &str, reason: &InvalidationReason) -> Result<bool> {
        Ok(self.invalidate_ids(&[id.to_string()], reason).await? > 0)
    }

    /// fresh|stale → invalid; returns the number of rows transitioned
    pub async fn invalidate_ids(&self, ids: &[String], reason: &InvalidationReason) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let reason_text = reason.to_string();
        let changed = with_retry(&self.config.retry, "mark_invalid", || {
            self.backend.mark_invalid(ids, &reason_text, now)
        })
        .await?;

        self.unindex(ids).await;
        self.stats.write().await.invalidations += changed as u64;
        if changed > 0 {
            info!("Invalidated {} cache entries ({})", changed, reason);
        }
        Ok(changed)
    }

    /// fresh → stale; returns the number of rows transitioned
    pub async fn mark_stale(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let changed = with_retry(&self.config.retry, "mark_stale", || self.backend.mark_stale(ids, now)).await?;
        self.unindex(ids).await;
        self.stats.write().await.stale_transitions += changed as u64;
        Ok(changed)
    }

    /// Invalidate every live entry matching `predicate`, page by page
    pub async fn invalidate_where<F>(&self, predicate: F, reason: &InvalidationReason) -> Result<Vec<String>>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        self.invalidate_scanned(None, predicate, reason).await
    }

    /// Invalidate every live entry in a namespace
    pub async fn invalidate_namespace(&self, namespace: &str) -> Result<Vec<String>> {
        let reason = InvalidationReason::NamespaceFlush {
            namespace: namespace.to_string(),
        };
        self.invalidate_scanned(Some(namespace), |_| true, &reason).await
    }

    /// Invalidate every live entry that depends on `entity`
    pub async fn invalidate_entity(&self, entity: &str) -> Result<Vec<String>> {
        let ids = self.dependent_ids(entity).await?;
        let reason = InvalidationReason::EntityChanged {
            entity: entity.to_string(),
        };
        for chunk in ids.chunks(self.config.cleanup_batch_size) {
            self.invalidate_ids(chunk, &reason).await?;
        }
        Ok(ids)
    }

    /// Ids of live entries that depend on `entity`
    pub async fn dependent_ids(&self, entity: &str) -> Result<Vec<String>> {
        with_retry(&self.config.retry, "entries_with_entity", || {
            self.backend.entries_with_entity(entity)
        })
        .await
    }

    async fn invalidate_scanned<F>(
        &self,
        namespace: Option<&str>,
        predicate: F,
        reason: &InvalidationReason,
    ) -> Result<Vec<String>>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut invalidated = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut scan = EntryScan::new(self.config.cleanup_batch_size)
                .state(EntryState::Fresh)
                .state(EntryState::Stale)
                .after(after.take());
            if let Some(ns) = namespace {
                scan = scan.namespace(ns);
            }

            let page = with_retry(&self.config.retry, "scan_entries", || self.backend.scan_entries(&scan)).await?;
            let ids: Vec<String> = page.iter().filter(|e| predicate(e)).map(|e| e.id.clone()).collect();
            self.invalidate_ids(&ids, reason).await?;
            invalidated.extend(ids);

            if page.len() < scan.limit {
                break;
            }
            after = page.last().map(|e| e.id.clone());
        }

        Ok(invalidated)
    }

    /// Threshold in force for a namespace
    pub async fn threshold_for(&self, namespace: &str) -> f32 {
        self.thresholds
            .read()
            .await
            .get(namespace)
            .copied()
            .unwrap_or(self.config.similarity_threshold)
    }

    /// Override the similarity threshold of one namespace
    pub async fn set_threshold(&self, namespace: &str, threshold: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(RecallError::validation(format!(
                "threshold {threshold} must be between 0.0 and 1.0"
            )));
        }
        self.thresholds.write().await.insert(namespace.to_string(), threshold);
        info!(namespace, threshold, "Similarity threshold updated");
        Ok(())
    }

    /// Counters plus row counts from the backend
    pub async fn stats(&self) -> Result<CacheStats> {
        let mut stats = self.stats.read().await.clone();
        stats.entries = with_retry(&self.config.retry, "count_entries", || self.backend.count_entries()).await?;
        stats.indexed = self.indexes.read().await.values().map(SimilarityIndex::len).sum();
        Ok(stats)
    }

    async fn index_entry(&self, entry: &CacheEntry) {
        let mut indexes = self.indexes.write().await;
        let index = indexes
            .entry(entry.namespace.clone())
            .or_insert_with(|| SimilarityIndex::new(self.config.index.clone()));
        if let Err(diagnostic) = index.insert_with_text(
            entry.id.clone(),
            entry.query_embedding.clone(),
            &entry.query_text,
            entry.last_verified_at,
        ) {
            warn!(entry_id = %entry.id, %diagnostic, "Entry stored but not indexed");
        }
    }

    pub(crate) async fn unindex(&self, ids: &[String]) {
        let mut indexes = self.indexes.write().await;
        for index in indexes.values_mut() {
            for id in ids {
                index.remove(id);
            }
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.name())
            .field("similarity_threshold", &self.config.similarity_threshold)
            .finish()
    }
}
