//! The `Recall` facade: one place that wires storage, cache, decisions,
//! invalidation and orchestration together

use crate::cache::{CacheEntry, CacheStats, CacheStore, CleanupReport, InvalidationEvent, InvalidationManager, MaintenanceHandle};
use crate::config::{RecallConfig, DEFAULT_NAMESPACE};
use crate::decision::{DecisionFilter, DecisionRecord, DecisionTracker, SubmitOutcome};
use crate::error::Result;
use crate::merge::CandidateSource;
use crate::orchestrator::{ContextOrchestrator, ContextProvider, ContextQuery, ContextResponse, FetchOptions};
use crate::similarity::{Embedder, HashingEmbedder};
use crate::storage::{CacheBackend, DecisionBackend, ItemKind, MemoryStore, SessionBackend, SqliteStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A generation to cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub query_text: String,
    pub query_vector: Vec<f32>,
    pub response_text: String,
    pub namespace: String,
    /// Defaults to `ttl_seconds` from the config
    pub ttl: Option<Duration>,
    pub entities: BTreeSet<String>,
    pub session_id: Option<String>,
}

impl Generation {
    pub fn new(query_text: impl Into<String>, query_vector: Vec<f32>, response_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            query_vector,
            response_text: response_text.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: None,
            entities: BTreeSet::new(),
            session_id: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities.extend(entities.into_iter().map(Into::into));
        self
    }

    /// Depend on a decision; superseding it invalidates this generation
    pub fn depends_on_decision(self, decision_id: &str) -> Self {
        self.with_entities([format!("decision:{}", decision_id)])
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// What `invalidate` should target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum InvalidationTarget {
    Namespace(String),
    Entity(String),
}

/// Decision-aware semantic cache and context merger
#[derive(Clone)]
pub struct Recall {
    config: RecallConfig,
    cache: CacheStore,
    decisions: DecisionTracker,
    invalidation: InvalidationManager,
    orchestrator: ContextOrchestrator,
    sessions: Arc<dyn SessionBackend>,
    embedder: Arc<dyn Embedder>,
}

impl Recall {
    /// Wire every component over one store
    pub async fn with_store<S>(store: Arc<S>, embedder: Arc<dyn Embedder>, config: RecallConfig) -> Result<Self>
    where
        S: CacheBackend + DecisionBackend + SessionBackend + 'static,
    {
        config.validate()?;

        let cache_backend: Arc<dyn CacheBackend> = store.clone();
        let decision_backend: Arc<dyn DecisionBackend> = store.clone();
        let sessions: Arc<dyn SessionBackend> = store;

        let cache = CacheStore::open(cache_backend.clone(), config.clone()).await?;
        let decisions = DecisionTracker::open(decision_backend, embedder.clone(), config.clone()).await?;
        let invalidation = InvalidationManager::new(cache.clone(), sessions.clone(), config.clone());
        let orchestrator = ContextOrchestrator::new(cache.clone(), decisions.clone(), config.clone());

        info!(backend = cache_backend.name(), "Recall initialized");
        Ok(Self {
            config,
            cache,
            decisions,
            invalidation,
            orchestrator,
            sessions,
            embedder,
        })
    }

    /// SQLite-backed instance with the hashing embedder
    pub async fn open_sqlite(path: impl AsRef<Path>, config: RecallConfig) -> Result<Self> {
        let store = SqliteStore::open(path).await?;
        Self::with_store(Arc::new(store), Arc::new(HashingEmbedder::default()), config).await
    }

    /// Volatile instance, for tests and embedding in short-lived processes
    pub async fn in_memory(config: RecallConfig) -> Result<Self> {
        Self::with_store(Arc::new(MemoryStore::new()), Arc::new(HashingEmbedder::default()), config).await
    }

    pub async fn fetch_context(&self, query: ContextQuery, options: &FetchOptions) -> Result<ContextResponse> {
        let session_id = query.session_id.clone();
        let response = self.orchestrator.fetch_context(query, options).await?;

        if let Some(session_id) = session_id {
            let cache_items = response
                .candidates
                .iter()
                .filter(|c| c.source == CandidateSource::Cache)
                .map(|c| (ItemKind::Cache, c.origin_id.as_str()));
            let decision_items = response.decisions.iter().map(|d| (ItemKind::Decision, d.id.as_str()));
            for (kind, item_id) in cache_items.chain(decision_items) {
                self.associate(&session_id, kind, item_id).await;
            }
        }

        Ok(response)
    }

    /// Cache a generation; returns the id of the (possibly pre-existing) row
    pub async fn store_generation(&self, generation: Generation) -> Result<String> {
        let ttl = self
            .config
            .ttl_with_jitter(generation.ttl.unwrap_or_else(|| self.config.ttl()));
        let entry = CacheEntry::new(
            &generation.namespace,
            &generation.query_text,
            generation.query_vector,
            generation.response_text,
            ttl,
        )
        .with_entities(generation.entities);

        let stored = self.cache.put(entry).await?;
        if let Some(session_id) = &generation.session_id {
            self.associate(session_id, ItemKind::Cache, &stored.id).await;
        }
        Ok(stored.id)
    }

    async fn associate(&self, session_id: &str, kind: ItemKind, item_id: &str) {
        if let Err(e) = self.sessions.associate(session_id, kind, item_id, Utc::now()).await {
            warn!(session_id, item_id, error = %e, "Session association not recorded");
        }
    }

    /// Record a decision; a superseded predecessor invalidates the cache
    /// entries that depended on it
    pub async fn submit_decision<E, F>(&self, head: &str, entities: E, files: F) -> Result<SubmitOutcome>
    where
        E: IntoIterator,
        E::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        let outcome = self.decisions.submit_decision(head, entities, files).await?;
        if let Some(old_id) = &outcome.superseded_previous {
            // The decision is already committed; failures here are only logged
            if let Err(e) = self.invalidate_superseded(old_id).await {
                warn!(
                    decision_id = %old_id,
                    error = %e,
                    "Dependent cache entries of a superseded decision were not invalidated"
                );
            }
        }
        Ok(outcome)
    }

    async fn invalidate_superseded(&self, old_id: &str) -> Result<()> {
        let Some(old) = self.decisions.get(old_id).await? else {
            return Ok(());
        };
        let event = self.invalidation.on_decision_superseded(&old).await?;
        if !event.is_complete() {
            warn!(
                decision_id = %old_id,
                failed = event.failed_ids.len(),
                "Some dependent cache entries were not invalidated"
            );
        }
        Ok(())
    }

    pub async fn invalidate(&self, target: InvalidationTarget) -> Result<InvalidationEvent> {
        match target {
            InvalidationTarget::Namespace(namespace) => self.invalidation.invalidate_namespace(&namespace).await,
            InvalidationTarget::Entity(entity) => self.invalidation.invalidate_on_event(&entity).await,
        }
    }

    pub async fn run_cleanup(&self) -> CleanupReport {
        self.invalidation.run_cycle().await
    }

    pub async fn cleanup_session(&self, session_id: &str) -> Result<InvalidationEvent> {
        self.invalidation.cleanup_session(session_id).await
    }

    pub async fn retrieve_decisions(&self, filter: &DecisionFilter) -> Result<Vec<DecisionRecord>> {
        self.decisions.retrieve_decisions(filter).await
    }

    /// Current head of the chain containing `id`, and its distance
    pub async fn resolve_decision(&self, id: &str) -> Result<(DecisionRecord, usize)> {
        self.decisions.resolve(id).await
    }

    pub async fn close_decision(&self, id: &str) -> Result<DecisionRecord> {
        self.decisions.close_decision(id).await
    }

    /// stale → fresh after the caller confirmed the response is still valid
    pub async fn reverify(&self, entry_id: &str) -> Result<Option<CacheEntry>> {
        self.cache.reverify(entry_id).await
    }

    /// Change a namespace threshold and re-score its fresh entries
    pub async fn set_threshold(&self, namespace: &str, threshold: f32) -> Result<InvalidationEvent> {
        self.invalidation.update_threshold(namespace, threshold).await
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats().await
    }

    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        self.invalidation.spawn(self.config.cleanup_interval())
    }

    pub async fn register_provider(&self, provider: Arc<dyn ContextProvider>) -> Result<()> {
        self.orchestrator.register_provider(provider).await
    }

    /// Embed text with the configured embedder
    pub fn embed(&self, text: &str) -> Vec<f32> {
        self.embedder.embed(text)
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn decisions(&self) -> &DecisionTracker {
        &self.decisions
    }

    pub fn invalidation(&self) -> &InvalidationManager {
        &self.invalidation
    }

    pub fn orchestrator(&self) -> &ContextOrchestrator {
        &self.orchestrator
    }
}

impl std::fmt::Debug for Recall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recall")
            .field("decisions", &self.decisions)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}
