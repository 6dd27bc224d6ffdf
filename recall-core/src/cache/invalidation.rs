//! Background and event-driven invalidation
//!
//! - TTL sweep: fresh entries past TTL become stale, stale entries past the
//!   grace period become invalid
//! - Session scoping: idle sessions release their entries, orphans are invalidated
//! - Event-driven: entity changes, decision supersedence, namespace flushes
//! - Threshold re-score: fresh entries below a new threshold become stale
//!
//! Work runs in bounded batches under its own concurrency cap so maintenance
//! never starves the read path. A failed batch is re-queued a bounded number
//! of times; what still fails is reported, not raised.

use crate::cache::entry::{CacheEntry, EntryState};
use crate::cache::store::CacheStore;
use crate::config::RecallConfig;
use crate::decision::DecisionRecord;
use crate::error::Result;
use crate::storage::{with_retry, EntryScan, ItemKind, SessionBackend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Reason for cache invalidation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum InvalidationReason {
    /// TTL elapsed since last verification (fresh → stale)
    Expired,

    /// Stale entry was not re-verified within the grace period
    StaleGraceElapsed,

    /// Manual invalidation by id
    Manual,

    /// An upstream entity or file changed
    EntityChanged { entity: String },

    /// A decision the entry depended on was superseded
    DecisionSuperseded { decision_id: String },

    /// Bulk flush of a namespace
    NamespaceFlush { namespace: String },

    /// The last session referencing the entry went idle
    Orphaned { session_id: String },

    /// Re-score after a threshold change (fresh → stale)
    BelowThreshold { threshold: f32 },

    /// Caller-supplied predicate
    Predicate,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "TTL expired"),
            InvalidationReason::StaleGraceElapsed => write!(f, "stale grace period elapsed"),
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::EntityChanged { entity } => write!(f, "entity changed: {}", entity),
            InvalidationReason::DecisionSuperseded { decision_id } => {
                write!(f, "decision superseded: {}", decision_id)
            }
            InvalidationReason::NamespaceFlush { namespace } => write!(f, "namespace flushed: {}", namespace),
            InvalidationReason::Orphaned { session_id } => write!(f, "orphaned by idle session: {}", session_id),
            InvalidationReason::BelowThreshold { threshold } => {
                write!(f, "match score below threshold {:.2}", threshold)
            }
            InvalidationReason::Predicate => write!(f, "predicate match"),
        }
    }
}

/// Record of one invalidation action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Entry ids the action was applied to
    pub ids: Vec<String>,

    /// Ids whose batch still failed after re-queues
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_ids: Vec<String>,
}

impl InvalidationEvent {
    pub fn new(reason: InvalidationReason, ids: Vec<String>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            ids,
            failed_ids: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.failed_ids.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_ids.is_empty()
    }
}

/// Summary of one maintenance cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// fresh → stale on TTL
    pub expired: usize,
    /// stale → invalid after the grace period
    pub stale_invalidated: usize,
    pub sessions_released: usize,
    pub orphaned: usize,
    pub purged: usize,
    pub batches: usize,
    pub retried_batches: usize,
    pub failed_batches: usize,
    pub errors: Vec<String>,
    pub events: Vec<InvalidationEvent>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed_batches == 0 && self.errors.is_empty()
    }

    fn absorb(&mut self, outcome: &BatchOutcome) {
        self.batches += outcome.batches;
        self.retried_batches += outcome.retried;
        self.failed_batches += outcome.failed;
        self.errors.extend(outcome.errors.iter().cloned());
    }

    fn phase_failed(&mut self, phase: &str, error: impl std::fmt::Display) {
        warn!(phase, error = %error, "Cleanup phase skipped");
        self.errors.push(format!("{phase}: {error}"));
    }
}

impl std::fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "expired {}, stale invalidated {}, sessions released {}, orphaned {}, purged {} \
             ({} batches, {} retried, {} failed) in {}ms",
            self.expired,
            self.stale_invalidated,
            self.sessions_released,
            self.orphaned,
            self.purged,
            self.batches,
            self.retried_batches,
            self.failed_batches,
            self.duration_ms
        )
    }
}

#[derive(Debug, Clone)]
enum BatchAction {
    Stale,
    Invalidate(InvalidationReason),
}

#[derive(Debug, Default)]
struct BatchOutcome {
    affected: usize,
    applied_ids: Vec<String>,
    failed_ids: Vec<String>,
    batches: usize,
    retried: usize,
    failed: usize,
    errors: Vec<String>,
}

/// Runs TTL sweeps, session cleanup and event-driven invalidation
#[derive(Clone)]
pub struct InvalidationManager {
    cache: CacheStore,
    sessions: Arc<dyn SessionBackend>,
    config: RecallConfig,
    limiter: Arc<Semaphore>,
}

impl InvalidationManager {
    pub fn new(cache: CacheStore, sessions: Arc<dyn SessionBackend>, config: RecallConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.cleanup_concurrency.max(1)));
        Self {
            cache,
            sessions,
            config,
            limiter,
        }
    }

    /// One full maintenance pass. Phase failures are recorded in the report.
    pub async fn run_cycle(&self) -> CleanupReport {
        let started = Instant::now();
        let now = Utc::now();
        let mut report = CleanupReport {
            started_at: Some(now),
            ..CleanupReport::default()
        };

        // 1. fresh past TTL → stale
        match self.collect_batches(None, &[EntryState::Fresh], |e| e.is_expired_at(now)).await {
            Ok(batches) => {
                let outcome = self.run_batches(batches, BatchAction::Stale).await;
                report.expired = outcome.affected;
                report.absorb(&outcome);
                push_event(&mut report.events, InvalidationReason::Expired, outcome);
            }
            Err(e) => report.phase_failed("expire", e),
        }

        // 2. stale past TTL + grace → invalid
        let grace = chrono::Duration::seconds(self.config.stale_grace_secs as i64);
        match self
            .collect_batches(None, &[EntryState::Stale], |e| now > e.expires_at() + grace)
            .await
        {
            Ok(batches) => {
                let outcome = self
                    .run_batches(batches, BatchAction::Invalidate(InvalidationReason::StaleGraceElapsed))
                    .await;
                report.stale_invalidated = outcome.affected;
                report.absorb(&outcome);
                push_event(&mut report.events, InvalidationReason::StaleGraceElapsed, outcome);
            }
            Err(e) => report.phase_failed("stale_grace", e),
        }

        // 3. idle sessions release their items; orphaned entries → invalid
        let idle_before = now - chrono::Duration::seconds(self.config.session_idle_timeout_secs as i64);
        if let Err(e) = self.release_idle_sessions(idle_before, &mut report).await {
            report.phase_failed("sessions", e);
        }

        // 4. purge invalid rows past retention
        let retention_before = now - chrono::Duration::seconds(self.config.invalid_retention_secs as i64);
        match self.purge(retention_before).await {
            Ok(purged) => report.purged = purged,
            Err(e) => report.phase_failed("purge", e),
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        if report.is_clean() {
            info!("Cleanup cycle complete: {}", report);
        } else {
            warn!(errors = report.errors.len(), "Cleanup cycle finished with failures: {}", report);
        }
        report
    }

    async fn release_idle_sessions(&self, idle_before: DateTime<Utc>, report: &mut CleanupReport) -> Result<()> {
        loop {
            let idle = with_retry(&self.config.retry, "idle_sessions", || {
                self.sessions.idle_sessions(idle_before, self.config.cleanup_batch_size)
            })
            .await?;
            if idle.is_empty() {
                return Ok(());
            }

            for session_id in &idle {
                let event = self.cleanup_session(session_id).await?;
                report.sessions_released += 1;
                report.orphaned += event.ids.len();
                if !event.failed_ids.is_empty() {
                    report.failed_batches += 1;
                    report.errors.push(format!(
                        "session {}: {} orphaned entries not invalidated",
                        session_id,
                        event.failed_ids.len()
                    ));
                }
                if !event.is_empty() {
                    report.events.push(event);
                }
            }

            if idle.len() < self.config.cleanup_batch_size {
                return Ok(());
            }
        }
    }

    /// Release a session's associations and invalidate cache entries no
    /// other session still references
    pub async fn cleanup_session(&self, session_id: &str) -> Result<InvalidationEvent> {
        let released = with_retry(&self.config.retry, "release_session", || {
            self.sessions.release_session(session_id)
        })
        .await?;

        let mut orphans = Vec::new();
        for item in released.iter().filter(|item| item.kind == ItemKind::Cache) {
            let live = with_retry(&self.config.retry, "live_associations", || {
                self.sessions.live_associations(ItemKind::Cache, &item.item_id)
            })
            .await?;
            if live == 0 {
                orphans.push(item.item_id.clone());
            }
        }

        let reason = InvalidationReason::Orphaned {
            session_id: session_id.to_string(),
        };
        let outcome = self
            .run_batches(self.chunk(orphans), BatchAction::Invalidate(reason.clone()))
            .await;
        debug!(
            session_id,
            released = released.len(),
            orphaned = outcome.affected,
            "Session released"
        );
        Ok(event_from(reason, outcome))
    }

    /// Bulk-invalidate entries depending on a changed upstream entity or file
    pub async fn invalidate_on_event(&self, entity_id: &str) -> Result<InvalidationEvent> {
        let ids = self.cache.dependent_ids(entity_id).await?;
        let reason = InvalidationReason::EntityChanged {
            entity: entity_id.to_string(),
        };
        let outcome = self.run_batches(self.chunk(ids), BatchAction::Invalidate(reason.clone())).await;
        info!(entity = entity_id, invalidated = outcome.affected, "Entity change processed");
        Ok(event_from(reason, outcome))
    }

    /// Invalidate entries tied to a superseded decision: shared entities or
    /// an explicit `decision:<id>` dependency
    pub async fn on_decision_superseded(&self, old: &DecisionRecord) -> Result<InvalidationEvent> {
        let mut ids = BTreeSet::new();
        for entity in old.entities.iter().cloned().chain([format!("decision:{}", old.id)]) {
            ids.extend(self.cache.dependent_ids(&entity).await?);
        }

        let reason = InvalidationReason::DecisionSuperseded {
            decision_id: old.id.clone(),
        };
        let outcome = self
            .run_batches(self.chunk(ids.into_iter().collect()), BatchAction::Invalidate(reason.clone()))
            .await;
        info!(
            decision_id = %old.id,
            invalidated = outcome.affected,
            "Supersedence invalidation processed"
        );
        Ok(event_from(reason, outcome))
    }

    /// Invalidate every live entry of a namespace
    pub async fn invalidate_namespace(&self, namespace: &str) -> Result<InvalidationEvent> {
        let batches = self
            .collect_batches(Some(namespace), &[EntryState::Fresh, EntryState::Stale], |_| true)
            .await?;
        let reason = InvalidationReason::NamespaceFlush {
            namespace: namespace.to_string(),
        };
        let outcome = self.run_batches(batches, BatchAction::Invalidate(reason.clone())).await;
        info!(namespace, invalidated = outcome.affected, "Namespace flushed");
        Ok(event_from(reason, outcome))
    }

    /// Change a namespace threshold, then mark fresh entries whose recorded
    /// match score falls below it as stale. Vectors are not re-embedded.
    pub async fn update_threshold(&self, namespace: &str, threshold: f32) -> Result<InvalidationEvent> {
        self.cache.set_threshold(namespace, threshold).await?;

        let batches = self
            .collect_batches(Some(namespace), &[EntryState::Fresh], |e| e.match_score < threshold)
            .await?;
        let reason = InvalidationReason::BelowThreshold { threshold };
        let outcome = self.run_batches(batches, BatchAction::Stale).await;
        info!(namespace, threshold, rescored = outcome.affected, "Threshold re-score complete");
        Ok(event_from(reason, outcome))
    }

    /// Start the periodic maintenance loop
    pub fn spawn(&self, interval: Duration) -> MaintenanceHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = self.clone();

        info!("Starting maintenance task (interval: {:?})", interval);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let report = manager.run_cycle().await;
                        if !report.is_clean() {
                            warn!("Maintenance cycle reported {} failed batches", report.failed_batches);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Maintenance task stopped");
        });

        MaintenanceHandle { shutdown_tx, task }
    }

    fn chunk(&self, ids: Vec<String>) -> Vec<Vec<String>> {
        ids.chunks(self.config.cleanup_batch_size.max(1))
            .map(<[String]>::to_vec)
            .collect()
    }

    /// Scan live rows page by page and group matching ids into batches
    async fn collect_batches<F>(
        &self,
        namespace: Option<&str>,
        states: &[EntryState],
        predicate: F,
    ) -> Result<Vec<Vec<String>>>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let backend = self.cache.backend();
        let batch_size = self.config.cleanup_batch_size.max(1);
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut scan = EntryScan::new(batch_size).after(after.take());
            scan.states = states.to_vec();
            if let Some(ns) = namespace {
                scan = scan.namespace(ns);
            }

            let page = with_retry(&self.config.retry, "scan_entries", || backend.scan_entries(&scan)).await?;
            for entry in page.iter().filter(|e| predicate(e)) {
                current.push(entry.id.clone());
                if current.len() == batch_size {
                    batches.push(std::mem::take(&mut current));
                }
            }

            if page.len() < batch_size {
                break;
            }
            after = page.last().map(|e| e.id.clone());
        }

        if !current.is_empty() {
            batches.push(current);
        }
        Ok(batches)
    }

    /// Apply an action to batches under the cleanup concurrency cap.
    /// Failed batches are re-queued up to `max_batch_retries` times.
    async fn run_batches(&self, batches: Vec<Vec<String>>, action: BatchAction) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut pending: VecDeque<(Vec<String>, u32)> = batches.into_iter().map(|b| (b, 0)).collect();

        while !pending.is_empty() {
            let mut tasks = JoinSet::new();
            for (batch, attempt) in pending.drain(..) {
                let cache = self.cache.clone();
                let limiter = self.limiter.clone();
                let action = action.clone();
                tasks.spawn(async move {
                    let _permit = limiter.acquire_owned().await.ok();
                    let result = match &action {
                        BatchAction::Stale => cache.mark_stale(&batch).await,
                        BatchAction::Invalidate(reason) => cache.invalidate_ids(&batch, reason).await,
                    };
                    (batch, attempt, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((batch, _, Ok(affected))) => {
                        outcome.batches += 1;
                        outcome.affected += affected;
                        outcome.applied_ids.extend(batch);
                    }
                    Ok((batch, attempt, Err(e))) if attempt < self.config.max_batch_retries => {
                        warn!(
                            attempt = attempt + 1,
                            size = batch.len(),
                            error = %e,
                            "Cleanup batch failed, re-queueing"
                        );
                        outcome.retried += 1;
                        pending.push_back((batch, attempt + 1));
                    }
                    Ok((batch, _, Err(e))) => {
                        error!(size = batch.len(), error = %e, "Cleanup batch failed after retries");
                        outcome.batches += 1;
                        outcome.failed += 1;
                        outcome.errors.push(e.to_string());
                        outcome.failed_ids.extend(batch);
                    }
                    Err(join_error) => {
                        error!("Cleanup batch task panicked: {}", join_error);
                        outcome.batches += 1;
                        outcome.failed += 1;
                        outcome.errors.push(join_error.to_string());
                    }
                }
            }
        }

        outcome
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<usize> {
        let backend = self.cache.backend();
        let limit = self.config.cleanup_batch_size.max(1);
        let mut purged = 0;
        loop {
            let removed = with_retry(&self.config.retry, "purge_invalid", || {
                backend.purge_invalid(before, limit)
            })
            .await?;
            purged += removed;
            if removed < limit {
                break;
            }
        }
        if purged > 0 {
            info!("Purged {} invalid cache rows", purged);
        }
        Ok(purged)
    }
}

impl std::fmt::Debug for InvalidationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationManager")
            .field("batch_size", &self.config.cleanup_batch_size)
            .field("concurrency", &self.config.cleanup_concurrency)
            .finish()
    }
}

fn event_from(reason: InvalidationReason, outcome: BatchOutcome) -> InvalidationEvent {
    let mut event = InvalidationEvent::new(reason, outcome.applied_ids);
    event.failed_ids = outcome.failed_ids;
    event
}

fn push_event(events: &mut Vec<InvalidationEvent>, reason: InvalidationReason, outcome: BatchOutcome) {
    let event = event_from(reason, outcome);
    if !event.is_empty() {
        events.push(event);
    }
}

/// Handle to the background maintenance task
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the loop to stop and wait for it. A cycle in progress finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Maintenance task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CacheBackend, MemoryStore};

    fn setup(config: RecallConfig) -> (InvalidationManager, CacheStore, MemoryStore) {
        let backend = MemoryStore::new();
        let cache = CacheStore::new(Arc::new(backend.clone()), config.clone());
        let manager = InvalidationManager::new(cache.clone(), Arc::new(backend.clone()), config);
        (manager, cache, backend)
    }

    fn entry(text: &str) -> CacheEntry {
        CacheEntry::new("default", text, vec![1.0, 0.0], "answer", Duration::from_secs(60))
    }

    #[test]
    fn test_invalidation_reason_display() {
        assert_eq!(InvalidationReason::Expired.to_string(), "TTL expired");
        let reason = InvalidationReason::EntityChanged {
            entity: "src/db.rs".to_string(),
        };
        assert!(reason.to_string().contains("src/db.rs"));
    }

    #[tokio::test]
    async fn test_cycle_expires_then_invalidates() {
        let config = RecallConfig {
            stale_grace_secs: 60,
            ..RecallConfig::default()
        };
        let (manager, cache, backend) = setup(config);

        let mut old = entry("old question");
        old.last_verified_at = Utc::now() - chrono::Duration::seconds(90);
        let mut ancient = entry("ancient question");
        ancient.last_verified_at = Utc::now() - chrono::Duration::seconds(600);
        let live = cache.put(entry("live question")).await.unwrap();
        backend.upsert_entry(&old).await.unwrap();
        backend.upsert_entry(&ancient).await.unwrap();

        let report = manager.run_cycle().await;
        assert!(report.is_clean());
        assert_eq!(report.expired, 2);
        assert_eq!(report.stale_invalidated, 1);
        assert_eq!(backend.get_entry(&live.id).await.unwrap().unwrap().state, EntryState::Fresh);
        assert_eq!(backend.get_entry(&old.id).await.unwrap().unwrap().state, EntryState::Stale);
        assert_eq!(backend.get_entry(&ancient.id).await.unwrap().unwrap().state, EntryState::Invalid);

        let report = manager.run_cycle().await;
        assert_eq!(report.expired, 0);
        assert_eq!(report.stale_invalidated, 0);
        assert_eq!(backend.get_entry(&old.id).await.unwrap().unwrap().state, EntryState::Stale);
    }

    #[tokio::test]
    async fn test_entity_event_invalidates_dependents() {
        let (manager, cache, backend) = setup(RecallConfig::default());
        let dependent = cache
            .put(entry("how is the pool configured").with_entities(["src/db.rs"]))
            .await
            .unwrap();
        let other = cache.put(entry("what is the retry policy")).await.unwrap();

        let event = manager.invalidate_on_event("src/db.rs").await.unwrap();
        assert_eq!(event.ids, vec![dependent.id.clone()]);
        assert!(event.is_complete());
        assert_eq!(backend.get_entry(&dependent.id).await.unwrap().unwrap().state, EntryState::Invalid);
        assert_eq!(backend.get_entry(&other.id).await.unwrap().unwrap().state, EntryState::Fresh);
    }

    #[tokio::test]
    async fn test_threshold_rescore_marks_low_scores_stale() {
        let (manager, cache, backend) = setup(RecallConfig::default());
        let exact = cache.put(entry("exact question")).await.unwrap();
        let fuzzy = cache.put(entry("fuzzy question")).await.unwrap();
        backend.record_hit(&fuzzy.id, 0.87, Utc::now()).await.unwrap();

        let event = manager.update_threshold("default", 0.9).await.unwrap();
        assert_eq!(event.ids, vec![fuzzy.id.clone()]);
        assert_eq!(cache.threshold_for("default").await, 0.9);
        assert_eq!(backend.get_entry(&fuzzy.id).await.unwrap().unwrap().state, EntryState::Stale);
        assert_eq!(backend.get_entry(&exact.id).await.unwrap().unwrap().state, EntryState::Fresh);
    }

    #[tokio::test]
    async fn test_idle_session_orphans_entries() {
        let (manager, cache, backend) = setup(RecallConfig::default());
        let shared = cache.put(entry("shared question")).await.unwrap();
        let private = cache.put(entry("private question")).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::days(2);

        backend.associate("idle", ItemKind::Cache, &shared.id, long_ago).await.unwrap();
        backend.associate("idle", ItemKind::Cache, &private.id, long_ago).await.unwrap();
        backend.associate("active", ItemKind::Cache, &shared.id, Utc::now()).await.unwrap();

        let report = manager.run_cycle().await;
        assert_eq!(report.sessions_released, 1);
        assert_eq!(report.orphaned, 1);
        assert_eq!(backend.get_entry(&private.id).await.unwrap().unwrap().state, EntryState::Invalid);
        assert_eq!(backend.get_entry(&shared.id).await.unwrap().unwrap().state, EntryState::Fresh);
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let (manager, _, _) = setup(RecallConfig::default());
        let handle = manager.spawn(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.is_running());
        handle.shutdown().await;
    }
}
