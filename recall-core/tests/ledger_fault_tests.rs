//! Decision submission against a store that misbehaves after the insert
//!
//! `FaultyLedger` delegates to a `MemoryStore` and can refuse the
//! supersede transition or fail the dependent-entry scan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recall_core::cache::CacheEntry;
use recall_core::decision::{DecisionFilter, DecisionRecord, DecisionStatus, DecisionTracker};
use recall_core::storage::{
    CacheBackend, DecisionBackend, EntryCounts, EntryScan, ItemKind, MemoryStore, SessionBackend, SessionItem,
    UpsertOutcome,
};
use recall_core::{Generation, HashingEmbedder, Recall, RecallConfig, RecallError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct FaultyLedger {
    inner: MemoryStore,
    refuse_supersede: AtomicBool,
    fail_entity_scan: AtomicBool,
}

#[async_trait]
impl DecisionBackend for FaultyLedger {
    fn name(&self) -> &str {
        "faulty-ledger"
    }

    async fn insert_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.inner.insert_decision(record).await
    }

    async fn get_decision(&self, id: &str) -> Result<Option<DecisionRecord>> {
        self.inner.get_decision(id).await
    }

    async fn set_superseded(&self, old_id: &str, new_id: &str, at: DateTime<Utc>) -> Result<bool> {
        // Another writer closed the old decision first
        if self.refuse_supersede.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.set_superseded(old_id, new_id, at).await
    }

    async fn set_closed(&self, id: &str) -> Result<bool> {
        self.inner.set_closed(id).await
    }

    async fn list_decisions(&self, filter: &DecisionFilter) -> Result<Vec<DecisionRecord>> {
        self.inner.list_decisions(filter).await
    }
}

#[async_trait]
impl CacheBackend for FaultyLedger {
    fn name(&self) -> &str {
        "faulty-ledger"
    }

    async fn upsert_entry(&self, entry: &CacheEntry) -> Result<UpsertOutcome> {
        self.inner.upsert_entry(entry).await
    }

    async fn get_entry(&self, id: &str) -> Result<Option<CacheEntry>> {
        self.inner.get_entry(id).await
    }

    async fn get_by_hash(&self, query_hash: &str) -> Result<Option<CacheEntry>> {
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
        self.inner.mark_invalid(ids, reason, at).await
    }

    async fn scan_entries(&self, scan: &EntryScan) -> Result<Vec<CacheEntry>> {
        self.inner.scan_entries(scan).await
    }

    async fn entries_with_entity(&self, entity: &str) -> Result<Vec<String>> {
        if self.fail_entity_scan.load(Ordering::SeqCst) {
            return Err(RecallError::Storage("entity index unavailable".to_string()));
        }
        self.inner.entries_with_entity(entity).await
    }

    async fn purge_invalid(&self, before: DateTime<Utc>, limit: usize) -> Result<usize> {
        self.inner.purge_invalid(before, limit).await
    }

    async fn count_entries(&self) -> Result<EntryCounts> {
        self.inner.count_entries().await
    }
}

#[async_trait]
impl SessionBackend for FaultyLedger {
    fn name(&self) -> &str {
        "faulty-ledger"
    }

    async fn associate(&self, session_id: &str, kind: ItemKind, item_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.associate(session_id, kind, item_id, at).await
    }

    async fn idle_sessions(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        self.inner.idle_sessions(before, limit).await
    }

    async fn session_items(&self, session_id: &str) -> Result<Vec<SessionItem>> {
        self.inner.session_items(session_id).await
    }

    async fn release_session(&self, session_id: &str) -> Result<Vec<SessionItem>> {
        self.inner.release_session(session_id).await
    }

    async fn live_associations(&self, kind: ItemKind, item_id: &str) -> Result<usize> {
        self.inner.live_associations(kind, item_id).await
    }
}

const HEAD: &str = "deploy with blue green rollouts";

#[tokio::test]
async fn test_refused_supersede_keeps_committed_decision() {
    let ledger = Arc::new(FaultyLedger::default());
    let tracker = DecisionTracker::new(ledger.clone(), Arc::new(HashingEmbedder::default()), RecallConfig::default());

    let first = tracker.submit_decision(HEAD, ["deploy"], Vec::<String>::new()).await.unwrap();
    ledger.refuse_supersede.store(true, Ordering::SeqCst);

    let second = tracker
        .submit_decision("Deploy with blue green rollouts", ["deploy"], Vec::<String>::new())
        .await
        .unwrap();
    assert!(second.superseded_previous.is_none());

    let open = tracker.retrieve_decisions(&DecisionFilter::open()).await.unwrap();
    assert_eq!(open.len(), 2);
    assert_eq!(tracker.get(&first.decision_id).await.unwrap().unwrap().status, DecisionStatus::Open);

    // With the first closed, only the second record can match
    tracker.close_decision(&first.decision_id).await.unwrap();
    let later = DecisionRecord::new(HEAD, ["deploy"], Vec::<String>::new()).unwrap();
    let found = tracker.detect_contradiction(&later).await.unwrap();
    assert_eq!(found.as_deref(), Some(second.decision_id.as_str()));

    ledger.refuse_supersede.store(false, Ordering::SeqCst);
    let third = tracker.submit_decision(HEAD, ["deploy"], Vec::<String>::new()).await.unwrap();
    assert_eq!(third.superseded_previous.as_deref(), Some(second.decision_id.as_str()));
}

#[tokio::test]
async fn test_failed_invalidation_does_not_fail_submission() {
    let ledger = Arc::new(FaultyLedger::default());
    let recall = Recall::with_store(ledger.clone(), Arc::new(HashingEmbedder::default()), RecallConfig::default())
        .await
        .unwrap();

    let first = recall.submit_decision(HEAD, ["deploy"], Vec::<String>::new()).await.unwrap();
    let question = "how do we deploy";
    let entry_id = recall
        .store_generation(
            Generation::new(question, recall.embed(question), "blue green")
                .depends_on_decision(&first.decision_id),
        )
        .await
        .unwrap();

    ledger.fail_entity_scan.store(true, Ordering::SeqCst);
    let second = recall
        .submit_decision("Deploy with blue green rollouts", ["deploy"], Vec::<String>::new())
        .await
        .unwrap();

    assert_eq!(second.superseded_previous.as_deref(), Some(first.decision_id.as_str()));
    let (head, _) = recall.resolve_decision(&first.decision_id).await.unwrap();
    assert_eq!(head.id, second.decision_id);
    assert!(recall.cache().get(&entry_id).await.unwrap().is_some());
}
