//! Append-only decision ledger with contradiction detection

use crate::config::{IndexConfig, RecallConfig};
use crate::decision::record::{comparable_head, DecisionFilter, DecisionRecord, DecisionStatus, SubmitOutcome};
use crate::error::{RecallError, Result};
use crate::similarity::vector::{self, cosine_similarity};
use crate::similarity::{Embedder, SimilarityIndex};
use crate::storage::{with_retry, DecisionBackend};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// A decision ranked against a query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDecision {
    pub record: DecisionRecord,
    /// Head similarity to the query, clamped to [0, 1]
    pub score: f32,
    /// Hops from this record to the current head of its chain
    pub chain_depth: usize,
}

/// Decision ledger.
///
/// Open decisions are held in a similarity index over their head embeddings.
/// A new decision that is similar enough to an open one and shares an entity
/// with it supersedes it. Chains are resolved on read, never flattened.
#[derive(Clone)]
pub struct DecisionTracker {
    backend: Arc<dyn DecisionBackend>,
    embedder: Arc<dyn Embedder>,
    open_index: Arc<RwLock<SimilarityIndex>>,
    /// Serializes supersedence writes so cycle checks see a stable ledger
    write_lock: Arc<Mutex<()>>,
    config: RecallConfig,
}

impl DecisionTracker {
    pub fn new(backend: Arc<dyn DecisionBackend>, embedder: Arc<dyn Embedder>, config: RecallConfig) -> Self {
        // Heads are compared on embeddings alone
        let index_config = IndexConfig {
            short_query_max_tokens: 0,
            sparse_vector_ratio: 0.0,
            ..config.index.clone()
        };
        Self {
            backend,
            embedder,
            open_index: Arc::new(RwLock::new(SimilarityIndex::new(index_config))),
            write_lock: Arc::new(Mutex::new(())),
            config,
        }
    }

    /// Create a tracker and index the backend's open decisions
    pub async fn open(
        backend: Arc<dyn DecisionBackend>,
        embedder: Arc<dyn Embedder>,
        config: RecallConfig,
    ) -> Result<Self> {
        let tracker = Self::new(backend, embedder, config);
        let open = tracker.retrieve_decisions(&DecisionFilter::open()).await?;

        let mut index = tracker.open_index.write().await;
        for record in &open {
            let embedding = tracker.embedding_for(record);
            if let Err(diagnostic) = index.insert(record.id.clone(), embedding) {
                warn!(decision_id = %record.id, %diagnostic, "Open decision not indexed");
            }
        }
        info!("Decision tracker ready: {} open decisions indexed", index.len());
        drop(index);

        Ok(tracker)
    }

    fn embedding_for(&self, record: &DecisionRecord) -> Vec<f32> {
        if record.head_embedding.len() == self.embedder.dimension() {
            record.head_embedding.clone()
        } else {
            self.embedder.embed(&comparable_head(&record.decision_head))
        }
    }

    /// Validate, embed and store a decision, superseding the open decision
    /// it contradicts (if any)
    pub async fn submit_decision<E, F>(&self, head: &str, entities: E, files: F) -> Result<SubmitOutcome>
    where
        E: IntoIterator,
        E::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        let mut record = DecisionRecord::new(head, entities, files)?;
        record.head_embedding = self.embedder.embed(&comparable_head(&record.decision_head));
        vector::validate(&record.head_embedding)
            .map_err(|d| RecallError::validation(format!("decision head cannot be embedded: {d}")))?;

        self.store_decision(record).await
    }

    /// Store a prepared record and run contradiction detection against it
    pub async fn store_decision(&self, mut record: DecisionRecord) -> Result<SubmitOutcome> {
        if record.head_embedding.is_empty() {
            record.head_embedding = self.embedder.embed(&comparable_head(&record.decision_head));
        }
        vector::validate(&record.head_embedding)?;

        let _guard = self.write_lock.lock().await;

        let contradicted = if record.is_open() {
            self.detect_contradiction(&record).await?
        } else {
            None
        };

        with_retry(&self.config.retry, "insert_decision", || self.backend.insert_decision(&record)).await?;

        // The record is committed from here on; a failed link leaves both open
        let superseded_previous = match contradicted {
            Some(old_id) => match self.supersede_locked(&old_id, &record.id).await {
                Ok(()) => Some(old_id),
                Err(e) => {
                    warn!(
                        decision_id = %record.id,
                        old_id = %old_id,
                        error = %e,
                        "Decision stored without superseding its contradiction"
                    );
                    None
                }
            },
            None => None,
        };

        if record.is_open() {
            if let Err(diagnostic) = self
                .open_index
                .write()
                .await
                .insert(record.id.clone(), record.head_embedding.clone())
            {
                warn!(decision_id = %record.id, %diagnostic, "Decision stored but not indexed");
            }
        }

        info!(
            decision_id = %record.id,
            superseded = ?superseded_previous,
            "Decision recorded: {}",
            record.decision_head
        );
        Ok(SubmitOutcome {
            decision_id: record.id,
            superseded_previous,
        })
    }

    /// Best-scoring open decision whose head is at least
    /// `contradiction_threshold` similar and that shares an entity
    pub async fn detect_contradiction(&self, record: &DecisionRecord) -> Result<Option<String>> {
        let embedding = self.embedding_for(record);
        let hits = self
            .open_index
            .read()
            .await
            .search(&embedding, self.config.index.search_k);

        for hit in hits
            .into_iter()
            .filter(|hit| hit.id != record.id)
            .take_while(|hit| hit.score >= self.config.contradiction_threshold)
        {
            let Some(candidate) = self.get(&hit.id).await? else {
                continue;
            };
            if candidate.is_open() && candidate.shares_entity_with(record) {
                debug!(
                    new = %record.id,
                    old = %candidate.id,
                    score = hit.score,
                    "Contradiction detected"
                );
                return Ok(Some(candidate.id));
            }
        }
        Ok(None)
    }

    /// Point `old_id` at its immediate successor `new_id`
    pub async fn mark_superseded(&self, old_id: &str, new_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.supersede_locked(old_id, new_id).await
    }

    async fn supersede_locked(&self, old_id: &str, new_id: &str) -> Result<()> {
        if old_id == new_id {
            return Err(RecallError::validation("a decision cannot supersede itself"));
        }

        let old = self.require(old_id).await?;
        self.require(new_id).await?;

        match old.status {
            DecisionStatus::Superseded if old.superseded_by.as_deref() == Some(new_id) => return Ok(()),
            DecisionStatus::Superseded => {
                return Err(RecallError::validation(format!(
                    "decision {} is already superseded by {}",
                    old_id,
                    old.superseded_by.as_deref().unwrap_or("unknown")
                )))
            }
            DecisionStatus::Closed => {
                return Err(RecallError::validation(format!("decision {} is closed", old_id)));
            }
            DecisionStatus::Open => {}
        }

        // Walking forward from the successor must not reach the old record
        let (_, path) = self.walk(new_id).await?;
        if path.iter().any(|id| id == old_id) {
            error!(old_id, new_id, "Refusing supersedence link that would close a cycle");
            return Err(RecallError::validation(format!(
                "superseding {} with {} would create a cycle",
                old_id, new_id
            )));
        }

        let now = Utc::now();
        let updated = with_retry(&self.config.retry, "set_superseded", || {
            self.backend.set_superseded(old_id, new_id, now)
        })
        .await?;
        if !updated {
            return Err(RecallError::validation(format!("decision {} is no longer open", old_id)));
        }

        self.open_index.write().await.remove(old_id);
        info!("Decision {} superseded by {}", old_id, new_id);
        Ok(())
    }

    /// Follow `superseded_by` to the current head; returns (head, hops)
    pub async fn resolve(&self, id: &str) -> Result<(DecisionRecord, usize)> {
        let (head, path) = self.walk(id).await?;
        Ok((head, path.len() - 1))
    }

    /// Walk the chain from `id`, returning the head and every visited id
    async fn walk(&self, id: &str) -> Result<(DecisionRecord, Vec<String>)> {
        let max_hops = self.config.max_supersedence_hops;
        let mut current = self.require(id).await?;
        let mut path = vec![current.id.clone()];
        let mut seen: HashSet<String> = HashSet::from([current.id.clone()]);

        while let Some(next_id) = current.superseded_by.clone() {
            if path.len() > max_hops || !seen.insert(next_id.clone()) {
                error!(start_id = id, max_hops, at = %next_id, "Supersedence chain does not terminate");
                return Err(RecallError::SupersedenceChainTooLong {
                    start_id: id.to_string(),
                    max_hops,
                });
            }
            current = self.get(&next_id).await?.ok_or_else(|| {
                RecallError::NotFound(format!("decision {} (superseded_by of {})", next_id, current.id))
            })?;
            path.push(next_id);
        }

        Ok((current, path))
    }

    /// open → closed; explicit caller action only
    pub async fn close_decision(&self, id: &str) -> Result<DecisionRecord> {
        let _guard = self.write_lock.lock().await;
        let record = self.require(id).await?;
        match record.status {
            DecisionStatus::Closed => return Ok(record),
            DecisionStatus::Superseded => {
                return Err(RecallError::validation(format!(
                    "decision {} is superseded and cannot be closed",
                    id
                )))
            }
            DecisionStatus::Open => {}
        }

        with_retry(&self.config.retry, "set_closed", || self.backend.set_closed(id)).await?;
        self.open_index.write().await.remove(id);
        info!("Decision {} closed", id);
        self.require(id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<DecisionRecord>> {
        with_retry(&self.config.retry, "get_decision", || self.backend.get_decision(id)).await
    }

    async fn require(&self, id: &str) -> Result<DecisionRecord> {
        self.get(id)
            .await?
            .ok_or_else(|| RecallError::NotFound(format!("decision {}", id)))
    }

    pub async fn retrieve_decisions(&self, filter: &DecisionFilter) -> Result<Vec<DecisionRecord>> {
        with_retry(&self.config.retry, "list_decisions", || self.backend.list_decisions(filter)).await
    }

    /// Decisions matching `filter`, ranked by head similarity to `query_text`
    pub async fn retrieve_for_text(&self, query_text: &str, filter: &DecisionFilter, k: usize) -> Result<Vec<ScoredDecision>> {
        let query = self.embedder.embed(&comparable_head(query_text));
        self.retrieve_relevant(&query, filter, k).await
    }

    /// Decisions matching `filter`, ranked by head similarity to `query`.
    /// Records scoring below `decision_min_score` are dropped.
    ///
    /// `query` must live in the embedder's space; other vectors score 0.
    pub async fn retrieve_relevant(&self, query: &[f32], filter: &DecisionFilter, k: usize) -> Result<Vec<ScoredDecision>> {
        let unbounded = DecisionFilter {
            limit: None,
            ..filter.clone()
        };
        let records = self.retrieve_decisions(&unbounded).await?;

        let mut scored: Vec<(DecisionRecord, f32)> = records
            .into_iter()
            .map(|record| {
                let score = cosine_similarity(query, &self.embedding_for(&record)).clamp(0.0, 1.0);
                (record, score)
            })
            .filter(|(_, score)| *score >= self.config.decision_min_score)
            .collect();
        scored.sort_by(|(a, a_score), (b, b_score)| {
            b_score
                .total_cmp(a_score)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(filter.limit.map_or(k, |limit| limit.min(k)));

        let mut ranked = Vec::with_capacity(scored.len());
        for (record, score) in scored {
            let chain_depth = if record.status == DecisionStatus::Superseded {
                match self.resolve(&record.id).await {
                    Ok((_, depth)) => depth,
                    Err(e) => {
                        warn!(decision_id = %record.id, error = %e, "Unresolvable supersedence chain");
                        self.config.max_supersedence_hops
                    }
                }
            } else {
                0
            };
            ranked.push(ScoredDecision {
                record,
                score,
                chain_depth,
            });
        }
        Ok(ranked)
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }
}

impl std::fmt::Debug for DecisionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionTracker")
            .field("backend", &self.backend.name())
            .field("contradiction_threshold", &self.config.contradiction_threshold)
            .field("max_supersedence_hops", &self.config.max_supersedence_hops)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::HashingEmbedder;
    use crate::storage::MemoryStore;

    fn tracker_with(config: RecallConfig) -> (DecisionTracker, MemoryStore) {
        let store = MemoryStore::new();
        let tracker = DecisionTracker::new(Arc::new(store.clone()), Arc::new(HashingEmbedder::default()), config);
        (tracker, store)
    }

    fn tracker() -> (DecisionTracker, MemoryStore) {
        tracker_with(RecallConfig::default())
    }

    #[tokio::test]
    async fn test_submit_and_retrieve_open() {
        let (tracker, _) = tracker();
        let outcome = tracker
            .submit_decision("Use Postgres for storage", ["storage"], Vec::<String>::new())
            .await
            .unwrap();
        assert!(outcome.superseded_previous.is_none());

        let found = tracker
            .retrieve_decisions(&DecisionFilter::open().entity("storage"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, outcome.decision_id);
        assert_eq!(found[0].status, DecisionStatus::Open);
    }

    #[tokio::test]
    async fn test_identical_head_with_shared_entity_supersedes() {
        let (tracker, _) = tracker();
        let first = tracker
            .submit_decision("deploy with blue green rollouts", ["deploy"], Vec::<String>::new())
            .await
            .unwrap();
        let second = tracker
            .submit_decision("Deploy with  blue green rollouts", ["deploy"], Vec::<String>::new())
            .await
            .unwrap();

        assert_eq!(second.superseded_previous.as_deref(), Some(first.decision_id.as_str()));
        let (head, depth) = tracker.resolve(&first.decision_id).await.unwrap();
        assert_eq!(head.id, second.decision_id);
        assert_eq!(depth, 1);
    }

    #[tokio::test]
    async fn test_disjoint_entities_do_not_supersede() {
        let (tracker, _) = tracker();
        tracker
            .submit_decision("deploy with blue green rollouts", ["deploy"], Vec::<String>::new())
            .await
            .unwrap();
        let second = tracker
            .submit_decision("deploy with blue green rollouts", ["billing"], Vec::<String>::new())
            .await
            .unwrap();
        assert!(second.superseded_previous.is_none());
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let (tracker, _) = tracker();
        assert!(tracker.submit_decision("   ", ["storage"], Vec::<String>::new()).await.is_err());
        assert!(tracker.submit_decision("!!!", ["storage"], Vec::<String>::new()).await.is_err());
        assert!(tracker.submit_decision("use sqlite", [""], Vec::<String>::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_superseded_validation() {
        let (tracker, _) = tracker();
        let a = tracker.submit_decision("alpha choice", ["a"], Vec::<String>::new()).await.unwrap().decision_id;
        let b = tracker.submit_decision("beta choice", ["b"], Vec::<String>::new()).await.unwrap().decision_id;
        let c = tracker.submit_decision("gamma choice", ["c"], Vec::<String>::new()).await.unwrap().decision_id;

        assert!(tracker.mark_superseded(&a, &a).await.is_err());
        assert!(matches!(
            tracker.mark_superseded(&a, "missing").await,
            Err(RecallError::NotFound(_))
        ));

        tracker.mark_superseded(&a, &b).await.unwrap();
        tracker.mark_superseded(&a, &b).await.unwrap();
        assert!(tracker.mark_superseded(&a, &c).await.is_err());

        tracker.mark_superseded(&b, &c).await.unwrap();
        let (head, depth) = tracker.resolve(&a).await.unwrap();
        assert_eq!(head.id, c);
        assert_eq!(depth, 2);
    }

    #[tokio::test]
    async fn test_cycle_is_refused() {
        let (tracker, store) = tracker();
        let mut a = DecisionRecord::new("alpha", ["x"], Vec::<String>::new()).unwrap();
        let b = DecisionRecord::new("beta", ["x"], Vec::<String>::new()).unwrap();
        a.status = DecisionStatus::Superseded;
        a.superseded_by = Some(b.id.clone());
        store.insert_decision(&a).await.unwrap();
        store.insert_decision(&b).await.unwrap();

        let err = tracker.mark_superseded(&b.id, &a.id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PermanentValidation);
    }

    #[tokio::test]
    async fn test_closed_decision_is_terminal() {
        let (tracker, _) = tracker();
        let a = tracker.submit_decision("alpha choice", ["a"], Vec::<String>::new()).await.unwrap().decision_id;
        let b = tracker.submit_decision("beta choice", ["b"], Vec::<String>::new()).await.unwrap().decision_id;

        let closed = tracker.close_decision(&a).await.unwrap();
        assert_eq!(closed.status, DecisionStatus::Closed);
        assert!(tracker.mark_superseded(&a, &b).await.is_err());
        assert_eq!(tracker.close_decision(&a).await.unwrap().status, DecisionStatus::Closed);
    }

    #[tokio::test]
    async fn test_retrieve_relevant_ranks_by_head_similarity() {
        let (tracker, _) = tracker();
        tracker
            .submit_decision("cache responses in sqlite", ["cache"], Vec::<String>::new())
            .await
            .unwrap();
        tracker
            .submit_decision("rotate api keys monthly", ["security"], Vec::<String>::new())
            .await
            .unwrap();

        let ranked = tracker
            .retrieve_for_text("where do we cache responses", &DecisionFilter::new(), 1)
            .await
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].record.decision_head, "cache responses in sqlite");
        assert_eq!(ranked[0].chain_depth, 0);

        let unrelated = tracker
            .retrieve_for_text("how many pool connections", &DecisionFilter::new(), 10)
            .await
            .unwrap();
        assert!(unrelated.is_empty());
    }

    #[tokio::test]
    async fn test_open_reindexes_existing_decisions() {
        let store = MemoryStore::new();
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
        let first = DecisionTracker::new(Arc::new(store.clone()), embedder.clone(), RecallConfig::default());
        let original = first
            .submit_decision("deploy with blue green rollouts", ["deploy"], Vec::<String>::new())
            .await
            .unwrap();

        let reopened = DecisionTracker::open(Arc::new(store), embedder, RecallConfig::default())
            .await
            .unwrap();
        let outcome = reopened
            .submit_decision("deploy with blue green rollouts", ["deploy"], Vec::<String>::new())
            .await
            .unwrap();
        assert_eq!(outcome.superseded_previous, Some(original.decision_id));
    }
}
