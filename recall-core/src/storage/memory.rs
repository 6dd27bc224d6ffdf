//! In-process backend over tokio `RwLock` maps

use super::{
    CacheBackend, DecisionBackend, EntryCounts, EntryScan, HealthCheckResult, HealthStatus, ItemKind,
    SessionBackend, SessionItem, UpsertOutcome,
};
use crate::cache::{CacheEntry, EntryState};
use crate::decision::{DecisionFilter, DecisionRecord, DecisionStatus};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct MemoryState {
    /// id -> entry, ordered for keyset scans
    entries: BTreeMap<String, CacheEntry>,
    /// query_hash -> id
    by_hash: HashMap<String, String>,
    decisions: HashMap<String, DecisionRecord>,
    /// (session_id, kind, item_id) -> last_activity
    sessions: BTreeMap<(String, ItemKind, String), DateTime<Utc>>,
}

/// Ephemeral backend with the same contracts as the SQLite store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn health_check(&self) -> HealthCheckResult {
        let _guard = self.state.read().await;
        HealthCheckResult {
            status: HealthStatus::Healthy,
            response_time_ms: 0,
            error: None,
            checked_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheBackend for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert_entry(&self, entry: &CacheEntry) -> Result<UpsertOutcome> {
        let mut state = self.state.write().await;

        let existing_id = state.by_hash.get(&entry.query_hash).cloned();
        if let Some(id) = existing_id {
            if let Some(stored) = state.entries.get_mut(&id) {
                stored.absorb(entry);
                debug!("Upserted existing cache row: {}", id);
                return Ok(UpsertOutcome {
                    entry: stored.clone(),
                    inserted: false,
                });
            }
        }

        state.by_hash.insert(entry.query_hash.clone(), entry.id.clone());
        state.entries.insert(entry.id.clone(), entry.clone());
        Ok(UpsertOutcome {
            entry: entry.clone(),
            inserted: true,
        })
    }

    async fn get_entry(&self, id: &str) -> Result<Option<CacheEntry>> {
        Ok(self.state.read().await.entries.get(id).cloned())
    }

    async fn get_by_hash(&self, query_hash: &str) -> Result<Option<CacheEntry>> {
        let state = self.state.read().await;
        Ok(state
            .by_hash
            .get(query_hash)
            .and_then(|id| state.entries.get(id))
            .cloned())
    }

    async fn record_hit(&self, id: &str, score: f32, at: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let mut state = self.state.write().await;
        match state.entries.get_mut(id) {
            Some(entry) if entry.state == EntryState::Fresh => {
                entry.mark_hit(score, at);
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn reverify(&self, id: &str, at: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let mut state = self.state.write().await;
        match state.entries.get_mut(id) {
            Some(entry) if entry.state != EntryState::Invalid => {
                entry.state = EntryState::Fresh;
                entry.last_verified_at = at;
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_stale(&self, ids: &[String], _at: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for id in ids {
            if let Some(entry) = state.entries.get_mut(id) {
                if entry.state == EntryState::Fresh {
                    entry.state = EntryState::Stale;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn mark_invalid(&self, ids: &[String], reason: &str, at: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for id in ids {
            if let Some(entry) = state.entries.get_mut(id) {
                if entry.state != EntryState::Invalid {
                    entry.state = EntryState::Invalid;
                    entry.invalidated_at = Some(at);
                    entry.invalidation_reason = Some(reason.to_string());
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn scan_entries(&self, scan: &EntryScan) -> Result<Vec<CacheEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|entry| scan.matches(entry))
            .take(scan.limit)
            .cloned()
            .collect())
    }

    async fn entries_with_entity(&self, entity: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|e| e.state != EntryState::Invalid && e.has_entity(entity))
            .map(|e| e.id.clone())
            .collect())
    }

    async fn purge_invalid(&self, before: DateTime<Utc>, limit: usize) -> Result<usize> {
        let mut state = self.state.write().await;
        let doomed: Vec<(String, String)> = state
            .entries
            .values()
            .filter(|e| e.state == EntryState::Invalid && e.invalidated_at.map_or(true, |at| at < before))
            .take(limit)
            .map(|e| (e.id.clone(), e.query_hash.clone()))
            .collect();

        for (id, hash) in &doomed {
            state.entries.remove(id);
            if state.by_hash.get(hash) == Some(id) {
                state.by_hash.remove(hash);
            }
        }
        Ok(doomed.len())
    }

    async fn count_entries(&self) -> Result<EntryCounts> {
        let state = self.state.read().await;
        let mut counts = EntryCounts::default();
        for entry in state.entries.values() {
            match entry.state {
                EntryState::Fresh => counts.fresh += 1,
                EntryState::Stale => counts.stale += 1,
                EntryState::Invalid => counts.invalid += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl DecisionBackend for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_decision(&self, record: &DecisionRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if state.decisions.contains_key(&record.id) {
            return Err(crate::error::RecallError::validation(format!(
                "decision {} already exists",
                record.id
            )));
        }
        state.decisions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_decision(&self, id: &str) -> Result<Option<DecisionRecord>> {
        Ok(self.state.read().await.decisions.get(id).cloned())
    }

    async fn set_superseded(&self, old_id: &str, new_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.decisions.get_mut(old_id) {
            Some(record) if record.status == DecisionStatus::Open => {
                record.status = DecisionStatus::Superseded;
                record.superseded_by = Some(new_id.to_string());
                record.superseded_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_closed(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.decisions.get_mut(id) {
            Some(record) if record.status == DecisionStatus::Open => {
                record.status = DecisionStatus::Closed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_decisions(&self, filter: &DecisionFilter) -> Result<Vec<DecisionRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<DecisionRecord> = state
            .decisions
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

#[async_trait]
impl SessionBackend for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn associate(&self, session_id: &str, kind: ItemKind, item_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .sessions
            .insert((session_id.to_string(), kind, item_id.to_string()), at);
        for ((sid, _, _), last_activity) in state.sessions.iter_mut() {
            if sid == session_id && *last_activity < at {
                *last_activity = at;
            }
        }
        Ok(())
    }

    async fn idle_sessions(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut latest: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for ((sid, _, _), at) in &state.sessions {
            let slot = latest.entry(sid.as_str()).or_insert(*at);
            if *at > *slot {
                *slot = *at;
            }
        }
        Ok(latest
            .into_iter()
            .filter(|(_, at)| *at < before)
            .take(limit)
            .map(|(sid, _)| sid.to_string())
            .collect())
    }

    async fn session_items(&self, session_id: &str) -> Result<Vec<SessionItem>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .iter()
            .filter(|((sid, _, _), _)| sid == session_id)
            .map(|((sid, kind, item), at)| SessionItem {
                session_id: sid.clone(),
                kind: *kind,
                item_id: item.clone(),
                last_activity: *at,
            })
            .collect())
    }

    async fn release_session(&self, session_id: &str) -> Result<Vec<SessionItem>> {
        let mut state = self.state.write().await;
        let keys: Vec<(String, ItemKind, String)> = state
            .sessions
            .keys()
            .filter(|(sid, _, _)| sid == session_id)
            .cloned()
            .collect();

        let mut released = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(at) = state.sessions.remove(&key) {
                let (session_id, kind, item_id) = key;
                released.push(SessionItem {
                    session_id,
                    kind,
                    item_id,
                    last_activity: at,
                });
            }
        }
        Ok(released)
    }

    async fn live_associations(&self, kind: ItemKind, item_id: &str) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .keys()
            .filter(|(_, k, item)| *k == kind && item == item_id)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(text: &str, response: &str) -> CacheEntry {
        CacheEntry::new("default", text, vec![1.0, 0.0], response, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_upsert_collapses_on_hash() {
        let store = MemoryStore::new();
        let first = store.upsert_entry(&entry("what is rust", "a language")).await.unwrap();
        assert!(first.inserted);

        let second = store.upsert_entry(&entry("What is  Rust", "a language")).await.unwrap();
        assert!(!second.inserted);
        assert_eq!(second.entry.id, first.entry.id);
        assert_eq!(second.entry.hit_count, 1);
        assert_eq!(store.count_entries().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let store = MemoryStore::new();
        let id = store.upsert_entry(&entry("q", "r")).await.unwrap().entry.id;
        let ids = vec![id.clone()];

        assert_eq!(store.mark_stale(&ids, Utc::now()).await.unwrap(), 1);
        assert_eq!(store.mark_stale(&ids, Utc::now()).await.unwrap(), 0);
        assert!(store.record_hit(&id, 0.9, Utc::now()).await.unwrap().is_none());

        let entry = store.reverify(&id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Fresh);

        assert_eq!(store.mark_invalid(&ids, "manual", Utc::now()).await.unwrap(), 1);
        assert!(store.reverify(&id, Utc::now()).await.unwrap().is_none());
        assert_eq!(store.mark_invalid(&ids, "manual", Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let store = MemoryStore::new();
        let id = store.upsert_entry(&entry("q", "r")).await.unwrap().entry.id;
        let now = Utc::now();
        store.mark_invalid(&[id.clone()], "manual", now).await.unwrap();

        assert_eq!(store.purge_invalid(now - chrono::Duration::seconds(1), 10).await.unwrap(), 0);
        assert_eq!(store.purge_invalid(now + chrono::Duration::seconds(1), 10).await.unwrap(), 1);
        assert!(store.get_entry(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_associations() {
        let store = MemoryStore::new();
        let t0 = Utc::now() - chrono::Duration::hours(2);
        let t1 = Utc::now();

        store.associate("s1", ItemKind::Cache, "e1", t0).await.unwrap();
        store.associate("s2", ItemKind::Cache, "e1", t1).await.unwrap();
        store.associate("s2", ItemKind::Decision, "d1", t1).await.unwrap();

        let idle = store.idle_sessions(t1 - chrono::Duration::hours(1), 10).await.unwrap();
        assert_eq!(idle, vec!["s1".to_string()]);

        assert_eq!(store.live_associations(ItemKind::Cache, "e1").await.unwrap(), 2);
        let released = store.release_session("s1").await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(store.live_associations(ItemKind::Cache, "e1").await.unwrap(), 1);
        assert_eq!(store.session_items("s2").await.unwrap().len(), 2);
    }
}
