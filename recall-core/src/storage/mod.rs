//! Persistence contracts for cache entries, decisions and session associations
//!
//! Two implementations share these contracts: [`MemoryStore`] (in-process)
//! and [`SqliteStore`] (pooled, WAL). Backends report DB blips as
//! `RecallError::TransientStore`; callers wrap calls in [`with_retry`].

pub mod memory;
pub mod retry;
pub mod sqlite;

pub use memory::MemoryStore;
pub use retry::with_retry;
pub use sqlite::SqliteStore;

use crate::cache::{CacheEntry, EntryState};
use crate::decision::{DecisionFilter, DecisionRecord};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result of an upsert keyed by `query_hash`
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// The row as stored after the write
    pub entry: CacheEntry,
    /// True when no row existed for the hash
    pub inserted: bool,
}

/// Keyset-paginated scan over cache entries, ordered by id
#[derive(Debug, Clone)]
pub struct EntryScan {
    pub namespace: Option<String>,
    /// Empty matches every state
    pub states: Vec<EntryState>,
    pub after_id: Option<String>,
    pub limit: usize,
}

impl EntryScan {
    pub fn new(limit: usize) -> Self {
        Self {
            namespace: None,
            states: Vec::new(),
            after_id: None,
            limit,
        }
    }

    pub fn state(mut self, state: EntryState) -> Self {
        self.states.push(state);
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn after(mut self, id: Option<String>) -> Self {
        self.after_id = id;
        self
    }

    pub fn matches(&self, entry: &CacheEntry) -> bool {
        self.after_id.as_deref().map_or(true, |after| entry.id.as_str() > after)
            && self.namespace.as_deref().map_or(true, |ns| entry.namespace == ns)
            && (self.states.is_empty() || self.states.contains(&entry.state))
    }
}

/// Row counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCounts {
    pub fresh: u64,
    pub stale: u64,
    pub invalid: u64,
}

impl EntryCounts {
    pub fn total(&self) -> u64 {
        self.fresh + self.stale + self.invalid
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Insert, or apply the upsert rule to the row with the same `query_hash`
    async fn upsert_entry(&self, entry: &CacheEntry) -> Result<UpsertOutcome>;

    async fn get_entry(&self, id: &str) -> Result<Option<CacheEntry>>;

    async fn get_by_hash(&self, query_hash: &str) -> Result<Option<CacheEntry>>;

    /// hit_count+1, last_verified_at and match_score refreshed; fresh rows only
    async fn record_hit(&self, id: &str, score: f32, at: DateTime<Utc>) -> Result<Option<CacheEntry>>;

    /// stale|fresh → fresh with last_verified_at = `at`; invalid rows are untouched
    async fn reverify(&self, id: &str, at: DateTime<Utc>) -> Result<Option<CacheEntry>>;

    /// fresh → stale; returns the number of rows transitioned
    async fn mark_stale(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize>;

    /// fresh|stale → invalid; returns the number of rows transitioned
    async fn mark_invalid(&self, ids: &[String], reason: &str, at: DateTime<Utc>) -> Result<usize>;

    async fn scan_entries(&self, scan: &EntryScan) -> Result<Vec<CacheEntry>>;

    /// Ids of non-invalid entries that depend on `entity`
    async fn entries_with_entity(&self, entity: &str) -> Result<Vec<String>>;

    /// Physically delete up to `limit` invalid rows invalidated before `before`
    async fn purge_invalid(&self, before: DateTime<Utc>, limit: usize) -> Result<usize>;

    async fn count_entries(&self) -> Result<EntryCounts>;
}

#[async_trait]
pub trait DecisionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn insert_decision(&self, record: &DecisionRecord) -> Result<()>;

    async fn get_decision(&self, id: &str) -> Result<Option<DecisionRecord>>;

    /// Conditional open → superseded. Returns false when `old_id` is not open.
    async fn set_superseded(&self, old_id: &str, new_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Conditional open → closed. Returns false when `id` is not open.
    async fn set_closed(&self, id: &str) -> Result<bool>;

    /// Matching records, newest first, honouring `filter.limit`
    async fn list_decisions(&self, filter: &DecisionFilter) -> Result<Vec<DecisionRecord>>;
}

/// What a session association points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Cache,
    Decision,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Cache => "cache",
            ItemKind::Decision => "decision",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cache" => Ok(ItemKind::Cache),
            "decision" => Ok(ItemKind::Decision),
            other => Err(format!("unknown item kind: {other}")),
        }
    }
}

/// One (session, item) association
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionItem {
    pub session_id: String,
    pub kind: ItemKind,
    pub item_id: String,
    pub last_activity: DateTime<Utc>,
}

/// Session → item associations used to scope cleanup.
/// Sessions themselves are owned elsewhere.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Record (or refresh) an association and bump the session's activity
    async fn associate(&self, session_id: &str, kind: ItemKind, item_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Sessions whose latest activity is before `before`
    async fn idle_sessions(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<String>>;

    async fn session_items(&self, session_id: &str) -> Result<Vec<SessionItem>>;

    /// Delete every association of the session, returning them
    async fn release_session(&self, session_id: &str) -> Result<Vec<SessionItem>>;

    /// Number of sessions still associated with the item
    async fn live_associations(&self, kind: ItemKind, item_id: &str) -> Result<usize>;
}

/// Result of a backend health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Health status of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Reachable but slower than the warm-path timeout
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Fixed-width RFC 3339 so text comparison orders chronologically
pub(crate) fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ts_orders_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(format_ts(a) < format_ts(b));
        assert!(format_ts(a).ends_with('Z'));
    }

    #[test]
    fn test_entry_scan_matches() {
        let mut entry = CacheEntry::new("docs", "q", vec![1.0], "r", std::time::Duration::from_secs(60));
        entry.id = "b".into();

        assert!(EntryScan::new(10).matches(&entry));
        assert!(EntryScan::new(10).after(Some("a".into())).matches(&entry));
        assert!(!EntryScan::new(10).after(Some("b".into())).matches(&entry));
        assert!(!EntryScan::new(10).namespace("default").matches(&entry));
        assert!(!EntryScan::new(10).state(EntryState::Stale).matches(&entry));
    }

    #[test]
    fn test_item_kind_strings() {
        assert_eq!("cache".parse::<ItemKind>().unwrap(), ItemKind::Cache);
        assert_eq!(ItemKind::Decision.to_string(), "decision");
    }
}
