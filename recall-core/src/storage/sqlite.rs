//! SQLite backend (sqlx pool, WAL journal)
//!
//! Tables:
//! - `cache_entries`: one row per query_hash, embedding as a little-endian f32 BLOB
//! - `decisions`: append-only ledger with a self-referential `superseded_by`
//! - `session_items`: session → item associations used to scope cleanup

use super::{
    format_ts, CacheBackend, DecisionBackend, EntryCounts, EntryScan, HealthCheckResult, HealthStatus, ItemKind,
    SessionBackend, SessionItem, UpsertOutcome,
};
use crate::cache::{CacheEntry, EntryState};
use crate::decision::{DecisionFilter, DecisionRecord};
use crate::error::{RecallError, Result};
use crate::similarity::vector::{from_blob, to_blob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Maximum ids bound into one `IN (...)` list
const MAX_BIND_IDS: usize = 500;

/// Pooled SQLite store implementing all three backend contracts
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and run migrations
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(|e| RecallError::Storage(format!("Failed to open SQLite at {}: {e}", path.display())))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite recall store initialized at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database; a single connection keeps one database alive
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RecallError::Config(format!("Invalid SQLite options: {e}")))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(&self) -> Result<()> {
        let statements = [
            (
                "cache_entries table",
                r#"
                CREATE TABLE IF NOT EXISTS cache_entries (
                    id                  TEXT PRIMARY KEY,
                    namespace           TEXT NOT NULL DEFAULT 'default',
                    query_hash          TEXT NOT NULL UNIQUE,
                    query_text          TEXT NOT NULL,
                    query_embedding     BLOB NOT NULL,
                    response_text       TEXT NOT NULL,
                    entities            TEXT NOT NULL DEFAULT '[]',
                    created_at          TEXT NOT NULL,
                    last_verified_at    TEXT NOT NULL,
                    hit_count           INTEGER NOT NULL DEFAULT 0,
                    ttl_seconds         INTEGER NOT NULL,
                    state               TEXT NOT NULL DEFAULT 'fresh'
                                        CHECK (state IN ('fresh', 'stale', 'invalid')),
                    match_score         REAL NOT NULL DEFAULT 1.0,
                    invalidated_at      TEXT,
                    invalidation_reason TEXT
                )
                "#,
            ),
            (
                "cache_entries state index",
                "CREATE INDEX IF NOT EXISTS idx_cache_entries_state ON cache_entries(state, namespace)",
            ),
            (
                "decisions table",
                r#"
                CREATE TABLE IF NOT EXISTS decisions (
                    id              TEXT PRIMARY KEY,
                    decision_head   TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'open'
                                    CHECK (status IN ('open', 'closed', 'superseded')),
                    superseded_by   TEXT REFERENCES decisions(id),
                    entities        TEXT NOT NULL DEFAULT '[]',
                    files           TEXT NOT NULL DEFAULT '[]',
                    head_embedding  BLOB,
                    created_at      TEXT NOT NULL,
                    superseded_at   TEXT
                )
                "#,
            ),
            (
                "decisions status index",
                "CREATE INDEX IF NOT EXISTS idx_decisions_status ON decisions(status, created_at DESC)",
            ),
            (
                "session_items table",
                r#"
                CREATE TABLE IF NOT EXISTS session_items (
                    session_id      TEXT NOT NULL,
                    item_kind       TEXT NOT NULL CHECK (item_kind IN ('cache', 'decision')),
                    item_id         TEXT NOT NULL,
                    last_activity   TEXT NOT NULL,
                    PRIMARY KEY (session_id, item_kind, item_id)
                )
                "#,
            ),
            (
                "session_items item index",
                "CREATE INDEX IF NOT EXISTS idx_session_items_item ON session_items(item_kind, item_id)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| RecallError::Storage(format!("migration failed ({what}): {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Time a trivial query; slower than `degraded_after` reports Degraded
    pub async fn health_check(&self, degraded_after: Duration) -> HealthCheckResult {
        let start = Instant::now();
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let elapsed = start.elapsed();
                let status = if elapsed > degraded_after {
                    warn!("SQLite health check slow ({}ms)", elapsed.as_millis());
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                HealthCheckResult {
                    status,
                    response_time_ms: elapsed.as_millis() as u64,
                    error: None,
                    checked_at: Utc::now(),
                }
            }
            Err(e) => {
                error!("SQLite health check failed: {}", e);
                HealthCheckResult {
                    status: HealthStatus::Unhealthy,
                    response_time_ms: start.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                    checked_at: Utc::now(),
                }
            }
        }
    }

    fn row_to_entry(row: &SqliteRow) -> Result<CacheEntry> {
        let id: String = row.try_get("id")?;
        let blob: Vec<u8> = row.try_get("query_embedding")?;
        let query_embedding = from_blob(&blob).unwrap_or_else(|diagnostic| {
            warn!(entry_id = %id, %diagnostic, "Unreadable cache embedding");
            Vec::new()
        });
        let entities_json: String = row.try_get("entities")?;
        let state: String = row.try_get("state")?;
        let invalidated_at: Option<String> = row.try_get("invalidated_at")?;

        Ok(CacheEntry {
            namespace: row.try_get("namespace")?,
            query_hash: row.try_get("query_hash")?,
            query_text: row.try_get("query_text")?,
            response_text: row.try_get("response_text")?,
            entities: serde_json::from_str(&entities_json).unwrap_or_default(),
            created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
            last_verified_at: parse_ts(&row.try_get::<String, _>("last_verified_at")?)?,
            hit_count: row.try_get::<i64, _>("hit_count")?.max(0) as u64,
            ttl_seconds: row.try_get::<i64, _>("ttl_seconds")?.max(0) as u64,
            state: state.parse().map_err(RecallError::Storage)?,
            match_score: row.try_get::<f64, _>("match_score")? as f32,
            invalidated_at: invalidated_at.as_deref().map(parse_ts).transpose()?,
            invalidation_reason: row.try_get("invalidation_reason")?,
            query_embedding,
            id,
        })
    }

    fn row_to_decision(row: &SqliteRow) -> Result<DecisionRecord> {
        let status: String = row.try_get("status")?;
        let entities: String = row.try_get("entities")?;
        let files: String = row.try_get("files")?;
        let blob: Option<Vec<u8>> = row.try_get("head_embedding")?;
        let superseded_at: Option<String> = row.try_get("superseded_at")?;

        Ok(DecisionRecord {
            id: row.try_get("id")?,
            decision_head: row.try_get("decision_head")?,
            status: status.parse().map_err(RecallError::Storage)?,
            superseded_by: row.try_get("superseded_by")?,
            entities: serde_json::from_str::<BTreeSet<String>>(&entities)?,
            files: serde_json::from_str::<BTreeSet<String>>(&files)?,
            head_embedding: blob.and_then(|b| from_blob(&b).ok()).unwrap_or_default(),
            created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
            superseded_at: superseded_at.as_deref().map(parse_ts).transpose()?,
        })
    }

    fn row_to_session_item(row: &SqliteRow) -> Result<SessionItem> {
        let kind: String = row.try_get("item_kind")?;
        Ok(SessionItem {
            session_id: row.try_get("session_id")?,
            kind: kind.parse().map_err(RecallError::Storage)?,
            item_id: row.try_get("item_id")?,
            last_activity: parse_ts(&row.try_get::<String, _>("last_activity")?)?,
        })
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("connections", &self.pool.size())
            .finish()
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RecallError::Storage(format!("bad timestamp {value:?}: {e}")))
}

fn push_id_list<'a>(qb: &mut QueryBuilder<'a, Sqlite>, ids: &'a [String]) {
    qb.push(" id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id.as_str());
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl CacheBackend for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert_entry(&self, entry: &CacheEntry) -> Result<UpsertOutcome> {
        let entities = serde_json::to_string(&entry.entities)?;

        // All SET expressions read the pre-update row
        let row = sqlx::query(
            r#"
            INSERT INTO cache_entries (
                id, namespace, query_hash, query_text, query_embedding, response_text, entities,
                created_at, last_verified_at, hit_count, ttl_seconds, state, match_score
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, 'fresh', 1.0)
            ON CONFLICT(query_hash) DO UPDATE SET
                hit_count = CASE
                    WHEN cache_entries.state = 'invalid' THEN 0
                    WHEN cache_entries.response_text = excluded.response_text THEN cache_entries.hit_count + 1
                    ELSE cache_entries.hit_count
                END,
                created_at = CASE
                    WHEN cache_entries.state = 'invalid' THEN excluded.created_at
                    ELSE cache_entries.created_at
                END,
                query_text = excluded.query_text,
                query_embedding = excluded.query_embedding,
                response_text = excluded.response_text,
                entities = excluded.entities,
                last_verified_at = excluded.last_verified_at,
                ttl_seconds = excluded.ttl_seconds,
                state = 'fresh',
                match_score = 1.0,
                invalidated_at = NULL,
                invalidation_reason = NULL
            RETURNING *
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.namespace)
        .bind(&entry.query_hash)
        .bind(&entry.query_text)
        .bind(to_blob(&entry.query_embedding))
        .bind(&entry.response_text)
        .bind(entities)
        .bind(format_ts(entry.created_at))
        .bind(format_ts(entry.last_verified_at))
        .bind(entry.ttl_seconds as i64)
        .fetch_one(&self.pool)
        .await?;

        let stored = Self::row_to_entry(&row)?;
        let inserted = stored.id == entry.id;
        debug!(entry_id = %stored.id, inserted, "Upserted cache entry");
        Ok(UpsertOutcome { entry: stored, inserted })
    }

    async fn get_entry(&self, id: &str) -> Result<Option<CacheEntry>> {
        sqlx::query("SELECT * FROM cache_entries WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(Self::row_to_entry)
            .transpose()
    }

    async fn get_by_hash(&self, query_hash: &str) -> Result<Option<CacheEntry>> {
        sqlx::query("SELECT * FROM cache_entries WHERE query_hash = ?1")
            .bind(query_hash)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(Self::row_to_entry)
            .transpose()
    }

    async fn record_hit(&self, id: &str, score: f32, at: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        sqlx::query(
            r#"
            UPDATE cache_entries
            SET hit_count = hit_count + 1, last_verified_at = ?2, match_score = ?3
            WHERE id = ?1 AND state = 'fresh'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(format_ts(at))
        .bind(score as f64)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(Self::row_to_entry)
        .transpose()
    }

    async fn reverify(&self, id: &str, at: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        sqlx::query(
            r#"
            UPDATE cache_entries
            SET state = 'fresh', last_verified_at = ?2
            WHERE id = ?1 AND state != 'invalid'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(format_ts(at))
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(Self::row_to_entry)
        .transpose()
    }

    async fn mark_stale(&self, ids: &[String], _at: DateTime<Utc>) -> Result<usize> {
        let mut changed = 0;
        for chunk in ids.chunks(MAX_BIND_IDS) {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE cache_entries SET state = 'stale' WHERE state = 'fresh' AND");
            push_id_list(&mut qb, chunk);
            changed += qb.build().execute(&self.pool).await?.rows_affected() as usize;
        }
        Ok(changed)
    }

    async fn mark_invalid(&self, ids: &[String], reason: &str, at: DateTime<Utc>) -> Result<usize> {
        let at = format_ts(at);
        let mut changed = 0;
        for chunk in ids.chunks(MAX_BIND_IDS) {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE cache_entries SET state = 'invalid', invalidated_at = ");
            qb.push_bind(at.as_str());
            qb.push(", invalidation_reason = ");
            qb.push_bind(reason);
            qb.push(" WHERE state != 'invalid' AND");
            push_id_list(&mut qb, chunk);
            changed += qb.build().execute(&self.pool).await?.rows_affected() as usize;
        }
        Ok(changed)
    }

    async fn scan_entries(&self, scan: &EntryScan) -> Result<Vec<CacheEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM cache_entries WHERE 1 = 1");
        if let Some(after) = &scan.after_id {
            qb.push(" AND id > ");
            qb.push_bind(after.as_str());
        }
        if let Some(namespace) = &scan.namespace {
            qb.push(" AND namespace = ");
            qb.push_bind(namespace.as_str());
        }
        if !scan.states.is_empty() {
            qb.push(" AND state IN (");
            let mut separated = qb.separated(", ");
            for state in &scan.states {
                separated.push_bind(state.as_str());
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY id LIMIT ");
        qb.push_bind(scan.limit as i64);

        qb.build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(Self::row_to_entry)
            .collect()
    }

    async fn entries_with_entity(&self, entity: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM cache_entries
            WHERE state != 'invalid'
              AND EXISTS (SELECT 1 FROM json_each(cache_entries.entities) WHERE json_each.value = ?1)
            ORDER BY id
            "#,
        )
        .bind(entity)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(RecallError::from))
            .collect()
    }

    async fn purge_invalid(&self, before: DateTime<Utc>, limit: usize) -> Result<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM cache_entries WHERE id IN (
                SELECT id FROM cache_entries
                WHERE state = 'invalid' AND (invalidated_at IS NULL OR invalidated_at < ?1)
                LIMIT ?2
            )
            "#,
        )
        .bind(format_ts(before))
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn count_entries(&self) -> Result<EntryCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM cache_entries GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = EntryCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n = row.try_get::<i64, _>("n")?.max(0) as u64;
            match state.parse::<EntryState>() {
                Ok(EntryState::Fresh) => counts.fresh = n,
                Ok(EntryState::Stale) => counts.stale = n,
                Ok(EntryState::Invalid) => counts.invalid = n,
                Err(e) => warn!("Skipping unknown state in counts: {}", e),
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl DecisionBackend for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert_decision(&self, record: &DecisionRecord) -> Result<()> {
        let embedding = (!record.head_embedding.is_empty()).then(|| to_blob(&record.head_embedding));

        sqlx::query(
            r#"
            INSERT INTO decisions (
                id, decision_head, status, superseded_by, entities, files, head_embedding, created_at, superseded_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&record.id)
        .bind(&record.decision_head)
        .bind(record.status.as_str())
        .bind(record.superseded_by.as_deref())
        .bind(serde_json::to_string(&record.entities)?)
        .bind(serde_json::to_string(&record.files)?)
        .bind(embedding)
        .bind(format_ts(record.created_at))
        .bind(record.superseded_at.map(format_ts))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_decision(&self, id: &str) -> Result<Option<DecisionRecord>> {
        sqlx::query("SELECT * FROM decisions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(Self::row_to_decision)
            .transpose()
    }

    async fn set_superseded(&self, old_id: &str, new_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE decisions
            SET status = 'superseded', superseded_by = ?2, superseded_at = ?3
            WHERE id = ?1 AND status = 'open'
            "#,
        )
        .bind(old_id)
        .bind(new_id)
        .bind(format_ts(at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_closed(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE decisions SET status = 'closed' WHERE id = ?1 AND status = 'open'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_decisions(&self, filter: &DecisionFilter) -> Result<Vec<DecisionRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM decisions");
        if !filter.statuses.is_empty() {
            qb.push(" WHERE status IN (");
            let mut separated = qb.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY created_at DESC, id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut records = Vec::new();
        for row in &rows {
            let record = Self::row_to_decision(row)?;
            if filter.matches(&record) {
                records.push(record);
                if filter.limit.is_some_and(|limit| records.len() >= limit) {
                    break;
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SessionBackend for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn associate(&self, session_id: &str, kind: ItemKind, item_id: &str, at: DateTime<Utc>) -> Result<()> {
        let at = format_ts(at);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO session_items (session_id, item_kind, item_id, last_activity)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(session_id, item_kind, item_id) DO UPDATE SET last_activity = excluded.last_activity
            "#,
        )
        .bind(session_id)
        .bind(kind.as_str())
        .bind(item_id)
        .bind(&at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE session_items SET last_activity = ?2 WHERE session_id = ?1 AND last_activity < ?2")
            .bind(session_id)
            .bind(&at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn idle_sessions(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id FROM session_items
            GROUP BY session_id
            HAVING MAX(last_activity) < ?1
            ORDER BY session_id
            LIMIT ?2
            "#,
        )
        .bind(format_ts(before))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("session_id").map_err(RecallError::from))
            .collect()
    }

    async fn session_items(&self, session_id: &str) -> Result<Vec<SessionItem>> {
        sqlx::query("SELECT * FROM session_items WHERE session_id = ?1 ORDER BY item_kind, item_id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(Self::row_to_session_item)
            .collect()
    }

    async fn release_session(&self, session_id: &str) -> Result<Vec<SessionItem>> {
        sqlx::query("DELETE FROM session_items WHERE session_id = ?1 RETURNING *")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(Self::row_to_session_item)
            .collect()
    }

    async fn live_associations(&self, kind: ItemKind, item_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM session_items WHERE item_kind = ?1 AND item_id = ?2")
            .bind(kind.as_str())
            .bind(item_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionStatus;

    fn entry(text: &str, response: &str) -> CacheEntry {
        CacheEntry::new("default", text, vec![0.6, 0.8], response, Duration::from_secs(60))
            .with_entities(["storage"])
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.run_migrations().await.unwrap();
        assert_eq!(store.count_entries().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_upsert_rules() {
        let store = SqliteStore::in_memory().await.unwrap();

        let first = store.upsert_entry(&entry("what is rust", "a language")).await.unwrap();
        assert!(first.inserted);
        assert_eq!(first.entry.query_embedding, vec![0.6, 0.8]);
        assert!(first.entry.has_entity("storage"));

        let same = store.upsert_entry(&entry("what is rust", "a language")).await.unwrap();
        assert!(!same.inserted);
        assert_eq!(same.entry.id, first.entry.id);
        assert_eq!(same.entry.hit_count, 1);

        let replaced = store.upsert_entry(&entry("what is rust", "a systems language")).await.unwrap();
        assert_eq!(replaced.entry.hit_count, 1);
        assert_eq!(replaced.entry.response_text, "a systems language");

        store
            .mark_invalid(&[first.entry.id.clone()], "manual", Utc::now())
            .await
            .unwrap();
        let restarted = store.upsert_entry(&entry("what is rust", "a language")).await.unwrap();
        assert_eq!(restarted.entry.hit_count, 0);
        assert_eq!(restarted.entry.state, EntryState::Fresh);
        assert!(restarted.entry.invalidation_reason.is_none());
        assert_eq!(store.count_entries().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_hits_only_on_fresh_rows() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.upsert_entry(&entry("q", "r")).await.unwrap().entry.id;

        let hit = store.record_hit(&id, 0.91, Utc::now()).await.unwrap().unwrap();
        assert_eq!(hit.hit_count, 1);
        assert!((hit.match_score - 0.91).abs() < 1e-6);

        store.mark_stale(&[id.clone()], Utc::now()).await.unwrap();
        assert!(store.record_hit(&id, 0.91, Utc::now()).await.unwrap().is_none());
        assert_eq!(store.reverify(&id, Utc::now()).await.unwrap().unwrap().state, EntryState::Fresh);
    }

    #[tokio::test]
    async fn test_scan_and_entity_lookup() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..5 {
            store.upsert_entry(&entry(&format!("query {i}"), "r")).await.unwrap();
        }

        let first = store.scan_entries(&EntryScan::new(3).state(EntryState::Fresh)).await.unwrap();
        assert_eq!(first.len(), 3);
        let rest = store
            .scan_entries(&EntryScan::new(3).after(first.last().map(|e| e.id.clone())))
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|e| e.id > first[2].id));

        assert_eq!(store.entries_with_entity("storage").await.unwrap().len(), 5);
        assert!(store.entries_with_entity("network").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decision_round_trip_and_supersedence() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut d1 = DecisionRecord::new("use postgres", ["storage"], ["src/db.rs"]).unwrap();
        d1.head_embedding = vec![1.0, 0.0];
        let d2 = DecisionRecord::new("use sqlite", ["storage"], Vec::<String>::new()).unwrap();
        store.insert_decision(&d1).await.unwrap();
        store.insert_decision(&d2).await.unwrap();

        let loaded = store.get_decision(&d1.id).await.unwrap().unwrap();
        assert_eq!(loaded.head_embedding, vec![1.0, 0.0]);
        assert!(loaded.files.contains("src/db.rs"));

        assert!(store.set_superseded(&d1.id, &d2.id, Utc::now()).await.unwrap());
        assert!(!store.set_superseded(&d1.id, &d2.id, Utc::now()).await.unwrap());

        let open = store.list_decisions(&DecisionFilter::open().entity("storage")).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, d2.id);

        let old = store.get_decision(&d1.id).await.unwrap().unwrap();
        assert_eq!(old.status, DecisionStatus::Superseded);
        assert_eq!(old.superseded_by.as_deref(), Some(d2.id.as_str()));
    }

    #[tokio::test]
    async fn test_sessions() {
        let store = SqliteStore::in_memory().await.unwrap();
        let old = Utc::now() - chrono::Duration::hours(3);
        store.associate("s1", ItemKind::Cache, "e1", old).await.unwrap();
        store.associate("s2", ItemKind::Cache, "e1", Utc::now()).await.unwrap();

        let idle = store
            .idle_sessions(Utc::now() - chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(idle, vec!["s1".to_string()]);

        let released = store.release_session("s1").await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].kind, ItemKind::Cache);
        assert_eq!(store.live_associations(ItemKind::Cache, "e1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = SqliteStore::in_memory().await.unwrap();
        let result = store.health_check(Duration::from_secs(1)).await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert!(result.error.is_none());
    }
}
