//! Cache entry model with TTL measured from last verification

use crate::similarity::normalize_text;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle state of a cache entry.
///
/// fresh → stale on TTL elapse, stale → fresh on re-verification,
/// fresh|stale → invalid (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Fresh,
    Stale,
    Invalid,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Fresh => "fresh",
            EntryState::Stale => "stale",
            EntryState::Invalid => "invalid",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fresh" => Ok(EntryState::Fresh),
            "stale" => Ok(EntryState::Stale),
            "invalid" => Ok(EntryState::Invalid),
            other => Err(format!("unknown entry state: {other}")),
        }
    }
}

/// A stored (query → response) generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub namespace: String,
    /// SHA-256 of namespace + normalized query text; unique
    pub query_hash: String,
    pub query_embedding: Vec<f32>,
    pub query_text: String,
    pub response_text: String,
    /// Upstream entities/files this generation depends on
    pub entities: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
    pub hit_count: u64,
    pub ttl_seconds: u64,
    pub state: EntryState,
    /// Similarity at which the entry last served a hit
    pub match_score: f32,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub invalidation_reason: Option<String>,
}

impl CacheEntry {
    /// Create a fresh entry for a successful generation
    pub fn new(
        namespace: impl Into<String>,
        query_text: impl Into<String>,
        query_embedding: Vec<f32>,
        response_text: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let namespace = namespace.into();
        let query_text = query_text.into();
        let now = Utc::now();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query_hash: Self::hash_query(&namespace, &query_text),
            namespace,
            query_embedding,
            query_text,
            response_text: response_text.into(),
            entities: BTreeSet::new(),
            created_at: now,
            last_verified_at: now,
            hit_count: 0,
            ttl_seconds: ttl.as_secs().max(1),
            state: EntryState::Fresh,
            match_score: 1.0,
            invalidated_at: None,
            invalidation_reason: None,
        }
    }

    /// Hash used for the exact-match fast path
    pub fn hash_query(namespace: &str, query_text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_text(query_text).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities.extend(entities.into_iter().map(Into::into));
        self
    }

    pub fn add_entity(&mut self, entity: impl Into<String>) {
        self.entities.insert(entity.into());
    }

    pub fn has_entity(&self, entity: &str) -> bool {
        self.entities.contains(entity)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_verified_at + chrono::Duration::seconds(self.ttl_seconds as i64)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// Check if the TTL has elapsed since last verification
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Fresh and within TTL
    pub fn is_servable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == EntryState::Fresh && !self.is_expired_at(now)
    }

    /// Get time until expiration
    pub fn time_until_expiration(&self) -> Option<Duration> {
        (self.expires_at() - Utc::now()).to_std().ok()
    }

    /// Get the age of the entry
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Upsert rule for a write that collides on `query_hash`.
    ///
    /// Live row with the same response: hit_count+1. Live row with a new
    /// response: response replaced, hit_count kept. Invalid row: restarted.
    pub fn absorb(&mut self, incoming: &CacheEntry) {
        if self.state == EntryState::Invalid {
            self.hit_count = 0;
            self.created_at = incoming.created_at;
        } else if self.response_text == incoming.response_text {
            self.hit_count += 1;
        }

        self.query_text = incoming.query_text.clone();
        self.query_embedding = incoming.query_embedding.clone();
        self.response_text = incoming.response_text.clone();
        self.entities = incoming.entities.clone();
        self.last_verified_at = incoming.last_verified_at;
        self.ttl_seconds = incoming.ttl_seconds;
        self.state = EntryState::Fresh;
        self.match_score = 1.0;
        self.invalidated_at = None;
        self.invalidation_reason = None;
    }

    /// Register a hit; only fresh entries count hits
    pub fn mark_hit(&mut self, score: f32, at: DateTime<Utc>) {
        if self.state == EntryState::Fresh {
            self.hit_count += 1;
            self.last_verified_at = at;
            self.match_score = score;
        }
    }
}
