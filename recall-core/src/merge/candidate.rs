//! Ephemeral merge candidates

use crate::cache::CacheEntry;
use crate::decision::{DecisionStatus, ScoredDecision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Where a candidate came from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Cache,
    Decision,
    Provider(String),
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateSource::Cache => write!(f, "cache"),
            CandidateSource::Decision => write!(f, "decision"),
            CandidateSource::Provider(name) => write!(f, "provider-{}", name),
        }
    }
}

/// Link from a candidate to the decision it reflects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLink {
    pub decision_id: String,
    pub status: DecisionStatus,
    /// Hops to the current head; 0 for a head
    pub chain_depth: usize,
}

/// A piece of context competing for a slot in the merged result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCandidate {
    pub source: CandidateSource,
    /// Id of the underlying item, used for deduplication
    pub origin_id: String,
    pub payload: String,
    /// Retrieval score reported by the source
    pub raw_score: f32,
    /// Score after merge adjustments
    pub adjusted_score: f32,
    pub recency: DateTime<Utc>,
    pub decision: Option<DecisionLink>,
    pub entities: BTreeSet<String>,
    /// 0-based rank in a lexical result list
    pub lexical_rank: Option<usize>,
    /// 0-based rank in a vector result list
    pub vector_rank: Option<usize>,
}

impl ContextCandidate {
    pub fn new(
        source: CandidateSource,
        origin_id: impl Into<String>,
        payload: impl Into<String>,
        raw_score: f32,
    ) -> Self {
        Self {
            source,
            origin_id: origin_id.into(),
            payload: payload.into(),
            raw_score,
            adjusted_score: raw_score,
            recency: Utc::now(),
            decision: None,
            entities: BTreeSet::new(),
            lexical_rank: None,
            vector_rank: None,
        }
    }

    /// Candidate for a cache hit served at `score`
    pub fn from_cache_entry(entry: &CacheEntry, score: f32) -> Self {
        Self::new(CandidateSource::Cache, &entry.id, &entry.response_text, score)
            .with_recency(entry.last_verified_at)
            .with_entities(entry.entities.iter().cloned())
    }

    pub fn from_decision(scored: &ScoredDecision) -> Self {
        let record = &scored.record;
        Self::new(CandidateSource::Decision, &record.id, &record.decision_head, scored.score)
            .with_recency(record.created_at)
            .with_entities(record.entities.iter().cloned())
            .with_decision(DecisionLink {
                decision_id: record.id.clone(),
                status: record.status,
                chain_depth: scored.chain_depth,
            })
    }

    pub fn with_recency(mut self, recency: DateTime<Utc>) -> Self {
        self.recency = recency;
        self
    }

    pub fn with_decision(mut self, link: DecisionLink) -> Self {
        self.decision = Some(link);
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

    pub fn with_lexical_rank(mut self, rank: usize) -> Self {
        self.lexical_rank = Some(rank);
        self
    }

    pub fn with_vector_rank(mut self, rank: usize) -> Self {
        self.vector_rank = Some(rank);
        self
    }

    pub fn chain_depth(&self) -> usize {
        self.decision.as_ref().map_or(0, |link| link.chain_depth)
    }

    /// Fold a duplicate of the same underlying item into this one
    pub(crate) fn absorb_signals(&mut self, other: &ContextCandidate) {
        self.lexical_rank = min_rank(self.lexical_rank, other.lexical_rank);
        self.vector_rank = min_rank(self.vector_rank, other.vector_rank);
        self.entities.extend(other.entities.iter().cloned());
        if self.decision.is_none() {
            self.decision = other.decision.clone();
        }
        if other.recency > self.recency {
            self.recency = other.recency;
        }
    }
}

fn min_rank(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_source_display() {
        assert_eq!(CandidateSource::Cache.to_string(), "cache");
        assert_eq!(CandidateSource::Provider("docs".into()).to_string(), "provider-docs");
    }

    #[test]
    fn test_from_cache_entry() {
        let entry = CacheEntry::new("default", "pool size", vec![1.0, 0.0], "four", Duration::from_secs(60))
            .with_entities(["db"]);
        let candidate = ContextCandidate::from_cache_entry(&entry, 0.9);
        assert_eq!(candidate.origin_id, entry.id);
        assert_eq!(candidate.payload, "four");
        assert_eq!(candidate.adjusted_score, 0.9);
        assert!(candidate.entities.contains("db"));
        assert_eq!(candidate.chain_depth(), 0);
    }

    #[test]
    fn test_absorb_signals_keeps_best_ranks() {
        let mut a = ContextCandidate::new(CandidateSource::Provider("bm25".into()), "doc-1", "x", 0.7)
            .with_lexical_rank(3);
        let b = ContextCandidate::new(CandidateSource::Provider("ann".into()), "doc-1", "x", 0.6)
            .with_vector_rank(1)
            .with_lexical_rank(8)
            .with_entities(["auth"]);
        a.absorb_signals(&b);
        assert_eq!(a.lexical_rank, Some(3));
        assert_eq!(a.vector_rank, Some(1));
        assert!(a.entities.contains("auth"));
    }
}
