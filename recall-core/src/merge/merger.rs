//! Decision-weighted ranking of context candidates

use crate::config::ScoringConfig;
use crate::decision::DecisionStatus;
use crate::merge::candidate::ContextCandidate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Scoring knobs for one merge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionWeighting {
    pub open_bonus: f32,
    pub superseded_penalty: f32,
    pub entity_overlap_bonus: f32,
    pub co_sign_bonus: f32,
    pub enable_entity_overlap: bool,
    pub enable_co_sign: bool,
    pub co_sign_top_n: usize,
    /// Entities of the query, for the entity-overlap bonus
    pub query_entities: BTreeSet<String>,
    pub limit: Option<usize>,
}

impl Default for DecisionWeighting {
    fn default() -> Self {
        Self::from(&ScoringConfig::default())
    }
}

impl From<&ScoringConfig> for DecisionWeighting {
    fn from(scoring: &ScoringConfig) -> Self {
        Self {
            open_bonus: scoring.open_decision_bonus,
            superseded_penalty: scoring.superseded_penalty,
            entity_overlap_bonus: scoring.entity_overlap_bonus,
            co_sign_bonus: scoring.co_sign_bonus,
            enable_entity_overlap: scoring.enable_entity_overlap,
            enable_co_sign: scoring.enable_co_sign,
            co_sign_top_n: scoring.co_sign_top_n,
            query_entities: BTreeSet::new(),
            limit: None,
        }
    }
}

impl DecisionWeighting {
    pub fn with_query_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query_entities = entities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_entity_overlap(mut self, enabled: bool) -> Self {
        self.enable_entity_overlap = enabled;
        self
    }

    pub fn with_co_sign(mut self, enabled: bool) -> Self {
        self.enable_co_sign = enabled;
        self
    }

    fn adjustment(&self, candidate: &ContextCandidate) -> f32 {
        let mut delta = match candidate.decision.as_ref().map(|link| link.status) {
            Some(DecisionStatus::Open) => self.open_bonus,
            Some(DecisionStatus::Superseded) => -self.superseded_penalty,
            Some(DecisionStatus::Closed) | None => 0.0,
        };

        if self.enable_entity_overlap && !self.query_entities.is_disjoint(&candidate.entities) {
            delta += self.entity_overlap_bonus;
        }

        if self.enable_co_sign {
            let top = |rank: Option<usize>| rank.is_some_and(|r| r < self.co_sign_top_n);
            if top(candidate.lexical_rank) && top(candidate.vector_rank) {
                delta += self.co_sign_bonus;
            }
        }

        delta
    }
}

/// Merges candidates from every source into one ranked list.
///
/// Output order for a given candidate set is deterministic: adjusted score
/// descending, then more recent, then shallower supersedence depth, then
/// origin id ascending.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextMerger;

impl ContextMerger {
    pub fn new() -> Self {
        Self
    }

    pub fn merge(&self, candidates: Vec<ContextCandidate>, weighting: &DecisionWeighting) -> Vec<ContextCandidate> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let received = candidates.len();

        let mut results: Vec<ContextCandidate> = dedup(candidates)
            .into_iter()
            .map(|mut candidate| {
                candidate.adjusted_score = candidate.raw_score + weighting.adjustment(&candidate);
                candidate
            })
            .collect();

        results.sort_by(rank_order);
        if let Some(limit) = weighting.limit {
            results.truncate(limit);
        }

        debug!("Merged {} candidates into {}", received, results.len());
        results
    }
}

/// One candidate per origin id: the highest raw score wins and absorbs the
/// rank signals and entities of the rest of its group
fn dedup(candidates: Vec<ContextCandidate>) -> Vec<ContextCandidate> {
    let mut groups: HashMap<String, Vec<ContextCandidate>> = HashMap::new();
    for candidate in candidates {
        if !candidate.raw_score.is_finite() {
            debug!(origin_id = %candidate.origin_id, source = %candidate.source, "Dropping candidate with non-finite score");
            continue;
        }
        groups.entry(candidate.origin_id.clone()).or_default().push(candidate);
    }

    groups
        .into_values()
        .filter_map(|mut group| {
            group.sort_by(|a, b| {
                b.raw_score
                    .total_cmp(&a.raw_score)
                    .then_with(|| b.recency.cmp(&a.recency))
                    .then_with(|| a.source.cmp(&b.source))
            });
            let mut rest = group.into_iter();
            let mut best = rest.next()?;
            for other in rest {
                best.absorb_signals(&other);
            }
            Some(best)
        })
        .collect()
}

fn rank_order(a: &ContextCandidate, b: &ContextCandidate) -> Ordering {
    b.adjusted_score
        .total_cmp(&a.adjusted_score)
        .then_with(|| b.recency.cmp(&a.recency))
        .then_with(|| a.chain_depth().cmp(&b.chain_depth()))
        .then_with(|| a.origin_id.cmp(&b.origin_id))
}
