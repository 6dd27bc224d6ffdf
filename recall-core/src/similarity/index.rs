//! In-memory similarity index over fixed-dimension vectors

use super::lexical::{jaccard, token_set};
use super::vector::{density, normalized_cosine, validate, IndexDiagnostic};
use crate::config::{IndexConfig, SearchStrategy};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

const LSH_SEED: u64 = 0x5eed_cafe;

/// A search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredId {
    pub id: String,
    /// Final score in [0, 1]
    pub score: f32,
    /// Cosine component, clamped to [0, 1]
    pub cosine: f32,
    /// Jaccard component when the lexical signal was blended in
    pub lexical: Option<f32>,
}

struct IndexedItem {
    vector: Vec<f32>,
    norm: f32,
    tokens: HashSet<String>,
    verified_at: DateTime<Utc>,
    signatures: Vec<u64>,
}

/// Random-hyperplane LSH tables
struct LshTables {
    planes: Vec<Vec<Vec<f32>>>,
    buckets: Vec<HashMap<u64, Vec<String>>>,
}

impl LshTables {
    fn new(tables: usize, bits: usize, dim: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(LSH_SEED);
        let planes = (0..tables)
            .map(|_| {
                (0..bits)
                    .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
                    .collect()
            })
            .collect();
        Self {
            planes,
            buckets: (0..tables).map(|_| HashMap::new()).collect(),
        }
    }

    fn signatures(&self, vector: &[f32]) -> Vec<u64> {
        self.planes
            .iter()
            .map(|table| {
                table.iter().enumerate().fold(0u64, |sig, (bit, plane)| {
                    let side: f32 = plane.iter().zip(vector).map(|(p, v)| p * v).sum();
                    if side >= 0.0 {
                        sig | (1 << bit)
                    } else {
                        sig
                    }
                })
            })
            .collect()
    }

    fn add(&mut self, id: &str, signatures: &[u64]) {
        for (table, sig) in self.buckets.iter_mut().zip(signatures) {
            table.entry(*sig).or_default().push(id.to_string());
        }
    }

    fn remove(&mut self, id: &str, signatures: &[u64]) {
        for (table, sig) in self.buckets.iter_mut().zip(signatures) {
            if let Some(bucket) = table.get_mut(sig) {
                bucket.retain(|existing| existing != id);
                if bucket.is_empty() {
                    table.remove(sig);
                }
            }
        }
    }

    fn candidates(&self, signatures: &[u64]) -> HashSet<&str> {
        self.buckets
            .iter()
            .zip(signatures)
            .filter_map(|(table, sig)| table.get(sig))
            .flat_map(|bucket| bucket.iter().map(String::as_str))
            .collect()
    }
}

/// Similarity index keyed by string id.
///
/// Cosine is the primary metric. For short or sparse queries the Jaccard
/// overlap of token sets is blended in, and the blend can only raise a
/// score above its cosine. Ties go to the most recently verified
/// item. The dimension is fixed by the first successful insert.
pub struct SimilarityIndex {
    config: IndexConfig,
    dimension: Option<usize>,
    items: HashMap<String, IndexedItem>,
    lsh: Option<LshTables>,
}

impl SimilarityIndex {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            dimension: None,
            items: HashMap::new(),
            lsh: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Insert or replace a vector
    pub fn insert(&mut self, id: impl Into<String>, vector: Vec<f32>) -> Result<(), IndexDiagnostic> {
        self.insert_with_text(id, vector, "", Utc::now())
    }

    /// Insert or replace a vector together with its source text and recency
    pub fn insert_with_text(
        &mut self,
        id: impl Into<String>,
        vector: Vec<f32>,
        text: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<(), IndexDiagnostic> {
        let id = id.into();
        let norm = validate(&vector)?;
        self.check_dimension(vector.len())?;

        if self.dimension.is_none() {
            self.dimension = Some(vector.len());
            if let SearchStrategy::Lsh { tables, bits } = self.config.strategy {
                self.lsh = Some(LshTables::new(tables, bits, vector.len()));
            }
        }

        self.remove(&id);

        let signatures = match &mut self.lsh {
            Some(lsh) => {
                let sigs = lsh.signatures(&vector);
                lsh.add(&id, &sigs);
                sigs
            }
            None => Vec::new(),
        };

        self.items.insert(
            id,
            IndexedItem {
                vector,
                norm,
                tokens: token_set(text),
                verified_at,
                signatures,
            },
        );
        Ok(())
    }

    /// Remove a vector; returns whether it was present
    pub fn remove(&mut self, id: &str) -> bool {
        match self.items.remove(id) {
            Some(item) => {
                if let Some(lsh) = &mut self.lsh {
                    lsh.remove(id, &item.signatures);
                }
                true
            }
            None => false,
        }
    }

    /// Update the recency used for tie-breaking
    pub fn touch(&mut self, id: &str, verified_at: DateTime<Utc>) {
        if let Some(item) = self.items.get_mut(id) {
            item.verified_at = verified_at;
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.dimension = None;
        self.lsh = None;
    }

    /// Top-k by cosine similarity. Corrupt input yields an empty result.
    pub fn search(&self, vector: &[f32], k: usize) -> Vec<ScoredId> {
        self.search_text(vector, "", k)
    }

    /// Top-k, blending in Jaccard for short or sparse queries.
    /// Corrupt input yields an empty result and a logged diagnostic.
    pub fn search_text(&self, vector: &[f32], text: &str, k: usize) -> Vec<ScoredId> {
        match self.try_search(vector, text, k) {
            Ok(hits) => hits,
            Err(diagnostic) => {
                warn!(%diagnostic, "Similarity search skipped");
                Vec::new()
            }
        }
    }

    /// Like [`search_text`](Self::search_text) but returns the diagnostic
    pub fn try_search(&self, vector: &[f32], text: &str, k: usize) -> Result<Vec<ScoredId>, IndexDiagnostic> {
        if k == 0 || self.items.is_empty() {
            return Ok(Vec::new());
        }
        let norm = validate(vector)?;
        self.check_dimension(vector.len())?;

        let query_tokens = token_set(text);
        let blend = self.use_lexical(vector, &query_tokens);
        let weight = self.config.lexical_weight;

        let score_item = |id: &str, item: &IndexedItem| {
            let cosine = normalized_cosine(vector, norm, &item.vector, item.norm);
            let (score, lexical) = if blend {
                let lex = jaccard(&query_tokens, &item.tokens);
                (cosine.max((1.0 - weight) * cosine + weight * lex), Some(lex))
            } else {
                (cosine, None)
            };
            (
                ScoredId {
                    id: id.to_string(),
                    score,
                    cosine,
                    lexical,
                },
                item.verified_at,
            )
        };

        let mut scored: Vec<(ScoredId, DateTime<Utc>)> = match &self.lsh {
            Some(lsh) => {
                let candidates = lsh.candidates(&lsh.signatures(vector));
                if candidates.len() >= k {
                    candidates
                        .into_iter()
                        .filter_map(|id| self.items.get(id).map(|item| score_item(id, item)))
                        .collect()
                } else {
                    debug!(
                        candidates = candidates.len(),
                        k, "LSH returned too few candidates, scanning exhaustively"
                    );
                    self.items.iter().map(|(id, item)| score_item(id, item)).collect()
                }
            }
            None => self.items.iter().map(|(id, item)| score_item(id, item)).collect(),
        };

        scored.sort_by(|(a, a_at), (b, b_at)| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b_at.cmp(a_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(k);
        Ok(scored.into_iter().map(|(hit, _)| hit).collect())
    }

    fn use_lexical(&self, vector: &[f32], query_tokens: &HashSet<String>) -> bool {
        let short = !query_tokens.is_empty() && query_tokens.len() <= self.config.short_query_max_tokens;
        let sparse = density(vector) < self.config.sparse_vector_ratio;
        short || sparse
    }

    fn check_dimension(&self, got: usize) -> Result<(), IndexDiagnostic> {
        match self.dimension {
            Some(expected) if expected != got => Err(IndexDiagnostic::DimensionMismatch { expected, got }),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for SimilarityIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimilarityIndex")
            .field("dimension", &self.dimension)
            .field("items", &self.items.len())
            .field("strategy", &self.config.strategy)
            .finish()
    }
}
