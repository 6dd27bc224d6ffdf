//! Lookup results and cache statistics

use crate::cache::entry::CacheEntry;
use crate::storage::EntryCounts;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which path produced a cache hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    /// Query hash matched
    Exact,
    /// Vector similarity at or above the namespace threshold
    Semantic,
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupKind::Exact => write!(f, "exact"),
            LookupKind::Semantic => write!(f, "semantic"),
        }
    }
}

/// Outcome of `CacheStore::lookup`
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit {
        entry: CacheEntry,
        score: f32,
        kind: LookupKind,
    },
    Miss {
        /// Best similarity seen, if any vector was compared
        best_score: Option<f32>,
        /// The store was unavailable or too slow
        degraded: bool,
    },
}

impl CacheLookup {
    pub(crate) fn degraded() -> Self {
        CacheLookup::Miss {
            best_score: None,
            degraded: true,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, CacheLookup::Miss { degraded: true, .. })
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            CacheLookup::Hit { entry, .. } => Some(entry),
            CacheLookup::Miss { .. } => None,
        }
    }

    pub fn into_entry(self) -> Option<CacheEntry> {
        match self {
            CacheLookup::Hit { entry, .. } => Some(entry),
            CacheLookup::Miss { .. } => None,
        }
    }

    /// Hit score, or the best score seen on a miss
    pub fn score(&self) -> Option<f32> {
        match self {
            CacheLookup::Hit { score, .. } => Some(*score),
            CacheLookup::Miss { best_score, .. } => *best_score,
        }
    }
}

/// Counters for cache performance monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheStats {
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    /// Misses caused by store unavailability or the warm-path timeout
    pub degraded_misses: u64,
    pub upserts: u64,
    pub invalidations: u64,
    /// fresh → stale transitions (TTL or threshold re-score)
    pub stale_transitions: u64,
    /// stale → fresh re-verifications
    pub reverified: u64,
    /// Rows by state, filled in by `CacheStore::stats`
    pub entries: EntryCounts,
    /// Vectors currently held by the similarity indexes
    pub indexed: usize,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.exact_hits + self.semantic_hits
    }

    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits() as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {} (exact {}, semantic {}), misses: {} (degraded {}), hit_rate: {:.2}%, \
             entries: {} fresh / {} stale / {} invalid, invalidations: {} }}",
            self.hits(),
            self.exact_hits,
            self.semantic_hits,
            self.misses,
            self.degraded_misses,
            self.hit_rate(),
            self.entries.fresh,
            self.entries.stale,
            self.entries.invalid,
            self.invalidations
        )
    }
}
