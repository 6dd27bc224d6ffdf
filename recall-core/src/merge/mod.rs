//! Context merging: deduplication, decision weighting and ranking

pub mod candidate;
pub mod merger;

pub use candidate::{CandidateSource, ContextCandidate, DecisionLink};
pub use merger::{ContextMerger, DecisionWeighting};
