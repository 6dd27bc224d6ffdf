//! Similarity primitives shared by the cache and the decision ledger
//!
//! - Cosine similarity (primary), clamped to [0, 1]
//! - Jaccard over token sets (secondary, short/sparse queries)
//! - Exact or LSH candidate selection
//! - Pluggable text embedding

pub mod embed;
pub mod index;
pub mod lexical;
pub mod vector;

pub use embed::{Embedder, HashingEmbedder};
pub use index::{ScoredId, SimilarityIndex};
pub use lexical::{jaccard, normalize_text, token_set, tokenize};
pub use vector::{cosine_similarity, IndexDiagnostic};
