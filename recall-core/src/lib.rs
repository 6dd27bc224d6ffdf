//! # Recall
//!
//! A decision-aware semantic cache and context-merging layer for LLM
//! agents.
//!
//! ## Features
//!
//! - Semantic cache of prior generations with exact and vector lookups
//! - TTL lifecycle (fresh → stale → invalid) with background maintenance
//! - Append-only decision ledger with automatic contradiction detection
//! - Concurrent fan-out to the cache, the ledger and pluggable providers,
//!   with per-provider timeouts and circuit breakers
//! - Decision-weighted merge and ranking of everything that came back
//! - SQLite persistence (sqlx, WAL) or an in-memory store
//!
//! ## Quick Start
//!
//! ```no_run
//! use recall_core::{ContextQuery, FetchOptions, Generation, Recall, RecallConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let recall = Recall::open_sqlite("recall.db", RecallConfig::from_env()?).await?;
//!
//!     let outcome = recall
//!         .submit_decision("Use SQLite for storage", ["storage"], ["src/db.rs"])
//!         .await?;
//!     println!("decision {}", outcome.decision_id);
//!
//!     let question = "which database do we use";
//!     let vector = recall.embed(question);
//!     recall
//!         .store_generation(Generation::new(question, vector.clone(), "SQLite, see src/db.rs"))
//!         .await?;
//!
//!     let response = recall
//!         .fetch_context(
//!             ContextQuery::new(question, vector).with_entities(["storage"]),
//!             &FetchOptions::default(),
//!         )
//!         .await?;
//!     for candidate in &response.candidates {
//!         println!("[{}] {:.2} {}", candidate.source, candidate.adjusted_score, candidate.payload);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! `RecallConfig::from_env` reads `RECALL_*` variables (a `.env` file is
//! honored), `RecallConfig::from_json_file` reads a JSON document, and
//! `RecallConfig::builder` covers programmatic setup.

pub mod cache;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod merge;
pub mod orchestrator;
pub mod similarity;
pub mod storage;

pub use cache::{CacheEntry, CacheLookup, CacheStats, CacheStore, CleanupReport, EntryState, InvalidationEvent};
pub use config::{OverloadPolicy, RecallConfig, RecallConfigBuilder, SearchStrategy};
pub use decision::{DecisionFilter, DecisionRecord, DecisionStatus, DecisionTracker, SubmitOutcome};
pub use engine::{Generation, InvalidationTarget, Recall};
pub use error::{ErrorKind, RecallError, Result};
pub use merge::{CandidateSource, ContextCandidate, ContextMerger, DecisionWeighting};
pub use orchestrator::{ContextOrchestrator, ContextProvider, ContextQuery, ContextResponse, ContextStatus, FetchOptions};
pub use similarity::{Embedder, HashingEmbedder, SimilarityIndex};
pub use storage::{MemoryStore, SqliteStore};
