//! # Semantic Cache
//!
//! Stores prior (query → response) generations and serves them back for
//! identical or semantically close queries.
//!
//! ## Features
//!
//! - **Exact fast path**: SHA-256 of namespace + normalized query text
//! - **Semantic fallback**: cosine similarity against a per-namespace threshold
//! - **TTL from last verification**: fresh → stale → invalid lifecycle
//! - **Event-driven invalidation**: entity changes, decision supersedence,
//!   namespace flushes and idle-session cleanup
//! - **Degrade, don't fail**: store errors become cache misses on the read path
//!
//! ## Example
//!
//! ```rust
//! use recall_core::cache::{CacheEntry, CacheStore};
//! use recall_core::storage::MemoryStore;
//! use recall_core::RecallConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = CacheStore::open(Arc::new(MemoryStore::new()), RecallConfig::default()).await?;
//!
//! let entry = CacheEntry::new("default", "how is the pool sized", vec![1.0, 0.0], "4 connections", Duration::from_secs(3600));
//! cache.put(entry).await?;
//!
//! let lookup = cache.lookup("default", "how is the pool sized", &[1.0, 0.0]).await;
//! assert!(lookup.is_hit());
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod invalidation;
pub mod store;
pub mod types;

pub use entry::{CacheEntry, EntryState};
pub use invalidation::{CleanupReport, InvalidationEvent, InvalidationManager, InvalidationReason, MaintenanceHandle};
pub use store::CacheStore;
pub use types::{CacheLookup, CacheStats, LookupKind};
