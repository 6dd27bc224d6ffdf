//! # Context Orchestration
//!
//! A context request fans out concurrently to the semantic cache, the
//! decision ledger and every registered [`ContextProvider`]. Each source runs
//! as its own task under a per-request and a global concurrency limit, with a
//! per-provider timeout and circuit breaker. Whatever returns before the
//! request deadline is merged by [`ContextMerger`](crate::merge::ContextMerger);
//! the rest is cancelled and reported as a failure.

pub mod breaker;
pub mod fetch;
pub mod provider;
pub mod types;

pub use breaker::{BreakerState, CircuitBreaker};
pub use fetch::ContextOrchestrator;
pub use provider::{ContextProvider, ProviderRegistry, RegisteredProvider};
pub use types::{ContextQuery, ContextResponse, ContextStatus, FetchOptions, SourceFailure};
