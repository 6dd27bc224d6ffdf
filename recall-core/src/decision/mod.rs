//! Decision ledger
//!
//! Decisions are never edited in place. A contradicting decision supersedes
//! the one it replaces, and readers resolve `superseded_by` chains to the
//! current head.

pub mod record;
pub mod tracker;

pub use record::{normalize_head, DecisionFilter, DecisionRecord, DecisionStatus, SubmitOutcome};
pub use tracker::{DecisionTracker, ScoredDecision};
