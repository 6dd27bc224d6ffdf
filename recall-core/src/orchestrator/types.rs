//! Request and response types for context fetches

use crate::config::DEFAULT_NAMESPACE;
use crate::decision::{DecisionFilter, DecisionRecord};
use crate::error::{ErrorKind, RecallError};
use crate::merge::ContextCandidate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// A context request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextQuery {
    pub text: String,
    /// Query embedding in the cache's vector space
    pub vector: Vec<f32>,
    pub namespace: String,
    pub session_id: Option<String>,
    /// Entities the query is about; scopes decision retrieval
    pub entities: BTreeSet<String>,
}

impl ContextQuery {
    pub fn new(text: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            text: text.into(),
            vector,
            namespace: DEFAULT_NAMESPACE.to_string(),
            session_id: None,
            entities: BTreeSet::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
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
}

/// Per-request knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Use the cold-path deadline
    pub cold: bool,
    /// Overrides the warm/cold deadline
    pub deadline: Option<Duration>,
    pub limit: Option<usize>,
    pub include_cache: bool,
    pub include_decisions: bool,
    pub include_providers: bool,
    /// Defaults to any decision sharing an entity with the query
    pub decision_filter: Option<DecisionFilter>,
    pub entity_overlap: Option<bool>,
    pub co_sign: Option<bool>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cold: false,
            deadline: None,
            limit: None,
            include_cache: true,
            include_decisions: true,
            include_providers: true,
            decision_filter: None,
            entity_overlap: None,
            co_sign: None,
        }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cold(mut self) -> Self {
        self.cold = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_decision_filter(mut self, filter: DecisionFilter) -> Self {
        self.decision_filter = Some(filter);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.include_cache = false;
        self
    }

    pub fn without_decisions(mut self) -> Self {
        self.include_decisions = false;
        self
    }

    pub fn without_providers(mut self) -> Self {
        self.include_providers = false;
        self
    }

    pub fn with_entity_overlap(mut self, enabled: bool) -> Self {
        self.entity_overlap = Some(enabled);
        self
    }

    pub fn with_co_sign(mut self, enabled: bool) -> Self {
        self.co_sign = Some(enabled);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    /// At least one candidate survived the merge
    Context,
    /// Sources answered but nothing matched
    NoContext,
    /// Every source failed or timed out
    AllSourcesFailed,
}

/// A source that is absent from the merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl SourceFailure {
    pub fn new(source: impl Into<String>, error: &RecallError) -> Self {
        Self {
            source: source.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Result of `fetch_context`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextResponse {
    /// Merged, ranked, deduplicated
    pub candidates: Vec<ContextCandidate>,
    /// Decision records consulted for this request
    pub decisions: Vec<DecisionRecord>,
    pub cache_hit: bool,
    pub latency_ms: u64,
    pub status: ContextStatus,
    pub failures: Vec<SourceFailure>,
}

impl ContextResponse {
    pub fn has_context(&self) -> bool {
        self.status == ContextStatus::Context
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.source.as_str()).collect()
    }
}
