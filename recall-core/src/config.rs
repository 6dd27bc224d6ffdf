//! Configuration for the recall layer
//!
//! A single [`RecallConfig`] is constructed once at process start and handed
//! to every component. It can be built in code, loaded from `RECALL_*`
//! environment variables (with `.env` support) or read from a JSON file.

use crate::error::{RecallError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Namespace used when a caller does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// What to do when the global in-flight cap is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadPolicy {
    /// Wait for a slot until the request deadline
    #[default]
    Queue,
    /// Fail the call immediately with `ConcurrencyLimitExceeded`
    Reject,
}

/// Candidate selection strategy for the similarity index
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SearchStrategy {
    /// Brute-force scan of every vector (recall = 1.0)
    #[default]
    Exact,
    /// Random-hyperplane LSH; more tables raise recall and cost
    Lsh { tables: usize, bits: usize },
}

/// Local retry policy for transient store errors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 200,
        }
    }
}

/// Similarity index tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub strategy: SearchStrategy,
    /// Queries with at most this many tokens blend in Jaccard similarity
    pub short_query_max_tokens: usize,
    /// Vectors with a smaller non-zero fraction are treated as sparse
    pub sparse_vector_ratio: f32,
    /// Weight of the lexical signal when it is blended in
    pub lexical_weight: f32,
    /// Neighbours examined per semantic lookup
    pub search_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::Exact,
            short_query_max_tokens: 3,
            sparse_vector_ratio: 0.1,
            lexical_weight: 0.3,
            search_k: 10,
        }
    }
}

/// Score adjustments applied by the context merger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub open_decision_bonus: f32,
    pub superseded_penalty: f32,
    pub entity_overlap_bonus: f32,
    pub co_sign_bonus: f32,
    pub enable_entity_overlap: bool,
    pub enable_co_sign: bool,
    /// Rank cut-off for the co-sign bonus
    pub co_sign_top_n: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            open_decision_bonus: 0.2,
            superseded_penalty: 0.3,
            entity_overlap_bonus: 0.15,
            co_sign_bonus: 0.1,
            enable_entity_overlap: false,
            enable_co_sign: false,
            co_sign_top_n: 5,
        }
    }
}

/// Configuration for the whole recall layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    /// Default semantic cache-hit threshold (0.0 - 1.0)
    pub similarity_threshold: f32,

    /// Per-namespace overrides of `similarity_threshold`
    pub namespace_thresholds: HashMap<String, f32>,

    /// Default time-to-live of a cache entry, measured from last verification
    pub ttl_seconds: u64,

    /// TTL jitter factor (0.0 - 1.0), 0 disables jitter
    pub ttl_jitter: f64,

    /// Head similarity at which two open decisions contradict
    pub contradiction_threshold: f32,

    /// Per-request fan-out limit
    pub max_concurrency: usize,

    /// In-flight source calls across all requests
    pub global_max_in_flight: usize,

    pub overload_policy: OverloadPolicy,

    /// Rows touched per maintenance batch
    pub cleanup_batch_size: usize,

    /// Maintenance batches in flight at once
    pub cleanup_concurrency: usize,

    /// Re-queues of a failed maintenance batch within one cycle
    pub max_batch_retries: u32,

    pub cleanup_interval_secs: u64,

    /// How long a stale entry may wait for re-verification before invalidation
    pub stale_grace_secs: u64,

    /// How long invalid rows are kept before being purged
    pub invalid_retention_secs: u64,

    /// Sessions idle longer than this release their cache entries
    pub session_idle_timeout_secs: u64,

    pub max_supersedence_hops: usize,

    /// Upper bound on a single cache-store call on the read path
    pub warm_path_timeout_ms: u64,

    pub warm_deadline_ms: u64,
    pub cold_deadline_ms: u64,

    /// Per-source call timeout inside a request
    pub provider_timeout_ms: u64,

    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,

    /// Decisions returned per context request
    pub decision_retrieval_k: usize,

    /// Decisions scoring below this head similarity are left out of a response
    pub decision_min_score: f32,

    pub retry: RetryPolicy,
    pub index: IndexConfig,
    pub scoring: ScoringConfig,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            namespace_thresholds: HashMap::new(),
            ttl_seconds: 86_400,
            ttl_jitter: 0.0,
            contradiction_threshold: 0.8,
            max_concurrency: 8,
            global_max_in_flight: 64,
            overload_policy: OverloadPolicy::Queue,
            cleanup_batch_size: 500,
            cleanup_concurrency: 2,
            max_batch_retries: 2,
            cleanup_interval_secs: 300,
            stale_grace_secs: 3_600,
            invalid_retention_secs: 7 * 86_400,
            session_idle_timeout_secs: 86_400,
            max_supersedence_hops: 20,
            warm_path_timeout_ms: 200,
            warm_deadline_ms: 500,
            cold_deadline_ms: 2_000,
            provider_timeout_ms: 400,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
            decision_retrieval_k: 10,
            decision_min_score: 0.1,
            retry: RetryPolicy::default(),
            index: IndexConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl RecallConfig {
    /// Create a new builder for the configuration
    pub fn builder() -> RecallConfigBuilder {
        RecallConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(RecallError::Config(format!("{name} must be between 0.0 and 1.0")))
            }
        };

        unit("similarity_threshold", self.similarity_threshold)?;
        unit("contradiction_threshold", self.contradiction_threshold)?;
        unit("decision_min_score", self.decision_min_score)?;
        unit("index.lexical_weight", self.index.lexical_weight)?;
        for (ns, threshold) in &self.namespace_thresholds {
            unit(&format!("namespace_thresholds[{ns}]"), *threshold)?;
        }

        if self.ttl_jitter < 0.0 || self.ttl_jitter > 1.0 {
            return Err(RecallError::Config("ttl_jitter must be between 0.0 and 1.0".into()));
        }

        let positive = [
            ("ttl_seconds", self.ttl_seconds as usize),
            ("max_concurrency", self.max_concurrency),
            ("global_max_in_flight", self.global_max_in_flight),
            ("cleanup_batch_size", self.cleanup_batch_size),
            ("cleanup_concurrency", self.cleanup_concurrency),
            ("max_supersedence_hops", self.max_supersedence_hops),
            ("retry.max_attempts", self.retry.max_attempts as usize),
            ("index.search_k", self.index.search_k),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RecallError::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.max_concurrency > self.global_max_in_flight {
            return Err(RecallError::Config(
                "max_concurrency cannot exceed global_max_in_flight".into(),
            ));
        }

        if let SearchStrategy::Lsh { tables, bits } = self.index.strategy {
            if tables == 0 || bits == 0 || bits > 64 {
                return Err(RecallError::Config(
                    "lsh needs at least one table and 1-64 bits".into(),
                ));
            }
        }

        Ok(())
    }

    /// Threshold in force for a namespace
    pub fn threshold_for(&self, namespace: &str) -> f32 {
        self.namespace_thresholds
            .get(namespace)
            .copied()
            .unwrap_or(self.similarity_threshold)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Calculate actual TTL with jitter applied
    pub fn ttl_with_jitter(&self, base: Duration) -> Duration {
        if self.ttl_jitter == 0.0 {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        Duration::from_secs_f64((base_secs + jitter).max(1.0))
    }

    pub fn warm_path_timeout(&self) -> Duration {
        Duration::from_millis(self.warm_path_timeout_ms)
    }

    pub fn deadline(&self, cold: bool) -> Duration {
        if cold {
            Duration::from_millis(self.cold_deadline_ms)
        } else {
            Duration::from_millis(self.warm_deadline_ms)
        }
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    /// Load from `RECALL_*` environment variables, reading `.env` first
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a JSON file; absent keys fall back to defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RecallError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>> {
            match raw {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| RecallError::Config(format!("{key} has invalid value {value:?}"))),
            }
        }

        let mut config = Self::default();
        let get = |key: &str| lookup(key);

        if let Some(v) = parse("RECALL_SIMILARITY_THRESHOLD", get("RECALL_SIMILARITY_THRESHOLD"))? {
            config.similarity_threshold = v;
        }
        if let Some(v) = parse("RECALL_TTL_SECONDS", get("RECALL_TTL_SECONDS"))? {
            config.ttl_seconds = v;
        }
        if let Some(v) = parse("RECALL_CONTRADICTION_THRESHOLD", get("RECALL_CONTRADICTION_THRESHOLD"))? {
            config.contradiction_threshold = v;
        }
        if let Some(v) = parse("RECALL_DECISION_MIN_SCORE", get("RECALL_DECISION_MIN_SCORE"))? {
            config.decision_min_score = v;
        }
        if let Some(v) = parse("RECALL_MAX_CONCURRENCY", get("RECALL_MAX_CONCURRENCY"))? {
            config.max_concurrency = v;
        }
        if let Some(v) = parse("RECALL_GLOBAL_MAX_IN_FLIGHT", get("RECALL_GLOBAL_MAX_IN_FLIGHT"))? {
            config.global_max_in_flight = v;
        }
        if let Some(v) = parse("RECALL_CLEANUP_BATCH_SIZE", get("RECALL_CLEANUP_BATCH_SIZE"))? {
            config.cleanup_batch_size = v;
        }
        if let Some(v) = parse("RECALL_MAX_SUPERSEDENCE_HOPS", get("RECALL_MAX_SUPERSEDENCE_HOPS"))? {
            config.max_supersedence_hops = v;
        }
        if let Some(v) = parse("RECALL_CLEANUP_INTERVAL_SECS", get("RECALL_CLEANUP_INTERVAL_SECS"))? {
            config.cleanup_interval_secs = v;
        }
        if let Some(v) = parse("RECALL_WARM_DEADLINE_MS", get("RECALL_WARM_DEADLINE_MS"))? {
            config.warm_deadline_ms = v;
        }
        if let Some(v) = parse("RECALL_COLD_DEADLINE_MS", get("RECALL_COLD_DEADLINE_MS"))? {
            config.cold_deadline_ms = v;
        }
        if let Some(policy) = get("RECALL_OVERLOAD_POLICY") {
            config.overload_policy = match policy.trim().to_ascii_lowercase().as_str() {
                "queue" => OverloadPolicy::Queue,
                "reject" => OverloadPolicy::Reject,
                other => {
                    return Err(RecallError::Config(format!(
                        "RECALL_OVERLOAD_POLICY has invalid value {other:?}"
                    )))
                }
            };
        }
        if let Some(v) = parse::<bool>("RECALL_ENABLE_CO_SIGN", get("RECALL_ENABLE_CO_SIGN"))? {
            config.scoring.enable_co_sign = v;
        }
        if let Some(v) = parse::<bool>("RECALL_ENABLE_ENTITY_OVERLAP", get("RECALL_ENABLE_ENTITY_OVERLAP"))? {
            config.scoring.enable_entity_overlap = v;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Builder for [`RecallConfig`] with validation on build
#[derive(Debug, Default)]
pub struct RecallConfigBuilder {
    config: RecallConfig,
}

impl RecallConfigBuilder {
    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.config.similarity_threshold = threshold;
        self
    }

    pub fn namespace_threshold(mut self, namespace: impl Into<String>, threshold: f32) -> Self {
        self.config.namespace_thresholds.insert(namespace.into(), threshold);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl_seconds = ttl.as_secs().max(1);
        self
    }

    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.config.ttl_jitter = jitter;
        self
    }

    pub fn contradiction_threshold(mut self, threshold: f32) -> Self {
        self.config.contradiction_threshold = threshold;
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.config.max_concurrency = max;
        self
    }

    pub fn global_max_in_flight(mut self, max: usize) -> Self {
        self.config.global_max_in_flight = max;
        self
    }

    pub fn overload_policy(mut self, policy: OverloadPolicy) -> Self {
        self.config.overload_policy = policy;
        self
    }

    pub fn cleanup_batch_size(mut self, size: usize) -> Self {
        self.config.cleanup_batch_size = size;
        self
    }

    pub fn cleanup_concurrency(mut self, n: usize) -> Self {
        self.config.cleanup_concurrency = n;
        self
    }

    pub fn stale_grace(mut self, grace: Duration) -> Self {
        self.config.stale_grace_secs = grace.as_secs();
        self
    }

    pub fn invalid_retention(mut self, retention: Duration) -> Self {
        self.config.invalid_retention_secs = retention.as_secs();
        self
    }

    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_idle_timeout_secs = timeout.as_secs();
        self
    }

    pub fn max_supersedence_hops(mut self, hops: usize) -> Self {
        self.config.max_supersedence_hops = hops;
        self
    }

    pub fn warm_path_timeout(mut self, timeout: Duration) -> Self {
        self.config.warm_path_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn deadlines(mut self, warm: Duration, cold: Duration) -> Self {
        self.config.warm_deadline_ms = warm.as_millis() as u64;
        self.config.cold_deadline_ms = cold.as_millis() as u64;
        self
    }

    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.config.provider_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn circuit_breaker(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.config.breaker_failure_threshold = failure_threshold;
        self.config.breaker_cooldown_secs = cooldown.as_secs();
        self
    }

    pub fn decision_min_score(mut self, score: f32) -> Self {
        self.config.decision_min_score = score;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn search_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.config.index.strategy = strategy;
        self
    }

    pub fn index(mut self, index: IndexConfig) -> Self {
        self.config.index = index;
        self
    }

    pub fn scoring(mut self, scoring: ScoringConfig) -> Self {
        self.config.scoring = scoring;
        self
    }

    /// Build the configuration, rejecting out-of-range values
    pub fn build(self) -> Result<RecallConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Preset configurations for common deployments
impl RecallConfig {
    /// Interactive assistants: tight deadlines, short TTL
    pub fn low_latency() -> Self {
        Self {
            ttl_seconds: 3_600,
            warm_path_timeout_ms: 100,
            warm_deadline_ms: 250,
            cold_deadline_ms: 1_000,
            provider_timeout_ms: 200,
            ..Default::default()
        }
    }

    /// Slowly changing knowledge: long TTL, LSH candidate selection
    pub fn long_lived() -> Self {
        Self {
            ttl_seconds: 7 * 86_400,
            stale_grace_secs: 86_400,
            index: IndexConfig {
                strategy: SearchStrategy::Lsh { tables: 8, bits: 12 },
                ..IndexConfig::default()
            },
            ..Default::default()
        }
    }
}
