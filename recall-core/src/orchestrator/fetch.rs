//! Concurrent fan-out over cache, decisions and providers

use crate::cache::{CacheLookup, CacheStore};
use crate::config::{OverloadPolicy, RecallConfig};
use crate::decision::{DecisionFilter, DecisionTracker, ScoredDecision};
use crate::error::{ErrorKind, RecallError, Result};
use crate::merge::{CandidateSource, ContextCandidate, ContextMerger, DecisionWeighting};
use crate::orchestrator::breaker::BreakerState;
use crate::orchestrator::provider::{ContextProvider, ProviderRegistry, RegisteredProvider};
use crate::orchestrator::types::{ContextQuery, ContextResponse, ContextStatus, FetchOptions, SourceFailure};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const CACHE_SOURCE: &str = "cache";
const DECISION_SOURCE: &str = "decisions";

enum SourceOutput {
    Cache(CacheLookup),
    Decisions(Vec<ScoredDecision>),
    Provider(String, Vec<ContextCandidate>),
}

/// Fans a context request out to every source, then merges what came back
/// before the deadline.
///
/// Every source call holds one permit from the per-request semaphore and
/// one from the global in-flight semaphore shared by all clones.
#[derive(Clone)]
pub struct ContextOrchestrator {
    cache: CacheStore,
    decisions: DecisionTracker,
    providers: Arc<RwLock<ProviderRegistry>>,
    merger: ContextMerger,
    global: Arc<Semaphore>,
    config: RecallConfig,
}

impl ContextOrchestrator {
    pub fn new(cache: CacheStore, decisions: DecisionTracker, config: RecallConfig) -> Self {
        Self {
            cache,
            decisions,
            providers: Arc::new(RwLock::new(ProviderRegistry::from_config(&config))),
            merger: ContextMerger::new(),
            global: Arc::new(Semaphore::new(config.global_max_in_flight.max(1))),
            config,
        }
    }

    pub async fn register_provider(&self, provider: Arc<dyn ContextProvider>) -> Result<()> {
        self.providers.write().await.register(provider)
    }

    pub async fn register_provider_with_timeout(
        &self,
        provider: Arc<dyn ContextProvider>,
        timeout: std::time::Duration,
    ) -> Result<()> {
        self.providers.write().await.register_with_timeout(provider, timeout)
    }

    pub async fn unregister_provider(&self, name: &str) -> bool {
        self.providers.write().await.unregister(name)
    }

    pub async fn provider_names(&self) -> Vec<String> {
        self.providers.read().await.names()
    }

    pub async fn breaker_state(&self, provider: &str) -> Option<BreakerState> {
        self.providers.read().await.get(provider).map(|p| p.breaker.state())
    }

    /// Source calls currently holding a global permit
    pub fn in_flight(&self) -> usize {
        self.config
            .global_max_in_flight
            .max(1)
            .saturating_sub(self.global.available_permits())
    }

    /// Fetch, merge and rank context for `query`.
    ///
    /// Failing sources are reported in `failures` and left out of the merge.
    /// The call itself only fails on invalid input, or when every source was
    /// turned away by the global in-flight cap.
    pub async fn fetch_context(&self, query: ContextQuery, options: &FetchOptions) -> Result<ContextResponse> {
        if query.text.trim().is_empty() && query.vector.is_empty() {
            return Err(RecallError::validation("context query has neither text nor vector"));
        }

        let started = Instant::now();
        let deadline = options.deadline.unwrap_or_else(|| self.config.deadline(options.cold));
        let deadline_at = tokio::time::Instant::now() + deadline;
        let query = Arc::new(query);
        let per_request = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let mut tasks: JoinSet<(String, Result<SourceOutput>)> = JoinSet::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();

        if options.include_cache {
            pending.insert(CACHE_SOURCE.to_string());
            let cache = self.cache.clone();
            let admission = self.admission(&per_request);
            let query = query.clone();
            tasks.spawn(async move {
                let result = async {
                    let _permits = admission.acquire().await?;
                    let lookup = cache.lookup(&query.namespace, &query.text, &query.vector).await;
                    if lookup.is_degraded() {
                        return Err(RecallError::TransientStore("cache store unavailable".to_string()));
                    }
                    Ok(SourceOutput::Cache(lookup))
                }
                .await;
                (CACHE_SOURCE.to_string(), result)
            });
        }

        if options.include_decisions {
            pending.insert(DECISION_SOURCE.to_string());
            let tracker = self.decisions.clone();
            let admission = self.admission(&per_request);
            let query = query.clone();
            let filter = options.decision_filter.clone().unwrap_or_else(|| DecisionFilter {
                entities: query.entities.clone(),
                ..DecisionFilter::new()
            });
            let k = self.config.decision_retrieval_k;
            tasks.spawn(async move {
                let result = async {
                    let _permits = admission.acquire().await?;
                    let ranked = tracker.retrieve_for_text(&query.text, &filter, k).await?;
                    Ok(SourceOutput::Decisions(ranked))
                }
                .await;
                (DECISION_SOURCE.to_string(), result)
            });
        }

        if options.include_providers {
            let providers = self.providers.read().await.snapshot();
            for registered in providers {
                let label = CandidateSource::Provider(registered.name().to_string()).to_string();
                pending.insert(label.clone());
                let admission = self.admission(&per_request);
                let query = query.clone();
                tasks.spawn(async move {
                    let result = call_provider(registered, admission, &query).await;
                    (label, result)
                });
            }
        }

        let attempted = pending.len();
        let mut candidates = Vec::new();
        let mut decisions = Vec::new();
        let mut failures = Vec::new();
        let mut cache_hit = false;
        let mut succeeded = 0usize;
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline_at, tasks.join_next()).await {
                Ok(Some(Ok((label, result)))) => {
                    pending.remove(&label);
                    match result {
                        Ok(output) => {
                            succeeded += 1;
                            match output {
                                SourceOutput::Cache(lookup) => {
                                    if let CacheLookup::Hit { entry, score, .. } = lookup {
                                        cache_hit = true;
                                        candidates.push(ContextCandidate::from_cache_entry(&entry, score));
                                    }
                                }
                                SourceOutput::Decisions(ranked) => {
                                    for scored in ranked {
                                        candidates.push(ContextCandidate::from_decision(&scored));
                                        decisions.push(scored.record);
                                    }
                                }
                                SourceOutput::Provider(name, found) => {
                                    candidates.extend(found.into_iter().map(|mut candidate| {
                                        candidate.source = CandidateSource::Provider(name.clone());
                                        candidate
                                    }));
                                }
                            }
                        }
                        Err(e) => {
                            debug!(source = %label, error = %e, "Context source excluded from merge");
                            failures.push(SourceFailure::new(label, &e));
                        }
                    }
                }
                Ok(Some(Err(join_error))) => {
                    error!(error = %join_error, "Context source task did not complete");
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!(
                deadline_ms = deadline.as_millis() as u64,
                outstanding = pending.len(),
                "Context deadline reached, cancelling outstanding sources"
            );
            tasks.shutdown().await;
        }
        for label in std::mem::take(&mut pending) {
            let e = if timed_out {
                RecallError::ProviderTimeout {
                    provider: label.clone(),
                    timeout_ms: deadline.as_millis() as u64,
                }
            } else {
                RecallError::ProviderFailed {
                    provider: label.clone(),
                    message: "task aborted".to_string(),
                }
            };
            failures.push(SourceFailure::new(label, &e));
        }

        if attempted > 0
            && succeeded == 0
            && failures.iter().all(|f| f.kind == ErrorKind::ConcurrencyLimitExceeded)
        {
            warn!(sources = attempted, "Every context source was rejected by the in-flight cap");
            return Err(RecallError::ConcurrencyLimitExceeded {
                limit: self.config.global_max_in_flight,
            });
        }

        let mut weighting = DecisionWeighting::from(&self.config.scoring).with_query_entities(query.entities.iter().cloned());
        if let Some(enabled) = options.entity_overlap {
            weighting = weighting.with_entity_overlap(enabled);
        }
        if let Some(enabled) = options.co_sign {
            weighting = weighting.with_co_sign(enabled);
        }
        if let Some(limit) = options.limit {
            weighting = weighting.with_limit(limit);
        }

        let candidates = self.merger.merge(candidates, &weighting);
        let status = if attempted > 0 && succeeded == 0 {
            ContextStatus::AllSourcesFailed
        } else if candidates.is_empty() {
            ContextStatus::NoContext
        } else {
            ContextStatus::Context
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        info!(
            namespace = %query.namespace,
            sources = attempted,
            failed = failures.len(),
            candidates = candidates.len(),
            cache_hit,
            latency_ms,
            "Context fetched: {:?}",
            status
        );

        Ok(ContextResponse {
            candidates,
            decisions,
            cache_hit,
            latency_ms,
            status,
            failures,
        })
    }

    fn admission(&self, per_request: &Arc<Semaphore>) -> Admission {
        Admission {
            per_request: per_request.clone(),
            global: self.global.clone(),
            policy: self.config.overload_policy,
            limit: self.config.global_max_in_flight,
        }
    }
}

impl std::fmt::Debug for ContextOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextOrchestrator")
            .field("max_concurrency", &self.config.max_concurrency)
            .field("global_max_in_flight", &self.config.global_max_in_flight)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Permits a source call must hold
struct Admission {
    per_request: Arc<Semaphore>,
    global: Arc<Semaphore>,
    policy: OverloadPolicy,
    limit: usize,
}

impl Admission {
    async fn acquire(self) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let rejected = || RecallError::ConcurrencyLimitExceeded { limit: self.limit };

        let local = self.per_request.clone().acquire_owned().await.map_err(|_| rejected())?;
        let global = match self.policy {
            OverloadPolicy::Queue => self.global.clone().acquire_owned().await.map_err(|_| rejected())?,
            OverloadPolicy::Reject => self.global.clone().try_acquire_owned().map_err(|_| rejected())?,
        };
        Ok((local, global))
    }
}

async fn call_provider(registered: RegisteredProvider, admission: Admission, query: &ContextQuery) -> Result<SourceOutput> {
    let name = registered.name().to_string();
    if !registered.breaker.allow() {
        return Err(RecallError::CircuitOpen { provider: name });
    }

    let _permits = admission.acquire().await?;
    match tokio::time::timeout(registered.timeout, registered.provider.fetch(query)).await {
        Ok(Ok(found)) => {
            registered.breaker.record_success();
            Ok(SourceOutput::Provider(name, found))
        }
        Ok(Err(e)) => {
            registered.breaker.record_failure();
            warn!(provider = %name, error = %e, "Context provider failed");
            Err(match e {
                RecallError::ProviderFailed { .. } | RecallError::ProviderTimeout { .. } => e,
                other => RecallError::ProviderFailed {
                    provider: name,
                    message: other.to_string(),
                },
            })
        }
        Err(_) => {
            registered.breaker.record_failure();
            warn!(
                provider = %name,
                timeout_ms = registered.timeout.as_millis() as u64,
                "Context provider timed out"
            );
            Err(RecallError::ProviderTimeout {
                provider: name,
                timeout_ms: registered.timeout.as_millis() as u64,
            })
        }
    }
}
