//! Pluggable context sources

use crate::config::RecallConfig;
use crate::error::{RecallError, Result};
use crate::merge::ContextCandidate;
use crate::orchestrator::breaker::CircuitBreaker;
use crate::orchestrator::types::ContextQuery;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// An external source of context candidates
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Unique name, used for the candidate source tag and breaker
    fn name(&self) -> &str;

    async fn fetch(&self, query: &ContextQuery) -> Result<Vec<ContextCandidate>>;
}

/// A provider with its own timeout and breaker
#[derive(Clone)]
pub struct RegisteredProvider {
    pub provider: Arc<dyn ContextProvider>,
    pub timeout: Duration,
    pub breaker: Arc<CircuitBreaker>,
}

impl RegisteredProvider {
    pub fn name(&self) -> &str {
        self.provider.name()
    }
}

/// Ordered set of providers consulted by every context request
pub struct ProviderRegistry {
    entries: Vec<RegisteredProvider>,
    default_timeout: Duration,
    failure_threshold: u32,
    cooldown: Duration,
}

impl ProviderRegistry {
    pub fn new(default_timeout: Duration, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            entries: Vec::new(),
            default_timeout,
            failure_threshold,
            cooldown,
        }
    }

    pub fn from_config(config: &RecallConfig) -> Self {
        Self::new(
            config.provider_timeout(),
            config.breaker_failure_threshold,
            config.breaker_cooldown(),
        )
    }

    /// Register a provider with the default timeout
    pub fn register(&mut self, provider: Arc<dyn ContextProvider>) -> Result<()> {
        let timeout = self.default_timeout;
        self.register_with_timeout(provider, timeout)
    }

    pub fn register_with_timeout(&mut self, provider: Arc<dyn ContextProvider>, timeout: Duration) -> Result<()> {
        let name = provider.name().to_string();
        if name.trim().is_empty() {
            return Err(RecallError::Config("provider name is empty".to_string()));
        }
        if self.entries.iter().any(|entry| entry.name() == name) {
            return Err(RecallError::Config(format!("provider {} is already registered", name)));
        }

        info!(provider = %name, timeout_ms = timeout.as_millis() as u64, "Registered context provider");
        let breaker = Arc::new(CircuitBreaker::new(&name, self.failure_threshold, self.cooldown));
        self.entries.push(RegisteredProvider {
            provider,
            timeout,
            breaker,
        });
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.name() != name);
        self.entries.len() != before
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredProvider> {
        self.entries.iter().find(|entry| entry.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the registered providers for one request
    pub fn snapshot(&self) -> Vec<RegisteredProvider> {
        self.entries.clone()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
