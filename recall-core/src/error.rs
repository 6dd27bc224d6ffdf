//! Error types for recall operations
//!
//! The taxonomy separates failures that are absorbed locally (transient store
//! errors, provider timeouts) from failures that must reach the caller tagged
//! with their kind (validation and data-integrity errors).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`RecallError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientStore,
    PermanentValidation,
    SupersedenceChainTooLong,
    ProviderTimeout,
    ConcurrencyLimitExceeded,
    ProviderFailed,
    CircuitOpen,
    NotFound,
    Config,
    Serialization,
    Storage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::TransientStore => "transient_store",
            ErrorKind::PermanentValidation => "permanent_validation",
            ErrorKind::SupersedenceChainTooLong => "supersedence_chain_too_long",
            ErrorKind::ProviderTimeout => "provider_timeout",
            ErrorKind::ConcurrencyLimitExceeded => "concurrency_limit_exceeded",
            ErrorKind::ProviderFailed => "provider_failed",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Config => "config",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// Main error type for recall operations
#[derive(Error, Debug, Clone)]
pub enum RecallError {
    /// DB/network blip, retried locally with bounded backoff
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Malformed vector, entity or record, never retried
    #[error("Validation error: {0}")]
    PermanentValidation(String),

    /// Supersedence pointers did not resolve within the hop limit (or cycled)
    #[error("Supersedence chain from {start_id} exceeds {max_hops} hops")]
    SupersedenceChainTooLong { start_id: String, max_hops: usize },

    /// A context source did not answer in time
    #[error("Provider {provider} timed out after {timeout_ms}ms")]
    ProviderTimeout { provider: String, timeout_ms: u64 },

    /// Backpressure: no in-flight slot was available
    #[error("Concurrency limit exceeded: all {limit} in-flight slots are in use")]
    ConcurrencyLimitExceeded { limit: usize },

    /// A context source returned an error
    #[error("Provider {provider} failed: {message}")]
    ProviderFailed { provider: String, message: String },

    /// The circuit breaker for a source is open
    #[error("Circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Non-transient backend failure
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type alias for recall operations
pub type Result<T> = std::result::Result<T, RecallError>;

impl RecallError {
    /// The taxonomy bucket of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecallError::TransientStore(_) => ErrorKind::TransientStore,
            RecallError::PermanentValidation(_) => ErrorKind::PermanentValidation,
            RecallError::SupersedenceChainTooLong { .. } => ErrorKind::SupersedenceChainTooLong,
            RecallError::ProviderTimeout { .. } => ErrorKind::ProviderTimeout,
            RecallError::ConcurrencyLimitExceeded { .. } => ErrorKind::ConcurrencyLimitExceeded,
            RecallError::ProviderFailed { .. } => ErrorKind::ProviderFailed,
            RecallError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            RecallError::NotFound(_) => ErrorKind::NotFound,
            RecallError::Config(_) => ErrorKind::Config,
            RecallError::Serialization(_) => ErrorKind::Serialization,
            RecallError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether a local retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, RecallError::TransientStore(_))
    }

    /// Shorthand for a validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        RecallError::PermanentValidation(message.into())
    }
}

impl From<serde_json::Error> for RecallError {
    fn from(e: serde_json::Error) -> Self {
        RecallError::Serialization(e.to_string())
    }
}

impl From<sqlx::Error> for RecallError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                RecallError::TransientStore(e.to_string())
            }
            sqlx::Error::Database(db) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
                let busy = db
                    .code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .map(|c| matches!(c & 0xff, 5 | 6))
                    .unwrap_or(false);
                if busy {
                    RecallError::TransientStore(e.to_string())
                } else {
                    RecallError::Storage(e.to_string())
                }
            }
            _ => RecallError::Storage(e.to_string()),
        }
    }
}
