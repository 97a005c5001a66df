// src/utils/errors.rs
//! Error types for the signal engine
//!
//! Errors are split by who can act on them:
//!
//! - **Fatal**: configuration problems, missing guidelines, a base prompt that
//!   cannot fit the ceiling. Surfaced immediately, never retried.
//! - **Recoverable**: malformed model output, transient provider failures,
//!   task timeouts, lost workers. Retried up to `max_attempts`.
//! - **Terminal**: authentication/authorization/validation failures and retry
//!   exhaustion. Surfaced to the caller as a structured failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level engine error
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No guideline registered for signal type '{0}'")]
    GuidelineNotFound(String),

    #[error("Prompt budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Model provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Failed to parse model response: {0}")]
    ResponseParse(String),

    #[error("Task timed out after {0} ms")]
    TaskTimeout(u64),

    #[error("Operation timed out after {0} ms")]
    OperationTimeout(u64),

    #[error("Worker lost while running task: {0}")]
    WorkerLost(String),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Worker pool is unavailable")]
    PoolUnavailable,

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<EngineError> },
}

impl EngineError {
    /// Whether another attempt may succeed.
    ///
    /// Parse failures, transient provider errors, timeouts and worker loss
    /// are retried. Everything else fails fast without consuming an attempt.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::ResponseParse(_)
            | EngineError::TaskTimeout(_)
            | EngineError::WorkerLost(_) => true,
            EngineError::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Short machine-readable class name used in events and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::GuidelineNotFound(_) => "guideline_not_found",
            EngineError::Budget(_) => "budget",
            EngineError::Provider(_) => "provider",
            EngineError::ResponseParse(_) => "response_parse",
            EngineError::TaskTimeout(_) => "task_timeout",
            EngineError::OperationTimeout(_) => "operation_timeout",
            EngineError::WorkerLost(_) => "worker_lost",
            EngineError::Cancelled => "cancelled",
            EngineError::ShuttingDown => "shutting_down",
            EngineError::PoolUnavailable => "pool_unavailable",
            EngineError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

impl From<::config::ConfigError> for EngineError {
    fn from(e: ::config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

/// Errors raised while building a prompt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error("base section needs {base} tokens but the total limit is {limit}")]
    BaseExceedsLimit { base: usize, limit: usize },

    #[error("invalid budget: {0}")]
    InvalidBudget(String),
}

/// Classified failure reported by a model provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

/// Provider failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Connection reset, DNS failure, etc.
    Network,
    /// HTTP 5xx
    Server(u16),
    /// HTTP 429
    RateLimited,
    /// Provider-side timeout
    Timeout,
    /// HTTP 401
    Authentication,
    /// HTTP 403
    Authorization,
    /// HTTP 400/404/422 and other request problems
    Validation,
    Other,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an HTTP status code returned by a provider
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 => ProviderErrorKind::Authentication,
            403 => ProviderErrorKind::Authorization,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimited,
            500..=599 => ProviderErrorKind::Server(status),
            400..=499 => ProviderErrorKind::Validation,
            _ => ProviderErrorKind::Other,
        };
        Self::new(kind, message)
    }

    /// Network, 5xx, rate limit and timeouts are transient. Unclassified
    /// failures are retried too; auth and validation never are.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            ProviderErrorKind::Authentication
                | ProviderErrorKind::Authorization
                | ProviderErrorKind::Validation
        )
    }
}
