// src/lib.rs
//! Signal Execution Engine Library
//!
//! Classifies signals (structured events extracted from project text) by
//! sending budgeted prompts to a language model through a supervised pool of
//! workers.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **budget**: Token estimation, compression, prompt allocation
//! - **runtime**: Priority queue, worker actors, health monitoring, pool
//! - **executor**: Submission pipeline, retries, response cache
//! - **observability**: Tracing, metrics and lifecycle events
//! - **utils**: Configuration and errors
//!
//! The model provider and guideline store are traits; callers plug in their
//! own implementations.

// Public module exports
pub mod budget;
pub mod executor;
pub mod guideline;
pub mod observability;
pub mod provider;
pub mod runtime;
pub mod signal;
pub mod utils;

// Re-export commonly used types
pub use budget::{ContextData, PromptAllocator, TokenBudget};
pub use executor::{ClassificationResult, SignalEngine, SubmitOptions};
pub use guideline::{GuidelineStore, InMemoryGuidelines};
pub use observability::{EngineEvent, EventBus};
pub use provider::{ModelProvider, ModelResponse, ProviderOptions, TokenUsage};
pub use signal::Signal;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
