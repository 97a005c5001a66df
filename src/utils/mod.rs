// src/utils/mod.rs
//! Shared configuration and error types

pub mod config;
pub mod errors;

pub use config::EngineConfig;
pub use errors::{BudgetError, EngineError, ProviderError, ProviderErrorKind, Result};
