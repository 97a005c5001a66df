// src/executor/mod.rs
//! Submission pipeline: cache, prompt building, dispatch and retries

pub mod coordinator;
pub mod response_cache;
pub mod result;

pub use coordinator::SignalEngine;
pub use response_cache::{CacheStats, ResponseCache};
pub use result::{parse_verdict, ClassificationResult, ModelVerdict, SubmitOptions};
