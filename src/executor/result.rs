// src/executor/result.rs
//! Classification results and per-submission options

use crate::budget::{ContextData, SectionSizes};
use crate::provider::{ModelResponse, ProviderOptions, TokenUsage};
use crate::utils::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of classifying one signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub signal_id: String,

    /// Model verdict, opaque to the engine
    pub classification: Value,

    pub recommendations: Vec<String>,

    pub token_usage: TokenUsage,

    /// Model-reported confidence in `[0, 1]`
    pub confidence: f64,

    /// Submit-to-result wall time
    pub processing_time_ms: u64,

    /// Served from the response cache
    pub cache_hit: bool,

    /// Attempts beyond the first
    pub retry_count: u32,

    /// Synthesized after a terminal failure
    pub fallback: bool,

    /// Failure that produced a fallback result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Prompt section sizes
    pub sections: SectionSizes,
}

impl ClassificationResult {
    /// Low-confidence placeholder for a signal whose classification failed
    pub fn fallback(
        signal_id: impl Into<String>,
        error: &EngineError,
        confidence: f64,
        retry_count: u32,
        sections: SectionSizes,
    ) -> Self {
        Self {
            signal_id: signal_id.into(),
            classification: serde_json::json!({
                "status": "unclassified",
                "reason": error.kind(),
            }),
            recommendations: Vec::new(),
            token_usage: TokenUsage::default(),
            confidence,
            processing_time_ms: 0,
            cache_hit: false,
            retry_count,
            fallback: true,
            error: Some(error.to_string()),
            sections,
        }
    }
}

/// Per-submission knobs
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Context serialized into the prompt
    pub context: ContextData,

    /// Resolve terminal task failures with a fallback result instead of an error
    pub fallback_on_failure: bool,

    /// Skip the cache lookup (the result is still stored)
    pub bypass_cache: bool,

    /// Override the configured attempt limit
    pub max_attempts: Option<u32>,

    /// Passed through to the provider
    pub provider: ProviderOptions,
}

impl SubmitOptions {
    pub fn with_context(mut self, context: ContextData) -> Self {
        self.context = context;
        self
    }

    pub fn with_fallback(mut self) -> Self {
        self.fallback_on_failure = true;
        self
    }
}

/// The JSON object the model is asked to return
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelVerdict {
    pub classification: Value,

    #[serde(default)]
    pub recommendations: Vec<String>,

    #[serde(default)]
    pub confidence: f64,
}

/// Extract the verdict from raw model output.
///
/// Models wrap JSON in prose or code fences often enough that the outermost
/// `{ ... }` span is parsed rather than the whole text.
pub fn parse_verdict(response: &ModelResponse) -> Result<ModelVerdict, EngineError> {
    let content = response.content.trim();
    let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) else {
        return Err(EngineError::ResponseParse(format!(
            "no JSON object in {} bytes of output",
            content.len()
        )));
    };
    if end < start {
        return Err(EngineError::ResponseParse("unbalanced braces".into()));
    }

    let mut verdict: ModelVerdict = serde_json::from_str(&content[start..=end])
        .map_err(|e| EngineError::ResponseParse(e.to_string()))?;

    if verdict.classification.is_null() {
        return Err(EngineError::ResponseParse("classification is null".into()));
    }
    if !verdict.confidence.is_finite() {
        return Err(EngineError::ResponseParse("confidence is not a number".into()));
    }
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Ok(verdict)
}
