// src/budget/context.rs
//! Context section serialization under a token budget
//!
//! Context is a set of named fields serialized in a fixed priority order:
//! identifiers first, bulk history later, environment detail last. Fields are
//! appended verbatim while they fit; the first one that does not fit is
//! compressed into whatever allowance remains, and everything after it is
//! dropped.

use crate::budget::compressor::{CompressionStrategy, Compressor};
use crate::budget::estimator::estimate_tokens;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between context fields
const FIELD_SEPARATOR: &str = "\n\n";

/// Named context fields, in serialization priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    Identifiers,
    RelatedSignals,
    History,
    Environment,
    Extra,
}

impl ContextField {
    /// Serialization order
    pub const ORDER: [ContextField; 5] = [
        ContextField::Identifiers,
        ContextField::RelatedSignals,
        ContextField::History,
        ContextField::Environment,
        ContextField::Extra,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ContextField::Identifiers => "identifiers",
            ContextField::RelatedSignals => "related_signals",
            ContextField::History => "history",
            ContextField::Environment => "environment",
            ContextField::Extra => "extra",
        }
    }
}

/// Caller-supplied context for a classification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextData {
    /// Project, file and owner identifiers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Value>,

    /// Nearby or previously seen signals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_signals: Option<Value>,

    /// Bulk history (commits, discussion, prior classifications)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Value>,

    /// Environment detail (branch, toolchain, CI state)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<Value>,

    /// Anything else
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl ContextData {
    pub fn get(&self, field: ContextField) -> Option<&Value> {
        let value = match field {
            ContextField::Identifiers => &self.identifiers,
            ContextField::RelatedSignals => &self.related_signals,
            ContextField::History => &self.history,
            ContextField::Environment => &self.environment,
            ContextField::Extra => &self.extra,
        };
        value.as_ref().filter(|v| !is_blank(v))
    }

    pub fn is_empty(&self) -> bool {
        ContextField::ORDER.iter().all(|f| self.get(*f).is_none())
    }

    /// Present fields rendered as `## name` blocks, in priority order
    pub fn rendered_fields(&self) -> Vec<(ContextField, String)> {
        ContextField::ORDER
            .iter()
            .filter_map(|field| self.get(*field).map(|v| (*field, render_field(*field, v))))
            .collect()
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn render_field(field: ContextField, value: &Value) -> String {
    let body = match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    format!("### {}\n{}", field.name(), body)
}

/// Result of serializing context under a budget
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedContext {
    pub text: String,

    /// Fields emitted verbatim
    pub included: Vec<ContextField>,

    /// Field cut down to fit, with the strategy that did it
    pub compressed: Option<(ContextField, CompressionStrategy)>,

    /// Fields left out entirely
    pub dropped: Vec<ContextField>,
}

/// Serialize `context` into at most `budget_tokens`
pub fn serialize_within(
    context: &ContextData,
    budget_tokens: usize,
    compressor: &Compressor,
) -> SerializedContext {
    let mut out = SerializedContext::default();
    let mut exhausted = false;

    for (field, rendered) in context.rendered_fields() {
        if exhausted {
            out.dropped.push(field);
            continue;
        }

        let prefix = if out.text.is_empty() {
            String::new()
        } else {
            format!("{}{}", out.text, FIELD_SEPARATOR)
        };

        let candidate = format!("{}{}", prefix, rendered);
        if estimate_tokens(&candidate) <= budget_tokens {
            out.text = candidate;
            out.included.push(field);
            continue;
        }

        // First field that does not fit: squeeze it into the remaining allowance
        exhausted = true;
        let remaining = budget_tokens.saturating_sub(estimate_tokens(&prefix));
        if remaining == 0 {
            out.dropped.push(field);
            continue;
        }

        let squeezed = compressor.compress(&rendered, remaining);
        if squeezed.text.trim().is_empty() {
            out.dropped.push(field);
            continue;
        }

        out.text = format!("{}{}", prefix, squeezed.text);
        out.compressed = Some((field, squeezed.strategy));
    }

    out
}
