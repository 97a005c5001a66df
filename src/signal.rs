// src/signal.rs
//! Signals: the unit of work submitted to the engine
//!
//! Signals are produced by the scanner and are immutable once created. The
//! engine only reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A structured event extracted from project text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Unique signal ID
    pub id: String,

    /// Category tag (e.g. `todo`, `decision`, `blocker`)
    #[serde(rename = "type")]
    pub signal_type: String,

    /// Where the signal was extracted from (file path, channel, ...)
    pub source: String,

    /// Higher values are served first
    #[serde(default)]
    pub priority: i64,

    /// When the signal was observed
    pub timestamp: DateTime<Utc>,

    /// Free-form payload
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Signal {
    pub fn new(
        id: impl Into<String>,
        signal_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            signal_type: signal_type.into(),
            source: source.into(),
            priority: 0,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// SHA-256 of the canonical JSON encoding of `data`
    ///
    /// `serde_json::Map` is ordered by key, so equal payloads always encode
    /// to the same bytes regardless of construction order.
    pub fn data_digest(&self) -> String {
        let encoded = serde_json::to_vec(&self.data).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        format!("{:x}", hasher.finalize())
    }

    /// Deterministic cache key over `(type, digest(data), priority)`
    pub fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.signal_type, self.data_digest(), self.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_id_source_and_time() {
        let a = Signal::new("a", "todo", "src/lib.rs", json!({"text": "fix me", "line": 3}));
        let mut b = Signal::new("b", "todo", "src/main.rs", json!({"line": 3, "text": "fix me"}));
        b.timestamp = a.timestamp + chrono::Duration::hours(1);

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_type_data_and_priority() {
        let base = Signal::new("a", "todo", "x", json!({"text": "fix me"}));

        let other_type = Signal { signal_type: "blocker".into(), ..base.clone() };
        let other_data = Signal { data: json!({"text": "fix you"}), ..base.clone() };
        let other_priority = base.clone().with_priority(5);

        assert_ne!(base.fingerprint(), other_type.fingerprint());
        assert_ne!(base.fingerprint(), other_data.fingerprint());
        assert_ne!(base.fingerprint(), other_priority.fingerprint());
    }

    #[test]
    fn test_deserialize_scanner_shape() {
        let raw = r#"{
            "id": "sig_1",
            "type": "decision",
            "source": "docs/adr.md",
            "priority": 7,
            "timestamp": "2024-03-01T10:00:00Z",
            "data": {"text": "we chose tokio"}
        }"#;

        let signal: Signal = serde_json::from_str(raw).unwrap();
        assert_eq!(signal.signal_type, "decision");
        assert_eq!(signal.priority, 7);
        assert_eq!(signal.data["text"], "we chose tokio");
    }
}
