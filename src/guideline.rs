// src/guideline.rs
//! Guideline lookup by signal type
//!
//! A missing guideline is fatal for a submission: without instructions the
//! signal cannot be classified.

use crate::utils::errors::{EngineError, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Source of per-type guideline text
pub trait GuidelineStore: Send + Sync {
    fn guideline(&self, signal_type: &str) -> Option<String>;
}

/// Guidelines held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryGuidelines {
    entries: HashMap<String, String>,
}

impl InMemoryGuidelines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, signal_type: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(signal_type, text);
        self
    }

    pub fn insert(&mut self, signal_type: impl Into<String>, text: impl Into<String>) {
        self.entries.insert(signal_type.into(), text.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load every `<signal_type>.md` file in a directory
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut store = Self::new();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            EngineError::Config(format!("Failed to read guideline directory {:?}: {}", dir, e))
        })?;

        for entry in entries {
            let path = entry
                .map_err(|e| EngineError::Config(format!("Failed to read directory entry: {}", e)))?
                .path();

            if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
                continue;
            }
            let Some(signal_type) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let text = std::fs::read_to_string(&path).map_err(|e| {
                EngineError::Config(format!("Failed to read guideline {:?}: {}", path, e))
            })?;

            debug!("Loaded guideline for '{}' ({} bytes)", signal_type, text.len());
            store.insert(signal_type, text);
        }

        info!("Loaded {} guidelines from {:?}", store.len(), dir);
        Ok(store)
    }
}

impl GuidelineStore for InMemoryGuidelines {
    fn guideline(&self, signal_type: &str) -> Option<String> {
        self.entries.get(signal_type).cloned()
    }
}
