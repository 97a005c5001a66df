// src/runtime/task.rs
//! Tasks: one model call for one signal, plus its attempt bookkeeping

use crate::provider::ProviderOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use ulid::Ulid;

/// Unique, time-sortable task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Running,
    Completed,
    FailedRetryable,
    FailedTerminal,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::FailedTerminal)
    }
}

/// A unit of work for the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Signal this task classifies
    pub signal_id: String,

    pub signal_type: String,

    /// Higher values are served first
    pub priority: i64,

    pub created_at: DateTime<Utc>,

    /// When the task was last handed to a worker
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Attempts started so far
    pub attempts: u32,

    pub max_attempts: u32,

    /// Per-attempt model call timeout (ms)
    pub timeout_ms: u64,

    /// Fully built prompt
    pub prompt: String,

    pub options: ProviderOptions,

    pub status: TaskStatus,
}

impl Task {
    pub fn new(
        signal_id: impl Into<String>,
        signal_type: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            signal_id: signal_id.into(),
            signal_type: signal_type.into(),
            priority: 0,
            created_at: Utc::now(),
            scheduled_at: None,
            attempts: 0,
            max_attempts: 1,
            timeout_ms: 60_000,
            prompt: prompt.into(),
            options: ProviderOptions::default(),
            status: TaskStatus::Queued,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_options(mut self, options: ProviderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether another attempt is allowed
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
