// src/runtime/messages.rs
//! Typed messages between the pool and its workers
//!
//! ```text
//! pool ──WorkerCommand──▶ worker        worker ──WorkerEnvelope──▶ pool
//!   task:execute                          worker:ready
//!   heartbeat                             worker:heartbeat
//!   task:cancel                           task:start / task:progress
//!   worker:shutdown                       task:complete / task:error
//!                                         worker:exit
//! ```
//!
//! Every worker message is wrapped with the sender's [`WorkerId`], so the pool
//! can ignore messages from a worker it has already replaced.

use crate::provider::{ModelResponse, ProviderOptions};
use crate::runtime::task::TaskId;
use crate::utils::errors::{EngineError, ProviderError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Worker identity: stable slot plus replacement generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId {
    pub slot: usize,
    pub generation: u64,
}

impl WorkerId {
    pub fn new(slot: usize, generation: u64) -> Self {
        Self { slot, generation }
    }

    /// Identity of the replacement in the same slot
    pub fn next_generation(&self) -> Self {
        Self::new(self.slot, self.generation + 1)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}.{}", self.slot, self.generation)
    }
}

/// What a worker needs to run one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub task_id: TaskId,
    pub prompt: String,
    pub options: ProviderOptions,
    pub timeout_ms: u64,
}

impl ExecuteRequest {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Pool → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    #[serde(rename = "task:execute")]
    Execute(ExecuteRequest),

    #[serde(rename = "heartbeat")]
    Heartbeat,

    #[serde(rename = "task:cancel")]
    Cancel { task_id: TaskId },

    #[serde(rename = "worker:shutdown")]
    Shutdown,
}

/// Why an attempt failed on the worker side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TaskFailure {
    Provider { error: ProviderError },
    Timeout { timeout_ms: u64 },
    Cancelled,
    /// Execute arrived while another task was in flight
    Busy,
    /// The provider call panicked
    Crashed { message: String },
}

impl From<TaskFailure> for EngineError {
    fn from(failure: TaskFailure) -> Self {
        match failure {
            TaskFailure::Provider { error } => EngineError::Provider(error),
            TaskFailure::Timeout { timeout_ms } => EngineError::TaskTimeout(timeout_ms),
            TaskFailure::Cancelled => EngineError::Cancelled,
            TaskFailure::Busy => EngineError::WorkerLost("worker was already busy".into()),
            TaskFailure::Crashed { message } => {
                EngineError::WorkerLost(format!("provider call panicked: {}", message))
            }
        }
    }
}

/// Worker → pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "worker:ready")]
    Ready,

    #[serde(rename = "worker:heartbeat")]
    Heartbeat,

    #[serde(rename = "task:start")]
    TaskStarted { task_id: TaskId },

    #[serde(rename = "task:progress")]
    TaskProgress { task_id: TaskId, stage: String },

    #[serde(rename = "task:complete")]
    TaskCompleted {
        task_id: TaskId,
        response: ModelResponse,
        duration_ms: u64,
    },

    #[serde(rename = "task:error")]
    TaskFailed { task_id: TaskId, failure: TaskFailure },

    #[serde(rename = "worker:exit")]
    Exited { reason: String },
}

/// A worker message tagged with its sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEnvelope {
    pub worker: WorkerId,
    pub message: WorkerMessage,
}
