// src/observability/events.rs
//! Engine lifecycle events
//!
//! Events fan out over a `tokio::sync::broadcast` channel. Publishing never
//! blocks: with no subscribers the event is counted as dropped, and a slow
//! subscriber that falls behind loses the oldest events (it sees `Lagged`).

use crate::budget::{CompressionStrategy, PromptSection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Something observable happened inside the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ExecutorStarted {
        max_workers: usize,
        at: DateTime<Utc>,
    },
    ExecutorStopped {
        at: DateTime<Utc>,
    },
    WorkerReady {
        slot: usize,
        generation: u64,
    },
    WorkerFailed {
        slot: usize,
        generation: u64,
        reason: String,
        /// Task that was in flight, if any
        task_id: Option<String>,
    },
    TaskQueued {
        task_id: String,
        signal_id: String,
        priority: i64,
        queue_depth: usize,
    },
    TaskStarted {
        task_id: String,
        signal_id: String,
        slot: usize,
        attempt: u32,
    },
    TaskCompleted {
        task_id: String,
        signal_id: String,
        attempts: u32,
        duration_ms: u64,
        total_tokens: u64,
    },
    TaskRetrying {
        task_id: String,
        signal_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    TaskFailed {
        task_id: String,
        signal_id: String,
        attempts: u32,
        error: String,
        kind: String,
    },
    CacheHit {
        signal_id: String,
        fingerprint: String,
    },
    PromptCompressed {
        signal_id: String,
        section: PromptSection,
        strategy: CompressionStrategy,
        original_tokens: usize,
        compressed_tokens: usize,
    },
}

impl EngineEvent {
    /// Event name as serialized
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ExecutorStarted { .. } => "executor_started",
            EngineEvent::ExecutorStopped { .. } => "executor_stopped",
            EngineEvent::WorkerReady { .. } => "worker_ready",
            EngineEvent::WorkerFailed { .. } => "worker_failed",
            EngineEvent::TaskQueued { .. } => "task_queued",
            EngineEvent::TaskStarted { .. } => "task_started",
            EngineEvent::TaskCompleted { .. } => "task_completed",
            EngineEvent::TaskRetrying { .. } => "task_retrying",
            EngineEvent::TaskFailed { .. } => "task_failed",
            EngineEvent::CacheHit { .. } => "cache_hit",
            EngineEvent::PromptCompressed { .. } => "prompt_compressed",
        }
    }
}

/// Broadcast bus for [`EngineEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,

    /// Events delivered to at least one subscriber
    published: Arc<AtomicU64>,

    /// Events published with nobody listening
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        trace!("event {}", event.name());
        match self.sender.send(event) {
            Ok(_) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Event bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventBusStats {
    pub published: u64,
    pub dropped: u64,
    pub subscribers: usize,
}
