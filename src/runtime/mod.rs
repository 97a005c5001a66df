// src/runtime/mod.rs
//! Task execution runtime
//!
//! - **Task Queue**: priority-ordered queue, FIFO among equals
//! - **Worker**: actor that runs one model call at a time
//! - **Health Monitor**: heartbeat staleness and init timeout rules
//! - **Worker Pool**: owns queue and workers, schedules, replaces dead workers
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │              Scheduling loop (1 task)         │
//! │   TaskQueue ──▶ pair with idle worker         │
//! │        ▲                │                     │
//! │        │ requeue        ▼                     │
//! │   health ticker    ┌─────────┐ ┌─────────┐    │
//! │                    │ worker 0│ │ worker 1│ ...│
//! │                    └─────────┘ └─────────┘    │
//! └───────────────────────────────────────────────┘
//! ```

pub mod health;
pub mod messages;
pub mod task;
pub mod task_queue;
pub mod worker;
pub mod worker_pool;

pub use health::{HealthMonitor, HealthVerdict, WorkerStatus};
pub use messages::{ExecuteRequest, TaskFailure, WorkerCommand, WorkerEnvelope, WorkerId, WorkerMessage};
pub use task::{Task, TaskId, TaskStatus};
pub use task_queue::{QueueStats, TaskQueue};
pub use worker_pool::{AttemptOutcome, PoolStatus, WorkerPool, WorkerSnapshot};
