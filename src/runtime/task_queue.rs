// src/runtime/task_queue.rs
//! Priority task queue
//!
//! Ordered by priority, highest first; FIFO among equal priorities. Insertion
//! walks from the front and places the task before the first entry with a
//! strictly lower priority, so a new task always lands behind its peers.
//!
//! Owned exclusively by the pool's scheduling loop, so there is no locking.

use crate::runtime::task::{Task, TaskId, TaskStatus};
use std::collections::VecDeque;
use tracing::trace;

/// Queue of tasks waiting for a worker
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,

    /// Total tasks ever enqueued
    enqueued: u64,

    /// Total tasks handed out
    dequeued: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in priority order
    pub fn enqueue(&mut self, mut task: Task) {
        task.status = TaskStatus::Queued;
        let pos = self
            .tasks
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(self.tasks.len());

        trace!("Enqueueing {} (priority {}) at position {}", task.id, task.priority, pos);
        self.tasks.insert(pos, task);
        self.enqueued += 1;
    }

    /// Take the highest-priority task
    pub fn dequeue(&mut self) -> Option<Task> {
        let task = self.tasks.pop_front()?;
        self.dequeued += 1;
        Some(task)
    }

    pub fn peek(&self) -> Option<&Task> {
        self.tasks.front()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Remove a queued task (cancellation)
    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| &t.id == id)?;
        self.tasks.remove(pos)
    }

    /// Take every queued task, in order (shutdown)
    pub fn drain(&mut self) -> Vec<Task> {
        self.tasks.drain(..).collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.tasks.len(),
            enqueued: self.enqueued,
            dequeued: self.dequeued,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub enqueued: u64,
    pub dequeued: u64,
}
