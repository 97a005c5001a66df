// src/runtime/worker_pool.rs
//! Worker pool with health monitoring
//!
//! A fixed number of worker slots fed from a single priority queue. One tokio
//! task (the scheduling loop) owns the queue and every worker's state; callers
//! talk to it through a cloneable [`WorkerPool`] handle.
//!
//! # Architecture
//!
//! ```text
//!  WorkerPool (handle)          scheduling loop                    workers
//!  ───────────────────          ───────────────                    ───────
//!  dispatch ──PoolCommand──▶ ┌───────────────────┐ ──Execute────▶ [slot 0 gen 0]
//!  cancel                    │ TaskQueue         │ ──Heartbeat──▶ [slot 1 gen 2]
//!  stop                      │ worker slots      │ ◀─Envelope──── [slot 2 gen 0]
//!  status ◀──watch────────── │ running attempts  │
//!                            └───────────────────┘
//!                               ▲ health ticker
//! ```
//!
//! After every event the loop pairs idle workers with the highest-priority
//! queued tasks until one side runs out. Each dispatched task resolves exactly
//! one [`AttemptOutcome`]; retrying is the caller's business, except that a
//! task lost with a dying worker is requeued here while attempts remain.

use crate::observability::{
    events::{EngineEvent, EventBus},
    BUSY_WORKERS, QUEUE_DEPTH, WORKER_REPLACEMENTS_TOTAL,
};
use crate::provider::{ModelProvider, ModelResponse};
use crate::runtime::health::{HealthMonitor, HealthSample, HealthVerdict, WorkerStatus};
use crate::runtime::messages::{ExecuteRequest, WorkerCommand, WorkerEnvelope, WorkerId, WorkerMessage};
use crate::runtime::task::{Task, TaskId, TaskStatus};
use crate::runtime::task_queue::TaskQueue;
use crate::runtime::worker::{spawn_worker, WorkerHandle};
use crate::utils::config::PoolConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Result of one attempt at a dispatched task
#[derive(Debug)]
pub struct AttemptOutcome {
    /// The task, with `attempts` and `status` updated
    pub task: Task,

    /// Worker that ran the attempt, if it got that far
    pub worker: Option<WorkerId>,

    pub result: std::result::Result<ModelResponse, EngineError>,

    /// Provider call duration
    pub duration_ms: u64,
}

/// Snapshot of one worker slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub slot: usize,
    pub generation: u64,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub tasks_processed: u64,
}

/// Pool status snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStatus {
    pub max_workers: usize,
    pub initializing: usize,
    pub idle: usize,
    pub busy: usize,
    pub failed: usize,
    pub queued: usize,
    pub running: usize,
    pub tasks_processed: u64,
    pub replacements: u64,
    pub shutting_down: bool,
    pub workers: Vec<WorkerSnapshot>,
}

enum PoolCommand {
    Dispatch {
        task: Task,
        reply: oneshot::Sender<AttemptOutcome>,
    },
    Cancel {
        task_id: TaskId,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the worker pool
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::Sender<PoolCommand>,
    status: watch::Receiver<PoolStatus>,
    shutting_down: Arc<AtomicBool>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WorkerPool {
    /// Spawn the workers and the scheduling loop
    pub fn start(config: PoolConfig, provider: Arc<dyn ModelProvider>, events: EventBus) -> Self {
        info!("Starting worker pool with {} workers", config.max_workers);

        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity.max(1));
        let graceful = config.graceful_shutdown_timeout();
        let (state, messages) = PoolState::new(config, provider, events);
        let (status_tx, status_rx) = watch::channel(state.status());

        let join = tokio::spawn(run_loop(state, cmd_rx, messages, status_tx, graceful));

        Self {
            commands: cmd_tx,
            status: status_rx,
            shutting_down: Arc::new(AtomicBool::new(false)),
            join: Arc::new(Mutex::new(Some(join))),
        }
    }

    /// Queue a task; the receiver resolves once the attempt is over
    pub async fn dispatch(&self, task: Task) -> Result<oneshot::Receiver<AttemptOutcome>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Dispatch { task, reply })
            .await
            .map_err(|_| EngineError::PoolUnavailable)?;
        Ok(rx)
    }

    /// Remove a queued task or abort a running one
    pub async fn cancel(&self, task_id: TaskId) {
        if self.commands.send(PoolCommand::Cancel { task_id }).await.is_err() {
            debug!("Cancel for {} after pool stopped", task_id);
        }
    }

    /// Latest status published by the scheduling loop
    pub fn status(&self) -> PoolStatus {
        self.status.borrow().clone()
    }

    /// Graceful shutdown: reject new work, fail queued tasks, let running
    /// tasks finish within the grace period, then stop every worker.
    pub async fn stop(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Stopping worker pool");
        let (done, rx) = oneshot::channel();
        if self.commands.send(PoolCommand::Stop { done }).await.is_ok() {
            let _ = rx.await;
        }

        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }

        info!("Worker pool stopped");
        Ok(())
    }
}

async fn run_loop(
    mut state: PoolState,
    mut commands: mpsc::Receiver<PoolCommand>,
    mut messages: mpsc::Receiver<WorkerEnvelope>,
    status_tx: watch::Sender<PoolStatus>,
    graceful: Duration,
) {
    let period = state.monitor.interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stop_waiters: Vec<oneshot::Sender<()>> = Vec::new();
    let mut drain_deadline: Option<Instant> = None;
    let mut commands_open = true;

    loop {
        let deadline = drain_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3_600));

        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(PoolCommand::Dispatch { task, reply }) => state.submit(task, reply),
                Some(PoolCommand::Cancel { task_id }) => state.cancel(&task_id),
                Some(PoolCommand::Stop { done }) => {
                    stop_waiters.push(done);
                    if drain_deadline.is_none() {
                        state.begin_drain();
                        drain_deadline = Some(Instant::now() + graceful);
                    }
                }
                None => {
                    // Every handle dropped
                    commands_open = false;
                    if drain_deadline.is_none() {
                        state.begin_drain();
                        drain_deadline = Some(Instant::now() + graceful);
                    }
                }
            },
            Some(envelope) = messages.recv() => state.handle_message(envelope),
            _ = ticker.tick() => state.check_health(Instant::now()),
            _ = tokio::time::sleep_until(deadline), if drain_deadline.is_some() => {
                warn!(
                    "Grace period elapsed with {} tasks still running",
                    state.running.len()
                );
                break;
            }
        }

        state.schedule();
        status_tx.send_replace(state.status());

        if drain_deadline.is_some() && state.running.is_empty() {
            break;
        }
    }

    state.finish_shutdown();
    status_tx.send_replace(state.status());
    for done in stop_waiters {
        let _ = done.send(());
    }
}

/// Per-slot bookkeeping
struct WorkerSlot {
    handle: WorkerHandle,
    status: WorkerStatus,
    current_task: Option<TaskId>,
    tasks_processed: u64,
    last_heartbeat: Instant,
    spawned_at: Instant,
}

impl WorkerSlot {
    fn new(handle: WorkerHandle) -> Self {
        let now = Instant::now();
        Self {
            handle,
            status: WorkerStatus::Initializing,
            current_task: None,
            tasks_processed: 0,
            last_heartbeat: now,
            spawned_at: now,
        }
    }
}

/// An attempt handed to a worker
struct RunningAttempt {
    task: Task,
    worker: WorkerId,
    reply: oneshot::Sender<AttemptOutcome>,
}

/// State owned by the scheduling loop
pub(crate) struct PoolState {
    config: PoolConfig,
    provider: Arc<dyn ModelProvider>,
    events: EventBus,
    monitor: HealthMonitor,
    outbox: mpsc::Sender<WorkerEnvelope>,
    workers: Vec<WorkerSlot>,
    queue: TaskQueue,
    /// Replies for queued tasks
    waiting: HashMap<TaskId, oneshot::Sender<AttemptOutcome>>,
    running: HashMap<TaskId, RunningAttempt>,
    tasks_processed: u64,
    replacements: u64,
    draining: bool,
}

impl PoolState {
    pub(crate) fn new(
        config: PoolConfig,
        provider: Arc<dyn ModelProvider>,
        events: EventBus,
    ) -> (Self, mpsc::Receiver<WorkerEnvelope>) {
        let (outbox, messages) = mpsc::channel(config.channel_capacity.max(1));
        let monitor = HealthMonitor::from_config(&config);

        let workers = (0..config.max_workers)
            .map(|slot| {
                WorkerSlot::new(spawn_worker(
                    WorkerId::new(slot, 0),
                    Arc::clone(&provider),
                    outbox.clone(),
                    config.channel_capacity,
                ))
            })
            .collect();

        let state = Self {
            config,
            provider,
            events,
            monitor,
            outbox,
            workers,
            queue: TaskQueue::new(),
            waiting: HashMap::new(),
            running: HashMap::new(),
            tasks_processed: 0,
            replacements: 0,
            draining: false,
        };
        (state, messages)
    }

    pub(crate) fn submit(&mut self, task: Task, reply: oneshot::Sender<AttemptOutcome>) {
        if self.draining {
            resolve(reply, task, None, Err(EngineError::ShuttingDown), 0);
            return;
        }

        debug!("Queueing {} for signal {} (priority {})", task.id, task.signal_id, task.priority);
        let event = EngineEvent::TaskQueued {
            task_id: task.id.to_string(),
            signal_id: task.signal_id.clone(),
            priority: task.priority,
            queue_depth: self.queue.len() + 1,
        };

        self.waiting.insert(task.id, reply);
        self.queue.enqueue(task);
        self.events.publish(event);
    }

    pub(crate) fn cancel(&mut self, task_id: &TaskId) {
        if let Some(mut task) = self.queue.remove(task_id) {
            debug!("Cancelled queued {}", task_id);
            task.status = TaskStatus::FailedTerminal;
            if let Some(reply) = self.waiting.remove(task_id) {
                resolve(reply, task, None, Err(EngineError::Cancelled), 0);
            }
            return;
        }

        let Some(worker) = self.running.get(task_id).map(|r| r.worker) else {
            trace!("Cancel for unknown {}", task_id);
            return;
        };

        let Some(idx) = self.slot_of(worker) else {
            return;
        };
        let sent = self.workers[idx]
            .handle
            .commands
            .try_send(WorkerCommand::Cancel { task_id: *task_id });
        if sent.is_err() {
            self.fail_worker(idx, "cancel could not be delivered".to_string());
        }
    }

    pub(crate) fn handle_message(&mut self, envelope: WorkerEnvelope) {
        let Some(idx) = self.slot_of(envelope.worker) else {
            trace!("Ignoring message from replaced {}", envelope.worker);
            return;
        };

        let now = Instant::now();
        self.workers[idx].last_heartbeat = now;

        match envelope.message {
            WorkerMessage::Ready => {
                let slot = &mut self.workers[idx];
                if slot.status == WorkerStatus::Initializing {
                    slot.status = WorkerStatus::Idle;
                    info!("{} ready", envelope.worker);
                    self.events.publish(EngineEvent::WorkerReady {
                        slot: envelope.worker.slot,
                        generation: envelope.worker.generation,
                    });
                }
            }
            WorkerMessage::Heartbeat => {
                trace!("Heartbeat from {}", envelope.worker);
            }
            WorkerMessage::TaskStarted { task_id } => {
                if let Some(attempt) = self.running.get_mut(&task_id) {
                    attempt.task.attempts += 1;
                    attempt.task.status = TaskStatus::Running;
                    debug!(
                        "{} started {} (attempt {}/{})",
                        envelope.worker, task_id, attempt.task.attempts, attempt.task.max_attempts
                    );
                    self.events.publish(EngineEvent::TaskStarted {
                        task_id: task_id.to_string(),
                        signal_id: attempt.task.signal_id.clone(),
                        slot: envelope.worker.slot,
                        attempt: attempt.task.attempts,
                    });
                }
            }
            WorkerMessage::TaskProgress { task_id, stage } => {
                trace!("{} progress on {}: {}", envelope.worker, task_id, stage);
            }
            WorkerMessage::TaskCompleted {
                task_id,
                response,
                duration_ms,
            } => self.finish_attempt(idx, task_id, Ok(response), duration_ms),
            WorkerMessage::TaskFailed { task_id, failure } => {
                self.finish_attempt(idx, task_id, Err(failure.into()), 0)
            }
            WorkerMessage::Exited { reason } => {
                if self.draining {
                    self.workers[idx].status = WorkerStatus::Exited;
                } else {
                    self.fail_worker(idx, format!("exited unexpectedly: {}", reason));
                }
            }
        }
    }

    fn finish_attempt(
        &mut self,
        idx: usize,
        task_id: TaskId,
        result: std::result::Result<ModelResponse, EngineError>,
        duration_ms: u64,
    ) {
        let slot = &mut self.workers[idx];
        if slot.current_task == Some(task_id) {
            slot.current_task = None;
            slot.status = WorkerStatus::Idle;
            slot.tasks_processed += 1;
        }

        let Some(RunningAttempt { mut task, worker, reply }) = self.running.remove(&task_id) else {
            trace!("Late result for {} ignored", task_id);
            return;
        };
        self.tasks_processed += 1;

        task.status = match &result {
            Ok(_) => TaskStatus::Completed,
            Err(e) if e.is_recoverable() && task.has_attempts_left() => TaskStatus::FailedRetryable,
            Err(_) => TaskStatus::FailedTerminal,
        };
        debug!("{} finished {} as {:?}", worker, task_id, task.status);
        resolve(reply, task, Some(worker), result, duration_ms);
    }

    /// Run one health sweep
    pub(crate) fn check_health(&mut self, now: Instant) {
        for idx in 0..self.workers.len() {
            let slot = &self.workers[idx];
            let sample = HealthSample {
                status: slot.status,
                spawned_at: slot.spawned_at,
                last_heartbeat: slot.last_heartbeat,
                finished: slot.handle.join.is_finished(),
            };

            match self.monitor.check(&sample, now) {
                HealthVerdict::Healthy => {
                    if let Err(mpsc::error::TrySendError::Closed(_)) =
                        slot.handle.commands.try_send(WorkerCommand::Heartbeat)
                    {
                        self.fail_worker(idx, "command channel closed".to_string());
                    }
                }
                HealthVerdict::Dead(reason) => self.fail_worker(idx, reason),
                HealthVerdict::Starting | HealthVerdict::Ignore => {}
            }
        }
    }

    /// Mark a worker failed, recover its task and respawn the slot
    fn fail_worker(&mut self, idx: usize, reason: String) {
        let old_id = self.workers[idx].handle.id;
        let in_flight = self.workers[idx].current_task.take();
        self.workers[idx].status = WorkerStatus::Failed;
        self.workers[idx].handle.kill();

        warn!("{} failed: {}", old_id, reason);
        self.events.publish(EngineEvent::WorkerFailed {
            slot: old_id.slot,
            generation: old_id.generation,
            reason: reason.clone(),
            task_id: in_flight.map(|id| id.to_string()),
        });

        if let Some(RunningAttempt { mut task, reply, .. }) =
            in_flight.and_then(|id| self.running.remove(&id))
        {
            if self.draining {
                task.status = TaskStatus::FailedTerminal;
                resolve(reply, task, Some(old_id), Err(EngineError::ShuttingDown), 0);
            } else if task.has_attempts_left() {
                info!(
                    "Requeueing {} after worker loss (attempt {}/{})",
                    task.id, task.attempts, task.max_attempts
                );
                self.waiting.insert(task.id, reply);
                self.queue.enqueue(task);
            } else {
                task.status = TaskStatus::FailedTerminal;
                resolve(reply, task, Some(old_id), Err(EngineError::WorkerLost(reason)), 0);
            }
        }

        if self.draining {
            return;
        }

        let new_id = old_id.next_generation();
        self.workers[idx] = WorkerSlot::new(spawn_worker(
            new_id,
            Arc::clone(&self.provider),
            self.outbox.clone(),
            self.config.channel_capacity,
        ));
        self.replacements += 1;
        counter!(WORKER_REPLACEMENTS_TOTAL).increment(1);
        info!("Replaced {} with {}", old_id, new_id);
    }

    /// Pair idle workers with queued tasks
    pub(crate) fn schedule(&mut self) {
        while !self.queue.is_empty() {
            let Some(idx) = self
                .workers
                .iter()
                .position(|w| w.status == WorkerStatus::Idle)
            else {
                break;
            };
            let Some(mut task) = self.queue.dequeue() else {
                break;
            };
            let Some(reply) = self.waiting.remove(&task.id) else {
                continue;
            };

            task.status = TaskStatus::Assigned;
            task.scheduled_at = Some(Utc::now());
            let request = ExecuteRequest {
                task_id: task.id,
                prompt: task.prompt.clone(),
                options: task.options.clone(),
                timeout_ms: task.timeout_ms,
            };

            let slot = &mut self.workers[idx];
            match slot.handle.commands.try_send(WorkerCommand::Execute(request)) {
                Ok(()) => {
                    trace!("Assigned {} to {}", task.id, slot.handle.id);
                    slot.status = WorkerStatus::Busy;
                    slot.current_task = Some(task.id);
                    let worker = slot.handle.id;
                    self.running.insert(task.id, RunningAttempt { task, worker, reply });
                }
                Err(_) => {
                    self.waiting.insert(task.id, reply);
                    self.queue.enqueue(task);
                    self.fail_worker(idx, "execute could not be delivered".to_string());
                }
            }
        }
    }

    /// Stop accepting work and fail everything still queued
    pub(crate) fn begin_drain(&mut self) {
        self.draining = true;
        let queued = self.queue.drain();
        if !queued.is_empty() {
            info!("Failing {} queued tasks on shutdown", queued.len());
        }
        for mut task in queued {
            task.status = TaskStatus::FailedTerminal;
            if let Some(reply) = self.waiting.remove(&task.id) {
                resolve(reply, task, None, Err(EngineError::ShuttingDown), 0);
            }
        }
    }

    /// Fail leftover attempts and stop every worker
    pub(crate) fn finish_shutdown(&mut self) {
        self.draining = true;
        for (_, RunningAttempt { mut task, worker, reply }) in self.running.drain() {
            task.status = TaskStatus::FailedTerminal;
            resolve(reply, task, Some(worker), Err(EngineError::ShuttingDown), 0);
        }
        for slot in &mut self.workers {
            slot.handle.shutdown();
            slot.current_task = None;
            slot.status = WorkerStatus::Exited;
        }
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            max_workers: self.config.max_workers,
            queued: self.queue.len(),
            running: self.running.len(),
            tasks_processed: self.tasks_processed,
            replacements: self.replacements,
            shutting_down: self.draining,
            ..Default::default()
        };

        for slot in &self.workers {
            match slot.status {
                WorkerStatus::Initializing => status.initializing += 1,
                WorkerStatus::Idle => status.idle += 1,
                WorkerStatus::Busy => status.busy += 1,
                WorkerStatus::Failed => status.failed += 1,
                WorkerStatus::Exited => {}
            }
            status.workers.push(WorkerSnapshot {
                slot: slot.handle.id.slot,
                generation: slot.handle.id.generation,
                status: slot.status,
                current_task: slot.current_task,
                tasks_processed: slot.tasks_processed,
            });
        }

        gauge!(QUEUE_DEPTH).set(status.queued as f64);
        gauge!(BUSY_WORKERS).set(status.busy as f64);
        status
    }

    fn slot_of(&self, id: WorkerId) -> Option<usize> {
        self.workers
            .get(id.slot)
            .filter(|slot| slot.handle.id == id)
            .map(|_| id.slot)
    }
}

fn resolve(
    reply: oneshot::Sender<AttemptOutcome>,
    task: Task,
    worker: Option<WorkerId>,
    result: std::result::Result<ModelResponse, EngineError>,
    duration_ms: u64,
) {
    let task_id = task.id;
    let outcome = AttemptOutcome {
        task,
        worker,
        result,
        duration_ms,
    };
    if reply.send(outcome).is_err() {
        trace!("Caller for {} is gone", task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{DryRunProvider, ProviderOptions, TokenUsage};
    use crate::utils::errors::ProviderError;
    use async_trait::async_trait;

    /// Sleeps, then answers
    struct SlowProvider(Duration);

    #[async_trait]
    impl ModelProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(
            &self,
            _prompt: &str,
            _options: &ProviderOptions,
        ) -> std::result::Result<ModelResponse, ProviderError> {
            tokio::time::sleep(self.0).await;
            Ok(ModelResponse {
                content: "{}".into(),
                usage: TokenUsage::default(),
                finish_reason: "stop".into(),
            })
        }
    }

    fn config(max_workers: usize) -> PoolConfig {
        PoolConfig {
            max_workers,
            health_check_interval_ms: 1_000,
            init_timeout_ms: 5_000,
            graceful_shutdown_timeout_ms: 200,
            channel_capacity: 64,
        }
    }

    fn task(label: &str) -> Task {
        Task::new(label, "todo", "prompt").with_max_attempts(3)
    }

    async fn wait_for(pool: &WorkerPool, pred: impl Fn(&PoolStatus) -> bool) {
        for _ in 0..400 {
            if pred(&pool.status()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached: {:?}", pool.status());
    }

    #[tokio::test]
    async fn test_workers_become_ready() {
        let pool = WorkerPool::start(config(3), Arc::new(DryRunProvider), EventBus::new(64));
        wait_for(&pool, |s| s.idle == 3).await;

        let status = pool.status();
        assert_eq!(status.max_workers, 3);
        assert!(status.workers.iter().all(|w| w.generation == 0));
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_completes() {
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let pool = WorkerPool::start(config(2), Arc::new(DryRunProvider), events);

        let outcome = pool.dispatch(task("sig_1")).await.unwrap().await.unwrap();
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.task.attempts, 1);
        assert_eq!(outcome.task.status, TaskStatus::Completed);
        assert!(outcome.worker.is_some());

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"task_queued"));
        assert!(names.contains(&"task_started"));
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_size_bound_under_load() {
        let pool = WorkerPool::start(
            config(3),
            Arc::new(SlowProvider(Duration::from_millis(10))),
            EventBus::new(256),
        );

        let mut receivers = Vec::new();
        for i in 0..20 {
            receivers.push(pool.dispatch(task(&format!("sig_{}", i))).await.unwrap());
        }

        let watcher = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut max_busy = 0;
                for _ in 0..100 {
                    let s = pool.status();
                    assert!(s.idle + s.busy <= 3, "{:?}", s);
                    max_busy = max_busy.max(s.busy);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                max_busy
            })
        };

        for rx in receivers {
            assert!(rx.await.unwrap().result.is_ok());
        }
        assert!(watcher.await.unwrap() <= 3);
        wait_for(&pool, |s| s.tasks_processed == 20).await;
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let pool = WorkerPool::start(
            config(1),
            Arc::new(SlowProvider(Duration::from_secs(3_600))),
            EventBus::new(64),
        );

        let running = task("running");
        let running_id = running.id;
        let queued = task("queued");
        let queued_id = queued.id;

        let running_rx = pool.dispatch(running).await.unwrap();
        wait_for(&pool, |s| s.busy == 1).await;
        let queued_rx = pool.dispatch(queued).await.unwrap();

        pool.cancel(queued_id).await;
        let outcome = queued_rx.await.unwrap();
        assert!(matches!(outcome.result, Err(EngineError::Cancelled)));
        assert!(outcome.worker.is_none());

        pool.cancel(running_id).await;
        let outcome = running_rx.await.unwrap();
        assert!(matches!(outcome.result, Err(EngineError::Cancelled)));

        wait_for(&pool, |s| s.idle == 1 && s.running == 0).await;
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_fails_queued_and_rejects_new() {
        let pool = WorkerPool::start(
            config(1),
            Arc::new(SlowProvider(Duration::from_secs(3_600))),
            EventBus::new(64),
        );

        let running_rx = pool.dispatch(task("running")).await.unwrap();
        wait_for(&pool, |s| s.busy == 1).await;
        let queued_rx = pool.dispatch(task("queued")).await.unwrap();

        pool.stop().await.unwrap();

        assert!(matches!(queued_rx.await.unwrap().result, Err(EngineError::ShuttingDown)));
        // Still running when the grace period ran out
        assert!(matches!(running_rx.await.unwrap().result, Err(EngineError::ShuttingDown)));
        assert!(matches!(
            pool.dispatch(task("late")).await,
            Err(EngineError::ShuttingDown)
        ));
        assert!(pool.status().shutting_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_worker_replaced_and_task_requeued() {
        let events = EventBus::new(64);
        let mut event_rx = events.subscribe();
        let (mut state, mut messages) = PoolState::new(
            PoolConfig {
                max_workers: 1,
                health_check_interval_ms: 100,
                ..config(1)
            },
            Arc::new(SlowProvider(Duration::from_secs(3_600))),
            events,
        );

        let ready = messages.recv().await.unwrap();
        state.handle_message(ready);
        assert_eq!(state.status().idle, 1);

        let (reply, mut outcome_rx) = oneshot::channel();
        let t = task("sig_1");
        let task_id = t.id;
        state.submit(t, reply);
        state.schedule();

        let started = messages.recv().await.unwrap();
        assert_eq!(started.message, WorkerMessage::TaskStarted { task_id });
        state.handle_message(started);
        assert_eq!(state.status().busy, 1);

        // Silent for longer than twice the interval
        tokio::time::advance(Duration::from_millis(250)).await;
        state.check_health(Instant::now());

        let status = state.status();
        assert_eq!(status.queued, 1);
        assert_eq!(status.replacements, 1);
        assert_eq!(status.workers[0].generation, 1);
        assert_eq!(status.workers[0].status, WorkerStatus::Initializing);
        assert!(outcome_rx.try_recv().is_err());

        // Messages from generation 0 are ignored until the replacement is ready
        loop {
            let envelope = messages.recv().await.unwrap();
            let replacement_ready =
                envelope.worker.generation == 1 && envelope.message == WorkerMessage::Ready;
            state.handle_message(envelope);
            if replacement_ready {
                break;
            }
        }
        assert_eq!(state.status().workers[0].status, WorkerStatus::Idle);

        state.schedule();
        let status = state.status();
        assert_eq!(status.busy, 1);
        assert_eq!(status.workers[0].current_task, Some(task_id));

        let mut saw_failure = false;
        while let Ok(event) = event_rx.try_recv() {
            if let EngineEvent::WorkerFailed { slot, generation, task_id: lost, .. } = event {
                assert_eq!((slot, generation), (0, 0));
                assert_eq!(lost, Some(task_id.to_string()));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_loss_without_attempts_left_is_terminal() {
        let (mut state, mut messages) = PoolState::new(
            config(1),
            Arc::new(SlowProvider(Duration::from_secs(3_600))),
            EventBus::new(16),
        );
        let ready = messages.recv().await.unwrap();
        state.handle_message(ready);

        let (reply, outcome_rx) = oneshot::channel();
        state.submit(Task::new("sig_1", "todo", "prompt").with_max_attempts(1), reply);
        state.schedule();
        let started = messages.recv().await.unwrap();
        state.handle_message(started);

        tokio::time::advance(Duration::from_millis(2_500)).await;
        state.check_health(Instant::now());

        let outcome = outcome_rx.await.unwrap();
        assert!(matches!(outcome.result, Err(EngineError::WorkerLost(_))));
        assert_eq!(outcome.task.status, TaskStatus::FailedTerminal);
        assert_eq!(state.status().queued, 0);
    }
}
