// src/runtime/worker.rs
//! Worker actor
//!
//! A worker is a tokio task that owns nothing but its channels and a handle to
//! the model provider. It runs at most one task at a time:
//!
//! ```text
//! spawn ─▶ Ready ─▶ idle ──Execute──▶ TaskStarted ─▶ provider call ─▶ TaskCompleted / TaskFailed ─▶ idle
//!                    ▲                                    │
//!                    └──────────── Cancel (abort) ────────┘
//! ```
//!
//! The provider call runs in its own sub-task so the worker keeps answering
//! heartbeats and cancellation while a slow request is in flight.

use crate::provider::{ModelProvider, ModelResponse};
use crate::runtime::messages::{
    ExecuteRequest, TaskFailure, WorkerCommand, WorkerEnvelope, WorkerId, WorkerMessage,
};
use crate::runtime::task::TaskId;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Pool-side handle to a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,

    /// Command channel into the worker
    pub commands: mpsc::Sender<WorkerCommand>,

    /// Join handle of the worker task
    pub join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop and abort it if the command cannot be delivered
    pub fn shutdown(&self) {
        if self.commands.try_send(WorkerCommand::Shutdown).is_err() {
            self.join.abort();
        }
    }

    /// Stop the worker immediately
    pub fn kill(&self) {
        self.join.abort();
    }
}

/// Spawn a worker task
pub fn spawn_worker(
    id: WorkerId,
    provider: Arc<dyn ModelProvider>,
    outbox: mpsc::Sender<WorkerEnvelope>,
    channel_capacity: usize,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(channel_capacity.max(1));
    let worker = Worker {
        id,
        provider,
        outbox,
        inbox: rx,
        in_flight: None,
    };

    debug!("Spawning {}", id);
    let join = tokio::spawn(worker.run());

    WorkerHandle {
        id,
        commands: tx,
        join,
    }
}

/// Attempt currently running on this worker
struct InFlight {
    task_id: TaskId,
    abort: AbortHandle,
}

// An aborted worker takes its provider call down with it
impl Drop for InFlight {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

type AttemptResult = (TaskId, Result<(ModelResponse, u64), TaskFailure>);

struct Worker {
    id: WorkerId,
    provider: Arc<dyn ModelProvider>,
    outbox: mpsc::Sender<WorkerEnvelope>,
    inbox: mpsc::Receiver<WorkerCommand>,
    in_flight: Option<InFlight>,
}

impl Worker {
    async fn run(mut self) {
        let (done_tx, mut done_rx) = mpsc::channel::<AttemptResult>(1);

        if !self.send(WorkerMessage::Ready).await {
            return;
        }

        let reason = loop {
            tokio::select! {
                command = self.inbox.recv() => {
                    let Some(command) = command else {
                        break "command channel closed".to_string();
                    };
                    match command {
                        WorkerCommand::Execute(request) => {
                            if !self.start(request, done_tx.clone()).await {
                                break "pool unreachable".to_string();
                            }
                        }
                        WorkerCommand::Heartbeat => {
                            if !self.send(WorkerMessage::Heartbeat).await {
                                break "pool unreachable".to_string();
                            }
                        }
                        WorkerCommand::Cancel { task_id } => {
                            if !self.cancel(task_id).await {
                                break "pool unreachable".to_string();
                            }
                        }
                        WorkerCommand::Shutdown => {
                            self.in_flight = None;
                            break "shutdown requested".to_string();
                        }
                    }
                }
                Some((task_id, result)) = done_rx.recv() => {
                    if !self.finish(task_id, result).await {
                        break "pool unreachable".to_string();
                    }
                }
            }
        };

        debug!("{} exiting: {}", self.id, reason);
        let _ = self.send(WorkerMessage::Exited { reason }).await;
    }

    /// Start a provider call. Returns false when the pool is gone.
    async fn start(&mut self, request: ExecuteRequest, done: mpsc::Sender<AttemptResult>) -> bool {
        let task_id = request.task_id;

        if let Some(current) = &self.in_flight {
            warn!(
                "{} received {} while running {}, rejecting",
                self.id, task_id, current.task_id
            );
            return self
                .send(WorkerMessage::TaskFailed {
                    task_id,
                    failure: TaskFailure::Busy,
                })
                .await;
        }

        if !self.send(WorkerMessage::TaskStarted { task_id }).await {
            return false;
        }

        let provider = Arc::clone(&self.provider);
        let timeout = request.timeout();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            // A panicking provider must still report back, or the slot stays busy
            let call = AssertUnwindSafe(provider.execute(&request.prompt, &request.options))
                .catch_unwind();
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(Ok(response))) => Ok((response, started.elapsed().as_millis() as u64)),
                Ok(Ok(Err(error))) => Err(TaskFailure::Provider { error }),
                Ok(Err(panic)) => Err(TaskFailure::Crashed {
                    message: panic_message(panic.as_ref()),
                }),
                Err(_) => Err(TaskFailure::Timeout {
                    timeout_ms: request.timeout_ms,
                }),
            };
            let _ = done.send((task_id, result)).await;
        });

        self.in_flight = Some(InFlight {
            task_id,
            abort: handle.abort_handle(),
        });

        trace!("{} calling provider '{}' for {}", self.id, self.provider.name(), task_id);
        self.send(WorkerMessage::TaskProgress {
            task_id,
            stage: "awaiting_provider".to_string(),
        })
        .await
    }

    async fn finish(
        &mut self,
        task_id: TaskId,
        result: Result<(ModelResponse, u64), TaskFailure>,
    ) -> bool {
        // A late result for a cancelled attempt
        match &self.in_flight {
            Some(current) if current.task_id == task_id => self.in_flight = None,
            _ => return true,
        }

        let message = match result {
            Ok((response, duration_ms)) => WorkerMessage::TaskCompleted {
                task_id,
                response,
                duration_ms,
            },
            Err(failure) => WorkerMessage::TaskFailed { task_id, failure },
        };
        self.send(message).await
    }

    async fn cancel(&mut self, task_id: TaskId) -> bool {
        match &self.in_flight {
            Some(current) if current.task_id == task_id => {
                self.in_flight = None;
                debug!("{} cancelled {}", self.id, task_id);
                self.send(WorkerMessage::TaskFailed {
                    task_id,
                    failure: TaskFailure::Cancelled,
                })
                .await
            }
            _ => true,
        }
    }

    async fn send(&self, message: WorkerMessage) -> bool {
        self.outbox
            .send(WorkerEnvelope {
                worker: self.id,
                message,
            })
            .await
            .is_ok()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "provider call panicked".to_string()
    }
}
