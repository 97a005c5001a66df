// src/runtime/health.rs
//! Worker health verdicts
//!
//! Pure decision logic, driven by the pool's health ticker. A worker is
//! considered dead when it has been silent for more than twice the check
//! interval, or has not reported ready within the init timeout.

use crate::utils::config::PoolConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Idle,
    Busy,
    Failed,
    Exited,
}

/// What the monitor needs to know about a worker
#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    pub status: WorkerStatus,
    pub spawned_at: Instant,
    pub last_heartbeat: Instant,
    /// Worker task has already finished
    pub finished: bool,
}

/// Outcome of a health check for one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Alive; send a heartbeat request
    Healthy,
    /// Still starting up within its allowance
    Starting,
    /// Replace it
    Dead(String),
    /// Already failed or exited, nothing to do
    Ignore,
}

/// Staleness rules
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor {
    interval: Duration,
    init_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(interval: Duration, init_timeout: Duration) -> Self {
        Self {
            interval,
            init_timeout,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.health_check_interval(), config.init_timeout())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Silence longer than this marks a worker dead
    pub fn stale_after(&self) -> Duration {
        self.interval * 2
    }

    pub fn check(&self, sample: &HealthSample, now: Instant) -> HealthVerdict {
        match sample.status {
            WorkerStatus::Failed | WorkerStatus::Exited => HealthVerdict::Ignore,
            _ if sample.finished => HealthVerdict::Dead("worker task exited unexpectedly".into()),
            WorkerStatus::Initializing => {
                let waited = now.saturating_duration_since(sample.spawned_at);
                if waited > self.init_timeout {
                    HealthVerdict::Dead(format!(
                        "not ready after {} ms",
                        waited.as_millis()
                    ))
                } else {
                    HealthVerdict::Starting
                }
            }
            WorkerStatus::Idle | WorkerStatus::Busy => {
                let silent = now.saturating_duration_since(sample.last_heartbeat);
                if silent > self.stale_after() {
                    HealthVerdict::Dead(format!("no heartbeat for {} ms", silent.as_millis()))
                } else {
                    HealthVerdict::Healthy
                }
            }
        }
    }
}
