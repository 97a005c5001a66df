// src/utils/config.rs
//! Engine configuration
//!
//! Loaded in layers with the `config` crate:
//!
//! 1. Built-in defaults (the `Default` impls below)
//! 2. An optional file: `$SIGNAL_ENGINE_CONFIG`, or `signal-engine.{toml,yaml,json}`
//!    in the working directory
//! 3. Environment overrides, e.g. `SIGNAL_ENGINE__POOL__MAX_WORKERS=8`

use crate::budget::CompressionStrategy;
use crate::utils::errors::{EngineError, Result};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "SIGNAL_ENGINE_CONFIG";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "SIGNAL_ENGINE";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub executor: ExecutorConfig,
    pub budget: BudgetConfig,
    pub cache: CacheConfig,
    pub observability: ObservabilityConfig,
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker slots
    pub max_workers: usize,

    /// Interval between health checks (ms). A worker silent for twice this
    /// long is considered dead.
    pub health_check_interval_ms: u64,

    /// How long a new worker may take to report ready (ms)
    pub init_timeout_ms: u64,

    /// How long shutdown waits for in-flight tasks (ms)
    pub graceful_shutdown_timeout_ms: u64,

    /// Capacity of the pool's command and message channels
    pub channel_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            health_check_interval_ms: 5_000,
            init_timeout_ms: 10_000,
            graceful_shutdown_timeout_ms: 30_000,
            channel_capacity: 256,
        }
    }
}

impl PoolConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }
}

/// Retry and timeout policy for submissions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Attempts per task, including the first
    pub max_attempts: u32,

    /// Fixed delay between attempts (ms)
    pub retry_delay_ms: u64,

    /// Per-attempt model call timeout (ms)
    pub task_timeout_ms: u64,

    /// Ceiling on a whole submission including queueing and retries (ms)
    pub operation_timeout_ms: u64,

    /// Confidence reported on fallback results
    pub fallback_confidence: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1_000,
            task_timeout_ms: 60_000,
            operation_timeout_ms: 300_000,
            fallback_confidence: 0.1,
        }
    }
}

impl ExecutorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Token budget settings, copied into a `TokenBudget` for every prompt build
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Hard ceiling on prompt tokens
    pub total_limit: usize,

    /// Fraction of `total_limit` never allocated
    pub safety_margin: f64,

    /// Absolute cap on the guideline section
    pub guideline_limit: usize,

    /// Absolute cap on the context section
    pub context_limit: usize,

    /// Share of the available budget offered to the guideline section
    pub guideline_ratio: f64,

    /// Fraction of a sub-budget that compression aims for
    pub compression_threshold: f64,

    /// Preferred strategy before falling back to truncation
    pub strategy: CompressionStrategy,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_limit: 40_000,
            safety_margin: 0.1,
            guideline_limit: 20_000,
            context_limit: 20_000,
            guideline_ratio: 0.5,
            compression_threshold: 1.0,
            strategy: CompressionStrategy::Summarize,
        }
    }
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Entry lifetime (ms)
    pub ttl_ms: u64,

    /// Maximum number of entries before oldest-inserted eviction
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 5 * 60 * 1_000,
            max_entries: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable output
    pub json_logs: bool,

    /// Install the Prometheus exporter
    pub metrics_enabled: bool,

    /// Listen address for the Prometheus scrape endpoint
    pub metrics_addr: String,

    /// Capacity of the lifecycle event broadcast channel
    pub event_capacity: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_addr: "127.0.0.1:9464".to_string(),
            event_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default file locations and environment
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok();
        let mut builder = Config::builder();

        builder = match explicit {
            Some(path) => builder.add_source(File::with_name(&path).required(true)),
            None => builder.add_source(File::with_name("signal-engine").required(false)),
        };

        let config: EngineConfig = builder
            .add_source(Self::env_source())
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit file, still honouring env overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: EngineConfig = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(Self::env_source())
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn env_source() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(EngineError::Config(msg.to_string()));

        if self.pool.max_workers == 0 {
            return fail("pool.max_workers must be at least 1");
        }
        if self.pool.health_check_interval_ms == 0 || self.pool.init_timeout_ms == 0 {
            return fail("pool intervals must be non-zero");
        }
        if self.pool.channel_capacity == 0 {
            return fail("pool.channel_capacity must be at least 1");
        }
        if self.executor.max_attempts == 0 {
            return fail("executor.max_attempts must be at least 1");
        }
        if self.executor.task_timeout_ms == 0 || self.executor.operation_timeout_ms == 0 {
            return fail("executor timeouts must be non-zero");
        }
        if !(0.0..1.0).contains(&self.budget.safety_margin) {
            return fail("budget.safety_margin must be in [0, 1)");
        }
        if !(0.0..=1.0).contains(&self.budget.guideline_ratio) {
            return fail("budget.guideline_ratio must be in [0, 1]");
        }
        if !(self.budget.compression_threshold > 0.0 && self.budget.compression_threshold <= 1.0) {
            return fail("budget.compression_threshold must be in (0, 1]");
        }
        if self.budget.total_limit == 0 {
            return fail("budget.total_limit must be non-zero");
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return fail("cache.max_entries must be at least 1 when the cache is enabled");
        }
        if self.observability.event_capacity == 0 {
            return fail("observability.event_capacity must be at least 1");
        }

        Ok(())
    }
}
