// src/executor/coordinator.rs
//! Execution coordinator
//!
//! Runs one submission end to end:
//!
//! ```text
//! submit ─▶ cache? ──hit──────────────────────────────────────────▶ result
//!             │ miss
//!             ▼
//!          guideline ─▶ allocator ─▶ Task ─▶ pool.dispatch ─▶ outcome
//!                                      ▲                         │
//!                                      └── retry_delay ◀─ recoverable
//! ```
//!
//! The whole pipeline runs under `operation_timeout`, independent of the
//! per-attempt task timeout enforced by the worker.

use crate::budget::{PromptAllocator, TokenBudget};
use crate::executor::response_cache::{CacheStats, ResponseCache};
use crate::executor::result::{parse_verdict, ClassificationResult, SubmitOptions};
use crate::guideline::GuidelineStore;
use crate::observability::{
    events::{EngineEvent, EventBus},
    CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, PROCESSING_TIME_MS, PROMPT_TOKENS, SUBMISSIONS_TOTAL,
    TASKS_COMPLETED_TOTAL, TASKS_FAILED_TOTAL, TASKS_RETRIED_TOTAL,
};
use crate::provider::ModelProvider;
use crate::runtime::{PoolStatus, Task, TaskId, WorkerPool};
use crate::signal::Signal;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Task of an in-progress submission and the attempts it has finished
#[derive(Debug, Clone, Copy)]
struct CurrentTask {
    id: TaskId,
    attempts: u32,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct SignalEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    guidelines: Arc<dyn GuidelineStore>,
    allocator: PromptAllocator,
    budget: TokenBudget,
    pool: WorkerPool,
    cache: Mutex<ResponseCache>,
    events: EventBus,
    stopped: AtomicBool,
}

impl SignalEngine {
    /// Validate the configuration and start the worker pool
    pub fn start(
        config: EngineConfig,
        provider: Arc<dyn ModelProvider>,
        guidelines: Arc<dyn GuidelineStore>,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            "Starting signal engine: {} workers, provider '{}', prompt limit {} tokens",
            config.pool.max_workers,
            provider.name(),
            config.budget.total_limit
        );

        let events = EventBus::new(config.observability.event_capacity);
        let pool = WorkerPool::start(config.pool.clone(), provider, events.clone());
        let budget = TokenBudget::from(&config.budget);
        let cache = Mutex::new(ResponseCache::new(&config.cache));

        events.publish(EngineEvent::ExecutorStarted {
            max_workers: config.pool.max_workers,
            at: Utc::now(),
        });

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                guidelines,
                allocator: PromptAllocator::new(),
                budget,
                pool,
                cache,
                events,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Classify one signal
    pub async fn submit(&self, signal: &Signal, options: SubmitOptions) -> Result<ClassificationResult> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }

        counter!(SUBMISSIONS_TOTAL).increment(1);
        let started = Instant::now();

        // Step 1: cache
        if !options.bypass_cache {
            if let Some(hit) = self.cached(signal, started) {
                return Ok(hit);
            }
        }

        // Step 2: everything else, under the operation timeout
        let current_task: Mutex<Option<CurrentTask>> = Mutex::new(None);
        let timeout = inner.config.executor.operation_timeout();

        let outcome =
            tokio::time::timeout(timeout, self.run_pipeline(signal, &options, started, &current_task))
                .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let current = current_task.lock().take();
                let err = EngineError::OperationTimeout(timeout.as_millis() as u64);
                warn!("Signal {} timed out after {} ms", signal.id, timeout.as_millis());

                if let Some(CurrentTask { id, attempts }) = current {
                    inner.pool.cancel(id).await;
                    inner.events.publish(EngineEvent::TaskFailed {
                        task_id: id.to_string(),
                        signal_id: signal.id.clone(),
                        attempts,
                        error: err.to_string(),
                        kind: err.kind().to_string(),
                    });
                }
                counter!(TASKS_FAILED_TOTAL, "kind" => err.kind()).increment(1);
                Err(err)
            }
        }
    }

    /// Classify many signals concurrently. One result per input, in order;
    /// a failed member does not fail the batch.
    pub async fn submit_batch(
        &self,
        signals: &[Signal],
        options: SubmitOptions,
    ) -> Vec<Result<ClassificationResult>> {
        debug!("Submitting batch of {} signals", signals.len());
        let submissions = signals.iter().map(|signal| self.submit(signal, options.clone()));
        futures::future::join_all(submissions).await
    }

    fn cached(&self, signal: &Signal, started: Instant) -> Option<ClassificationResult> {
        let inner = &self.inner;
        let hit = {
            let mut cache = inner.cache.lock();
            if !cache.is_enabled() {
                return None;
            }
            cache.get(signal)
        };

        match hit {
            Some(mut result) => {
                debug!("Cache hit for signal {}", signal.id);
                counter!(CACHE_HITS_TOTAL).increment(1);
                inner.events.publish(EngineEvent::CacheHit {
                    signal_id: signal.id.clone(),
                    fingerprint: signal.fingerprint(),
                });
                result.signal_id = signal.id.clone();
                result.cache_hit = true;
                result.processing_time_ms = started.elapsed().as_millis() as u64;
                Some(result)
            }
            None => {
                counter!(CACHE_MISSES_TOTAL).increment(1);
                None
            }
        }
    }

    async fn run_pipeline(
        &self,
        signal: &Signal,
        options: &SubmitOptions,
        started: Instant,
        current_task: &Mutex<Option<CurrentTask>>,
    ) -> Result<ClassificationResult> {
        let inner = &self.inner;
        let executor = &inner.config.executor;

        // Step 2a: guideline (missing is fatal)
        let guideline = inner
            .guidelines
            .guideline(&signal.signal_type)
            .ok_or_else(|| EngineError::GuidelineNotFound(signal.signal_type.clone()))?;

        // Step 2b: prompt under budget (base overflow is fatal)
        let built = inner
            .allocator
            .build(signal, &guideline, &options.context, &inner.budget)
            .map_err(|e| {
                error!("Cannot build prompt for signal {}: {}", signal.id, e);
                EngineError::from(e)
            })?;

        for record in &built.compressed {
            inner.events.publish(EngineEvent::PromptCompressed {
                signal_id: signal.id.clone(),
                section: record.section,
                strategy: record.strategy,
                original_tokens: record.original_tokens,
                compressed_tokens: record.compressed_tokens,
            });
        }
        histogram!(PROMPT_TOKENS).record(built.sections.total as f64);

        let sections = built.sections;
        let mut task = Task::new(signal.id.clone(), signal.signal_type.clone(), built.prompt)
            .with_priority(signal.priority)
            .with_max_attempts(options.max_attempts.unwrap_or(executor.max_attempts))
            .with_timeout(executor.task_timeout())
            .with_options(options.provider.clone());

        // Step 3: dispatch until success, a terminal error or exhaustion
        loop {
            *current_task.lock() = Some(CurrentTask {
                id: task.id,
                attempts: task.attempts,
            });
            let receiver = inner.pool.dispatch(task).await?;
            let outcome = receiver.await.map_err(|_| EngineError::PoolUnavailable)?;
            task = outcome.task;
            *current_task.lock() = Some(CurrentTask {
                id: task.id,
                attempts: task.attempts,
            });

            let attempt = outcome
                .result
                .and_then(|response| parse_verdict(&response).map(|verdict| (verdict, response.usage)));

            let err = match attempt {
                Ok((verdict, usage)) => {
                    let retry_count = task.attempts.saturating_sub(1);
                    let processing_time_ms = started.elapsed().as_millis() as u64;
                    let result = ClassificationResult {
                        signal_id: signal.id.clone(),
                        classification: verdict.classification,
                        recommendations: verdict.recommendations,
                        token_usage: usage,
                        confidence: verdict.confidence,
                        processing_time_ms,
                        cache_hit: false,
                        retry_count,
                        fallback: false,
                        error: None,
                        sections,
                    };

                    inner.cache.lock().put(signal, result.clone());

                    info!(
                        "Classified signal {} in {} ms ({} retries)",
                        signal.id, processing_time_ms, retry_count
                    );
                    counter!(TASKS_COMPLETED_TOTAL).increment(1);
                    histogram!(PROCESSING_TIME_MS).record(processing_time_ms as f64);
                    inner.events.publish(EngineEvent::TaskCompleted {
                        task_id: task.id.to_string(),
                        signal_id: signal.id.clone(),
                        attempts: task.attempts,
                        duration_ms: outcome.duration_ms,
                        total_tokens: usage.total_tokens,
                    });
                    return Ok(result);
                }
                Err(err) => err,
            };

            if err.is_recoverable() && task.has_attempts_left() {
                let delay = executor.retry_delay();
                warn!(
                    "Attempt {}/{} for signal {} failed: {}; retrying in {} ms",
                    task.attempts,
                    task.max_attempts,
                    signal.id,
                    err,
                    delay.as_millis()
                );
                counter!(TASKS_RETRIED_TOTAL).increment(1);
                inner.events.publish(EngineEvent::TaskRetrying {
                    task_id: task.id.to_string(),
                    signal_id: signal.id.clone(),
                    attempt: task.attempts,
                    delay_ms: delay.as_millis() as u64,
                    error: err.to_string(),
                });
                tokio::time::sleep(delay).await;
                continue;
            }

            let err = if err.is_recoverable() {
                EngineError::RetriesExhausted {
                    attempts: task.attempts,
                    last: Box::new(err),
                }
            } else {
                err
            };

            error!("Signal {} failed after {} attempts: {}", signal.id, task.attempts, err);
            counter!(TASKS_FAILED_TOTAL, "kind" => err.kind()).increment(1);
            inner.events.publish(EngineEvent::TaskFailed {
                task_id: task.id.to_string(),
                signal_id: signal.id.clone(),
                attempts: task.attempts,
                error: err.to_string(),
                kind: err.kind().to_string(),
            });

            if options.fallback_on_failure {
                let mut fallback = ClassificationResult::fallback(
                    signal.id.clone(),
                    &err,
                    executor.fallback_confidence,
                    task.attempts.saturating_sub(1),
                    sections,
                );
                fallback.processing_time_ms = started.elapsed().as_millis() as u64;
                return Ok(fallback);
            }
            return Err(err);
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().stats()
    }

    pub fn clear_cache(&self) {
        self.inner.cache.lock().clear();
        debug!("Response cache cleared");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Stop accepting work and shut the pool down gracefully
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Shutting down signal engine");
        self.inner.pool.stop().await?;
        self.inner.events.publish(EngineEvent::ExecutorStopped { at: Utc::now() });
        info!("Signal engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guideline::InMemoryGuidelines;
    use crate::provider::{DryRunProvider, ModelResponse, ProviderOptions, TokenUsage};
    use crate::utils::errors::ProviderError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Fails with a parse-breaking body `failures` times, then answers
    struct FlakyProvider {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            _prompt: &str,
            _options: &ProviderOptions,
        ) -> std::result::Result<ModelResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let content = if call < self.failures {
                "not json".to_string()
            } else {
                json!({"classification": {"urgency": "high"}, "confidence": 0.9}).to_string()
            };
            Ok(ModelResponse {
                content,
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
                finish_reason: "stop".into(),
            })
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.pool.max_workers = 2;
        config.executor.retry_delay_ms = 5;
        config
    }

    fn guidelines() -> Arc<InMemoryGuidelines> {
        Arc::new(InMemoryGuidelines::new().with("todo", "Rate TODO urgency."))
    }

    fn signal(id: &str) -> Signal {
        Signal::new(id, "todo", "src/lib.rs", json!({"text": "TODO: handle EOF"}))
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let provider = Arc::new(FlakyProvider {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let engine = SignalEngine::start(config(), provider.clone(), guidelines()).unwrap();

        let result = engine.submit(&signal("sig_1"), SubmitOptions::default()).await.unwrap();
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.classification["urgency"], "high");
        assert_eq!(result.token_usage.total_tokens, 15);
        assert!(!result.cache_hit);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_exhaustion_with_fallback() {
        let provider = Arc::new(FlakyProvider {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let engine = SignalEngine::start(config(), provider, guidelines()).unwrap();

        let result = engine
            .submit(&signal("sig_1"), SubmitOptions::default().with_fallback())
            .await
            .unwrap();
        assert!(result.fallback);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.confidence, 0.1);
        assert!(result.error.unwrap().contains("3 attempts"));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_short_circuits() {
        let engine = SignalEngine::start(config(), Arc::new(DryRunProvider), guidelines()).unwrap();
        let mut events = engine.subscribe();

        let first = engine.submit(&signal("sig_1"), SubmitOptions::default()).await.unwrap();
        assert!(!first.cache_hit);
        let second = engine.submit(&signal("sig_2"), SubmitOptions::default()).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.signal_id, "sig_2");

        let mut queued = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::TaskQueued { .. }) {
                queued += 1;
            }
        }
        assert_eq!(queued, 1);
        assert_eq!(engine.cache_stats().hits, 1);

        engine.clear_cache();
        let third = engine.submit(&signal("sig_3"), SubmitOptions::default()).await.unwrap();
        assert!(!third.cache_hit);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        struct Stuck;

        #[async_trait]
        impl ModelProvider for Stuck {
            fn name(&self) -> &str {
                "stuck"
            }

            async fn execute(
                &self,
                _prompt: &str,
                _options: &ProviderOptions,
            ) -> std::result::Result<ModelResponse, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Err(ProviderError::from_status(500, "unreachable"))
            }
        }

        let mut config = config();
        config.executor.operation_timeout_ms = 50;
        let engine = SignalEngine::start(config, Arc::new(Stuck), guidelines()).unwrap();

        let err = engine.submit(&signal("sig_1"), SubmitOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::OperationTimeout(50)));

        // The stuck attempt is cancelled and the worker freed
        for _ in 0..200 {
            if engine.pool_status().running == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.pool_status().running, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_operation_timeout_reports_finished_attempts() {
        /// Answers garbage once, then hangs
        struct FailsThenHangs {
            calls: AtomicU32,
        }

        #[async_trait]
        impl ModelProvider for FailsThenHangs {
            fn name(&self) -> &str {
                "fails-then-hangs"
            }

            async fn execute(
                &self,
                _prompt: &str,
                _options: &ProviderOptions,
            ) -> std::result::Result<ModelResponse, ProviderError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                }
                Ok(ModelResponse {
                    content: "not json".into(),
                    usage: TokenUsage::default(),
                    finish_reason: "stop".into(),
                })
            }
        }

        let mut config = config();
        config.executor.operation_timeout_ms = 300;
        let provider = Arc::new(FailsThenHangs {
            calls: AtomicU32::new(0),
        });
        let engine = SignalEngine::start(config, provider.clone(), guidelines()).unwrap();
        let mut events = engine.subscribe();

        let err = engine.submit(&signal("sig_1"), SubmitOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::OperationTimeout(300)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let mut reported = None;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::TaskFailed { attempts, kind, .. } = event {
                assert_eq!(kind, "operation_timeout");
                reported = Some(attempts);
            }
        }
        assert_eq!(reported, Some(1));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let engine = SignalEngine::start(config(), Arc::new(DryRunProvider), guidelines()).unwrap();
        engine.shutdown().await.unwrap();
        let err = engine.submit(&signal("sig_1"), SubmitOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = config();
        config.pool.max_workers = 0;
        let err = SignalEngine::start(config, Arc::new(DryRunProvider), guidelines())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
