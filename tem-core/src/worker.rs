//! Cooperative scheduler: bounded in-flight set, rate limiting, error
//! classification, and retry decisions.
//!
//! Generalizes `reqactor::Actor::serve_in_background`'s loop shape (pop one
//! unit of work, acquire a semaphore permit, spawn its execution, keep
//! polling) from a priority action queue over to the engine's own atomic
//! `TaskService::claim`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchService;
use crate::error::TemResult;
use crate::gate::ConcurrencyGate;
use crate::ids::{BatchId, TaskId};
use crate::interruption::{InterruptionContext, InterruptionController};
use crate::model::Task;
use crate::rate_limiter::{RateLimit, RateLimiter};
use crate::task::TaskService;

/// Error a [`Handler`] returns. The `Retryable`/`NonRetryable` distinction
/// is the "marker value" spec.md §6 describes for short-circuiting retry.
#[derive(Debug, Clone)]
pub enum HandlerError {
    Retryable(String),
    NonRetryable(String),
}

impl HandlerError {
    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(m) | HandlerError::NonRetryable(m) => m,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for HandlerError {}

/// Context passed to a handler invocation. See spec.md §6's handler contract.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub task_id: TaskId,
    pub batch_id: Option<BatchId>,
    pub attempt: u32,
    pub cancel: CancellationToken,
    pub deadline: Option<DateTime<Utc>>,
}

/// A user-supplied async function selected by task type: transforms payload
/// to result or returns a [`HandlerError`].
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: Json, ctx: Ctx) -> Result<Json, HandlerError>;
}

/// Coarse bucket an error message falls into, per spec.md §4.7's textual
/// classifier. Exposed so callers can plug in their own via
/// [`WorkerConfig::error_classifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimit,
    Concurrency,
    Other,
}

/// Default classifier: loose substring matching, deliberately permissive
/// per spec.md §9 because it must match whatever text handlers construct.
pub fn default_classify(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") {
        ErrorClass::RateLimit
    } else if lower.contains("502")
        || lower.contains("503")
        || lower.contains("bad gateway")
        || lower.contains("service unavailable")
    {
        ErrorClass::Concurrency
    } else {
        ErrorClass::Other
    }
}

/// Construction-time configuration for a [`WorkerEngine`]. See spec.md §6's
/// enumerated facade construction options.
pub struct WorkerConfig {
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    pub poll_interval: Duration,
    pub batch_id: Option<BatchId>,
    pub error_classifier: Arc<dyn Fn(&str) -> ErrorClass + Send + Sync>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            rate_limit: None,
            poll_interval: Duration::from_millis(200),
            batch_id: None,
            error_classifier: Arc::new(default_classify),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    consecutive_failures: u64,
    rate_limit_hits: u64,
    concurrency_errors: u64,
}

/// Owns the in-flight set (implicitly, via [`ConcurrencyGate`]) and counters
/// described in spec.md §5's "shared-resource policy": counters belong to
/// the engine and are only ever handed to the interruption controller by
/// value.
#[derive(Clone)]
pub struct WorkerEngine {
    tasks: TaskService,
    batches: BatchService,
    gate: ConcurrencyGate,
    rate_limiter: Option<RateLimiter>,
    interruption: Option<InterruptionController>,
    batch_id: Option<BatchId>,
    concurrency: usize,
    poll_interval: Duration,
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
    classify: Arc<dyn Fn(&str) -> ErrorClass + Send + Sync>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    counters: Arc<Mutex<Counters>>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WorkerEngine {
    /// `handlers` must be fully populated before [`Self::start`] is called;
    /// the registry is read-only afterward (spec.md §5).
    pub fn new(
        tasks: TaskService,
        batches: BatchService,
        interruption: Option<InterruptionController>,
        handlers: HashMap<String, Arc<dyn Handler>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            tasks,
            batches,
            gate: ConcurrencyGate::new(config.concurrency.max(1)),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            interruption,
            batch_id: config.batch_id,
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval,
            handlers: Arc::new(handlers),
            classify: config.error_classifier,
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            counters: Arc::new(Mutex::new(Counters::default())),
            driver: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the main loop. Idempotent: calling it again while already
    /// running is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(batch_id = ?self.batch_id, concurrency = self.concurrency, "worker engine starting");
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run_loop().await });
        *self.driver.lock().await = Some(handle);
    }

    async fn run_loop(self) {
        while self.running.load(Ordering::SeqCst) {
            let permit = self.gate.acquire().await;

            if !self.running.load(Ordering::SeqCst) {
                drop(permit);
                break;
            }

            if let (Some(batch_id), Some(controller)) = (self.batch_id, &self.interruption) {
                match controller.is_batch_active(batch_id).await {
                    Ok(true) => {}
                    _ => {
                        drop(permit);
                        tracing::info!(%batch_id, "batch no longer active, stopping worker");
                        self.running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }

            let claimed = self.tasks.claim(self.batch_id).await;
            let task = match claimed {
                Ok(Some(task)) => task,
                Ok(None) => {
                    drop(permit);
                    if self.running.load(Ordering::SeqCst) {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                    continue;
                }
                Err(err) => {
                    drop(permit);
                    tracing::error!(error = %err, "task claim failed");
                    if self.running.load(Ordering::SeqCst) {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                    continue;
                }
            };

            let engine = self.clone();
            tokio::spawn(async move {
                engine.execute(task, permit).await;
            });
        }
    }

    /// Runs one task to a terminal state. Holds `_permit` (and therefore
    /// the concurrency slot) for its whole lifetime, released on drop.
    async fn execute(&self, task: Task, _permit: crate::gate::GateGuard) {
        let start = Instant::now();
        match self.invoke_handler(&task).await {
            Ok(value) => {
                if let Err(err) = self.tasks.complete(task.id, value).await {
                    tracing::error!(task_id = %task.id, error = %err, "failed to persist completion");
                }
                let mut counters = self.counters.lock().await;
                counters.consecutive_failures = 0;
                tracing::info!(task_id = %task.id, "task completed");
            }
            Err(err) => {
                let runtime_ms = start.elapsed().as_millis() as u64;
                self.handle_error(&task, err, runtime_ms).await;
            }
        }
    }

    async fn invoke_handler(&self, task: &Task) -> Result<Json, HandlerError> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let handler = self.handlers.get(&task.r#type).cloned().ok_or_else(|| {
            HandlerError::NonRetryable(format!("no handler registered for task type {:?}", task.r#type))
        })?;

        let deadline = self.task_deadline(task).await;
        let ctx = Ctx {
            task_id: task.id,
            batch_id: task.batch_id,
            attempt: task.attempt,
            cancel: self.cancel.clone(),
            deadline,
        };

        handler.handle(task.payload.clone(), ctx).await
    }

    async fn task_deadline(&self, task: &Task) -> Option<DateTime<Utc>> {
        let batch_id = task.batch_id?;
        let batch = self.batches.get_by_id(batch_id).await.ok()?;
        let timeout_ms = batch.interruption_criteria?.task_timeout_ms?;
        Some(Utc::now() + chrono::Duration::milliseconds(timeout_ms as i64))
    }

    async fn handle_error(&self, task: &Task, err: HandlerError, runtime_ms: u64) {
        let message = err.message().to_string();
        let retryable = err.is_retryable();
        let class = (self.classify)(&message);

        let (consecutive_failures, rate_limit_hits, concurrency_errors, should_retry) = {
            let mut counters = self.counters.lock().await;
            match class {
                ErrorClass::RateLimit => counters.rate_limit_hits += 1,
                ErrorClass::Concurrency => counters.concurrency_errors += 1,
                ErrorClass::Other => {}
            }
            let should_retry = retryable && task.attempt < task.max_attempt;
            counters.consecutive_failures += 1;
            (
                counters.consecutive_failures,
                counters.rate_limit_hits,
                counters.concurrency_errors,
                should_retry,
            )
        };

        if should_retry {
            if let Err(e) = self.tasks.retry(task.id).await {
                tracing::error!(task_id = %task.id, error = %e, "failed to persist retry");
            }
            tracing::warn!(task_id = %task.id, attempt = task.attempt, %message, "task failed, retrying");
            return;
        }

        if let Err(e) = self.tasks.fail(task.id, message.clone()).await {
            tracing::error!(task_id = %task.id, error = %e, "failed to persist failure");
        }
        tracing::error!(task_id = %task.id, %message, "task failed terminally");

        if let (Some(batch_id), Some(controller)) = (task.batch_id, &self.interruption) {
            let ctx = InterruptionContext {
                consecutive_failures,
                rate_limit_hits,
                concurrency_errors,
                current_task_runtime_ms: Some(runtime_ms),
            };
            match controller.check_and_interrupt_if_needed(batch_id, ctx).await {
                Ok(true) => {
                    tracing::warn!(%batch_id, "interruption policy triggered, stopping worker");
                    self.running.store(false, Ordering::SeqCst);
                }
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "interruption check failed"),
            }
        }
    }

    /// Cooperative shutdown: clears the running flag, cancels the shared
    /// token, and awaits every in-flight execution's terminal Store write.
    /// Idempotent.
    pub async fn stop(&self) -> TemResult<()> {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        if let Some(handle) = self.driver.lock().await.take() {
            let _ = handle.await;
        }

        // Every execute() holds a gate permit until its terminal write
        // completes; reacquiring the full capacity blocks until none remain
        // in flight.
        self.gate.drain(self.concurrency).await;

        Ok(())
    }
}
