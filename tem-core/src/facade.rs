//! Binds Store, batch/task services, interruption controller, and worker
//! engine into one object.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::batch::BatchService;
use crate::error::TemResult;
use crate::interruption::InterruptionController;
use crate::model::BatchInterruptionCriteria;
use crate::rate_limiter::RateLimit;
use crate::store::Store;
use crate::task::TaskService;
use crate::worker::{ErrorClass, Handler, WorkerConfig, WorkerEngine};

/// Facade construction options, enumerated in spec.md §6.
#[derive(Default)]
pub struct TemConfig {
    pub database_path: Option<PathBuf>,
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    pub default_max_attempts: u32,
    pub poll_interval: Duration,
    pub batch_id: Option<crate::ids::BatchId>,
    pub default_interruption_criteria: Option<BatchInterruptionCriteria>,
}

impl TemConfig {
    pub fn builder() -> TemConfigBuilder {
        TemConfigBuilder::default()
    }
}

/// Small ergonomic builder over [`TemConfig`], used instead of a raw
/// constructor with a dozen positional arguments.
#[derive(Default)]
pub struct TemConfigBuilder {
    database_path: Option<PathBuf>,
    concurrency: usize,
    rate_limit: Option<RateLimit>,
    default_max_attempts: Option<u32>,
    poll_interval: Option<Duration>,
    batch_id: Option<crate::ids::BatchId>,
    default_interruption_criteria: Option<BatchInterruptionCriteria>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    error_classifier: Option<Arc<dyn Fn(&str) -> ErrorClass + Send + Sync>>,
}

impl TemConfigBuilder {
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn default_max_attempts(mut self, n: u32) -> Self {
        self.default_max_attempts = Some(n);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn batch_id(mut self, id: crate::ids::BatchId) -> Self {
        self.batch_id = Some(id);
        self
    }

    pub fn default_interruption_criteria(mut self, criteria: BatchInterruptionCriteria) -> Self {
        self.default_interruption_criteria = Some(criteria);
        self
    }

    pub fn handler(mut self, task_type: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(task_type.into(), handler);
        self
    }

    pub fn error_classifier(mut self, f: impl Fn(&str) -> ErrorClass + Send + Sync + 'static) -> Self {
        self.error_classifier = Some(Arc::new(f));
        self
    }

    /// Opens (creating if needed) the Store and assembles every component.
    pub async fn build(self) -> TemResult<Tem> {
        if self.concurrency == 0 {
            return Err(crate::error::TemError::InvalidConcurrency);
        }
        let store = match self.database_path {
            Some(path) => Store::open_or_create(path).await?,
            None => Store::open_in_memory().await?,
        };

        let batches = BatchService::new(store.clone());
        let tasks = TaskService::new(store.clone());
        let tasks = match self.default_max_attempts {
            Some(n) => tasks.with_default_max_attempt(n),
            None => tasks,
        };
        let interruption =
            InterruptionController::new(store.clone(), batches.clone(), self.default_interruption_criteria);

        let mut worker_config = WorkerConfig {
            concurrency: self.concurrency,
            rate_limit: self.rate_limit,
            poll_interval: self.poll_interval.unwrap_or(Duration::from_millis(200)),
            batch_id: self.batch_id,
            ..WorkerConfig::default()
        };
        if let Some(classifier) = self.error_classifier {
            worker_config.error_classifier = classifier;
        }

        let worker = WorkerEngine::new(
            tasks.clone(),
            batches.clone(),
            Some(interruption.clone()),
            self.handlers,
            worker_config,
        );

        Ok(Tem {
            store,
            batches,
            tasks,
            interruption,
            worker,
        })
    }
}

/// The crate's single public entry point: owns the Store handle and wires
/// every other component to it.
#[derive(Clone)]
pub struct Tem {
    store: Store,
    batches: BatchService,
    tasks: TaskService,
    interruption: InterruptionController,
    worker: WorkerEngine,
}

impl Tem {
    pub fn builder() -> TemConfigBuilder {
        TemConfig::builder()
    }

    pub fn batches(&self) -> &BatchService {
        &self.batches
    }

    pub fn tasks(&self) -> &TaskService {
        &self.tasks
    }

    pub fn interruption(&self) -> &InterruptionController {
        &self.interruption
    }

    pub fn worker(&self) -> &WorkerEngine {
        &self.worker
    }

    pub async fn start(&self) {
        self.worker.start().await;
    }

    /// Stops the worker and closes the Store.
    pub async fn stop(self) -> TemResult<()> {
        self.worker.stop().await?;
        self.store.clone().close().await;
        Ok(())
    }
}
