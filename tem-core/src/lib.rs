//! Durable task execution manager: durable batches of retryable tasks driven
//! by a cooperative worker engine with concurrency gating, rate limiting,
//! and policy-based interruption.

pub mod batch;
pub mod error;
pub mod facade;
pub mod gate;
pub mod ids;
pub mod interruption;
pub mod model;
pub mod rate_limiter;
pub mod store;
pub mod task;
pub mod worker;

pub use batch::{BatchService, NewBatch};
pub use error::{StoreError, TemError, TemResult};
pub use facade::{Tem, TemConfig, TemConfigBuilder};
pub use gate::{ConcurrencyGate, GateGuard};
pub use ids::{BatchId, TaskId};
pub use interruption::{InterruptionContext, InterruptionController};
pub use model::{
    Batch, BatchInterruptionCriteria, BatchStats, BatchStatus, InterruptionEvent, InterruptionReason, NewTask, Task,
    TaskStatus,
};
pub use rate_limiter::{RateLimit, RateLimiter};
pub use store::Store;
pub use task::TaskService;
pub use worker::{Ctx, ErrorClass, Handler, HandlerError, WorkerConfig, WorkerEngine};
