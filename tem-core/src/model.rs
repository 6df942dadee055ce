use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ids::{BatchId, TaskId};

/// Lifecycle state of a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Active,
    Interrupted,
    Completed,
}

impl BatchStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Active => "active",
            BatchStatus::Interrupted => "interrupted",
            BatchStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BatchStatus::Active),
            "interrupted" => Ok(BatchStatus::Interrupted),
            "completed" => Ok(BatchStatus::Completed),
            other => Err(format!("unknown batch status {other:?}")),
        }
    }
}

impl ToSql for BatchStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for BatchStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse().map_err(|_| FromSqlError::InvalidType)
    }
}

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status {other:?}")),
        }
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse().map_err(|_| FromSqlError::InvalidType)
    }
}

/// Why the interruption controller stopped a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionReason {
    ErrorRateExceeded,
    FailedTasksExceeded,
    ConsecutiveFailuresExceeded,
    RateLimitHitsExceeded,
    ConcurrencyErrorsExceeded,
    TaskTimeout,
    BatchRuntimeExceeded,
    Manual,
}

impl InterruptionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptionReason::ErrorRateExceeded => "error_rate_exceeded",
            InterruptionReason::FailedTasksExceeded => "failed_tasks_exceeded",
            InterruptionReason::ConsecutiveFailuresExceeded => "consecutive_failures_exceeded",
            InterruptionReason::RateLimitHitsExceeded => "rate_limit_hits_exceeded",
            InterruptionReason::ConcurrencyErrorsExceeded => "concurrency_errors_exceeded",
            InterruptionReason::TaskTimeout => "task_timeout",
            InterruptionReason::BatchRuntimeExceeded => "batch_runtime_exceeded",
            InterruptionReason::Manual => "manual",
        }
    }
}

impl std::str::FromStr for InterruptionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use InterruptionReason::*;
        Ok(match s {
            "error_rate_exceeded" => ErrorRateExceeded,
            "failed_tasks_exceeded" => FailedTasksExceeded,
            "consecutive_failures_exceeded" => ConsecutiveFailuresExceeded,
            "rate_limit_hits_exceeded" => RateLimitHitsExceeded,
            "concurrency_errors_exceeded" => ConcurrencyErrorsExceeded,
            "task_timeout" => TaskTimeout,
            "batch_runtime_exceeded" => BatchRuntimeExceeded,
            "manual" => Manual,
            other => return Err(format!("unknown interruption reason {other:?}")),
        })
    }
}

impl ToSql for InterruptionReason {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for InterruptionReason {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse().map_err(|_| FromSqlError::InvalidType)
    }
}

/// Optional policy thresholds evaluated by the interruption controller.
/// Every field disabled (`None`) unless set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchInterruptionCriteria {
    pub max_error_rate: Option<f64>,
    pub max_failed_tasks: Option<u64>,
    pub max_consecutive_failures: Option<u64>,
    pub max_rate_limit_hits: Option<u64>,
    pub max_concurrency_errors: Option<u64>,
    pub task_timeout_ms: Option<u64>,
    pub max_batch_runtime_ms: Option<u64>,
}

impl BatchInterruptionCriteria {
    pub fn is_empty(&self) -> bool {
        self.max_error_rate.is_none()
            && self.max_failed_tasks.is_none()
            && self.max_consecutive_failures.is_none()
            && self.max_rate_limit_hits.is_none()
            && self.max_concurrency_errors.is_none()
            && self.task_timeout_ms.is_none()
            && self.max_batch_runtime_ms.is_none()
    }

    /// Merge `self` (batch-level) with an engine-level default, the
    /// engine-level values winning on conflict, so a batch can never
    /// loosen the operator's global safety ceiling.
    pub fn merge_engine_over(&self, engine: &BatchInterruptionCriteria) -> BatchInterruptionCriteria {
        BatchInterruptionCriteria {
            max_error_rate: engine.max_error_rate.or(self.max_error_rate),
            max_failed_tasks: engine.max_failed_tasks.or(self.max_failed_tasks),
            max_consecutive_failures: engine
                .max_consecutive_failures
                .or(self.max_consecutive_failures),
            max_rate_limit_hits: engine.max_rate_limit_hits.or(self.max_rate_limit_hits),
            max_concurrency_errors: engine
                .max_concurrency_errors
                .or(self.max_concurrency_errors),
            task_timeout_ms: engine.task_timeout_ms.or(self.task_timeout_ms),
            max_batch_runtime_ms: engine.max_batch_runtime_ms.or(self.max_batch_runtime_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub code: String,
    pub r#type: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Option<Json>,
    pub interruption_criteria: Option<BatchInterruptionCriteria>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub batch_id: Option<BatchId>,
    pub r#type: String,
    pub status: TaskStatus,
    pub payload: Json,
    pub result: Option<Json>,
    pub error: Option<String>,
    pub attempt: u32,
    pub max_attempt: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptionEvent {
    pub id: i64,
    pub batch_id: BatchId,
    pub reason: InterruptionReason,
    pub message: String,
    pub stats_snapshot: BatchStats,
    pub created_at: DateTime<Utc>,
}

/// Input for [`crate::task::TaskService::create`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub batch_id: Option<BatchId>,
    pub r#type: String,
    pub payload: Json,
    pub max_attempt: Option<u32>,
}
