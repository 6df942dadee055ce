//! Policy engine halting a batch when failure patterns cross configured
//! thresholds.

use chrono::Utc;
use rusqlite::{params, Row};

use crate::batch::BatchService;
use crate::error::{StoreError, TemResult};
use crate::ids::BatchId;
use crate::model::{BatchInterruptionCriteria, BatchStatus, InterruptionEvent, InterruptionReason};
use crate::store::Store;

/// Worker-supplied counters the controller can't derive from the Store
/// alone: consecutive failures, rate-limit hits, concurrency errors, and
/// the current task's running time. Passed by value, never shared state.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptionContext {
    pub consecutive_failures: u64,
    pub rate_limit_hits: u64,
    pub concurrency_errors: u64,
    pub current_task_runtime_ms: Option<u64>,
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<InterruptionEvent> {
    let snapshot_text: String = row.get("stats_snapshot")?;
    Ok(InterruptionEvent {
        id: row.get("id")?,
        batch_id: row.get("batch_id")?,
        reason: row.get("reason")?,
        message: row.get("message")?,
        stats_snapshot: serde_json::from_str(&snapshot_text).unwrap_or_default(),
        created_at: row.get("created_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct InterruptionController {
    store: Store,
    batches: BatchService,
    engine_default: Option<BatchInterruptionCriteria>,
}

impl InterruptionController {
    pub fn new(store: Store, batches: BatchService, engine_default: Option<BatchInterruptionCriteria>) -> Self {
        Self {
            store,
            batches,
            engine_default,
        }
    }

    pub async fn is_batch_active(&self, id: BatchId) -> TemResult<bool> {
        match self.batches.get_by_id(id).await {
            Ok(batch) => Ok(matches!(batch.status, BatchStatus::Active)),
            Err(_) => Ok(false),
        }
    }

    /// Evaluates policy triggers in a fixed order and, on the first hit,
    /// calls [`Self::interrupt`]. Returns whether the batch was
    /// interrupted.
    pub async fn check_and_interrupt_if_needed(
        &self,
        batch_id: BatchId,
        ctx: InterruptionContext,
    ) -> TemResult<bool> {
        let batch = match self.batches.get_by_id(batch_id).await {
            Ok(batch) => batch,
            Err(_) => return Ok(false),
        };
        if !matches!(batch.status, BatchStatus::Active) {
            return Ok(false);
        }

        let batch_criteria = batch.interruption_criteria.clone().unwrap_or_default();
        let criteria = match &self.engine_default {
            Some(engine) => batch_criteria.merge_engine_over(engine),
            None => batch_criteria,
        };
        if criteria.is_empty() {
            return Ok(false);
        }

        let stats = self.batches.get_stats(batch_id).await?;

        if let Some(max_runtime) = criteria.max_batch_runtime_ms {
            let elapsed_ms = (Utc::now() - batch.created_at).num_milliseconds().max(0) as u64;
            if elapsed_ms > max_runtime {
                self.interrupt(
                    batch_id,
                    InterruptionReason::BatchRuntimeExceeded,
                    format!("batch runtime {elapsed_ms}ms exceeded limit {max_runtime}ms"),
                )
                .await?;
                return Ok(true);
            }
        }

        if let (Some(timeout), Some(runtime)) = (criteria.task_timeout_ms, ctx.current_task_runtime_ms) {
            if runtime > timeout {
                self.interrupt(
                    batch_id,
                    InterruptionReason::TaskTimeout,
                    format!("task runtime {runtime}ms exceeded timeout {timeout}ms"),
                )
                .await?;
                return Ok(true);
            }
        }

        if let Some(threshold) = criteria.max_consecutive_failures {
            if ctx.consecutive_failures >= threshold {
                self.interrupt(
                    batch_id,
                    InterruptionReason::ConsecutiveFailuresExceeded,
                    format!("{} consecutive failures reached threshold {threshold}", ctx.consecutive_failures),
                )
                .await?;
                return Ok(true);
            }
        }

        if let Some(threshold) = criteria.max_rate_limit_hits {
            if ctx.rate_limit_hits >= threshold {
                self.interrupt(
                    batch_id,
                    InterruptionReason::RateLimitHitsExceeded,
                    format!("{} rate-limit hits reached threshold {threshold}", ctx.rate_limit_hits),
                )
                .await?;
                return Ok(true);
            }
        }

        if let Some(threshold) = criteria.max_concurrency_errors {
            if ctx.concurrency_errors >= threshold {
                self.interrupt(
                    batch_id,
                    InterruptionReason::ConcurrencyErrorsExceeded,
                    format!("{} concurrency errors reached threshold {threshold}", ctx.concurrency_errors),
                )
                .await?;
                return Ok(true);
            }
        }

        if let Some(threshold) = criteria.max_failed_tasks {
            if stats.failed >= threshold {
                self.interrupt(
                    batch_id,
                    InterruptionReason::FailedTasksExceeded,
                    format!("{} failed tasks reached threshold {threshold}", stats.failed),
                )
                .await?;
                return Ok(true);
            }
        }

        if let Some(max_rate) = criteria.max_error_rate {
            if stats.total > 0 {
                let rate = stats.failed as f64 / stats.total as f64;
                if rate > max_rate {
                    self.interrupt(
                        batch_id,
                        InterruptionReason::ErrorRateExceeded,
                        format!("error rate {rate:.3} exceeded limit {max_rate:.3}"),
                    )
                    .await?;
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Snapshots stats, flips the batch to `interrupted`, and appends an
    /// audit log entry, all in one transaction.
    pub async fn interrupt(
        &self,
        batch_id: BatchId,
        reason: InterruptionReason,
        message: impl Into<String>,
    ) -> TemResult<()> {
        let message = message.into();
        let stats = self.batches.get_stats(batch_id).await?;
        let store = self.store.clone();
        store
            .with_conn(move |conn| -> Result<(), StoreError> {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE batch SET status = 'interrupted' WHERE id = ?1",
                    params![batch_id],
                )?;
                let snapshot_text = serde_json::to_string(&stats)?;
                let now = Utc::now();
                tx.execute(
                    "INSERT INTO batch_interrupt_log (batch_id, reason, message, stats_snapshot, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![batch_id, reason, message, snapshot_text, now],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        tracing::warn!(%batch_id, reason = reason.as_str(), %message, "batch interrupted");
        Ok(())
    }

    /// Events for a batch, most recent first.
    pub async fn get_interruption_log(&self, batch_id: BatchId) -> TemResult<Vec<InterruptionEvent>> {
        let events = self
            .store
            .with_conn(move |conn| -> Result<Vec<InterruptionEvent>, StoreError> {
                let mut stmt = conn.prepare(
                    "SELECT * FROM batch_interrupt_log WHERE batch_id = ?1 ORDER BY created_at DESC, id DESC",
                )?;
                let rows = stmt.query_map(params![batch_id], row_to_event)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
            })
            .await?;
        Ok(events)
    }
}
