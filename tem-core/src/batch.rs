//! Batch CRUD, aggregate statistics, and bulk state transitions.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value as Json;

use crate::error::{StoreError, TemError, TemResult};
use crate::ids::BatchId;
use crate::model::{Batch, BatchInterruptionCriteria, BatchStats, BatchStatus};
use crate::store::Store;

fn row_to_batch(row: &Row<'_>) -> rusqlite::Result<Batch> {
    let metadata_text: Option<String> = row.get("metadata")?;
    let criteria_text: Option<String> = row.get("interruption_criteria")?;
    Ok(Batch {
        id: row.get("id")?,
        code: row.get("code")?,
        r#type: row.get("type")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        completed_at: row.get("completed_at")?,
        metadata: metadata_text.and_then(|t| serde_json::from_str(&t).ok()),
        interruption_criteria: criteria_text.and_then(|t| serde_json::from_str(&t).ok()),
    })
}

/// Input for [`BatchService::create`].
#[derive(Debug, Clone, Default)]
pub struct NewBatch {
    pub code: String,
    pub r#type: String,
    pub metadata: Option<Json>,
    pub interruption_criteria: Option<BatchInterruptionCriteria>,
}

#[derive(Debug, Clone)]
pub struct BatchService {
    store: Store,
}

impl BatchService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, input: NewBatch) -> TemResult<Batch> {
        let NewBatch {
            code,
            r#type,
            metadata,
            interruption_criteria,
        } = input;
        let code_for_conflict = code.clone();

        let batch = self
            .store
            .with_conn(move |conn| -> Result<Option<Batch>, StoreError> {
                let metadata_text = metadata.as_ref().map(serde_json::to_string).transpose()?;
                let criteria_text = interruption_criteria
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                let now = Utc::now();
                conn.query_row(
                    "INSERT INTO batch (code, type, status, created_at, metadata, interruption_criteria)
                     VALUES (?1, ?2, 'active', ?3, ?4, ?5)
                     RETURNING *",
                    params![code, r#type, now, metadata_text, criteria_text],
                    row_to_batch,
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await
            .map_err(|e| map_duplicate_code(e, &code_for_conflict))?;

        batch.ok_or_else(|| TemError::InvalidArgument("batch insert returned no row".into()))
    }

    pub async fn get_by_id(&self, id: BatchId) -> TemResult<Batch> {
        let found = self
            .store
            .with_conn(move |conn| -> Result<Option<Batch>, StoreError> {
                conn.query_row("SELECT * FROM batch WHERE id = ?1", [id], row_to_batch)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await?;
        found.ok_or(TemError::BatchNotFound(id))
    }

    pub async fn get_by_code(&self, code: &str) -> TemResult<Batch> {
        let code = code.to_string();
        let found = self
            .store
            .with_conn(move |conn| -> Result<Option<Batch>, StoreError> {
                conn.query_row("SELECT * FROM batch WHERE code = ?1", [&code], row_to_batch)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await?;
        found.ok_or_else(|| TemError::InvalidArgument(format!("no batch with code {code:?}")))
    }

    pub async fn list(&self) -> TemResult<Vec<Batch>> {
        let batches = self
            .store
            .with_conn(|conn| -> Result<Vec<Batch>, StoreError> {
                let mut stmt = conn.prepare("SELECT * FROM batch ORDER BY created_at")?;
                let rows = stmt.query_map([], row_to_batch)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
            })
            .await?;
        Ok(batches)
    }

    /// Aggregated count-by-status for a batch, computed in a single query.
    pub async fn get_stats(&self, id: BatchId) -> TemResult<BatchStats> {
        let stats = self
            .store
            .with_conn(move |conn| -> Result<BatchStats, StoreError> {
                conn.query_row(
                    "SELECT
                        COUNT(*),
                        COUNT(*) FILTER (WHERE status = 'pending'),
                        COUNT(*) FILTER (WHERE status = 'running'),
                        COUNT(*) FILTER (WHERE status = 'completed'),
                        COUNT(*) FILTER (WHERE status = 'failed')
                     FROM task WHERE batch_id = ?1",
                    [id],
                    |row| {
                        Ok(BatchStats {
                            total: row.get::<_, i64>(0)? as u64,
                            pending: row.get::<_, i64>(1)? as u64,
                            running: row.get::<_, i64>(2)? as u64,
                            completed: row.get::<_, i64>(3)? as u64,
                            failed: row.get::<_, i64>(4)? as u64,
                        })
                    },
                )
                .map_err(StoreError::from)
            })
            .await?;
        Ok(stats)
    }

    /// Resets every `running` task in the batch to `pending`. Used for
    /// crash recovery; safe to run while workers are stopped. Idempotent:
    /// a second call with no running tasks returns 0.
    pub async fn resume(&self, id: BatchId) -> TemResult<u64> {
        let n = self
            .store
            .with_conn(move |conn| -> Result<u64, StoreError> {
                let changed = conn.execute(
                    "UPDATE task SET status = 'pending', claimed_at = NULL, version = version + 1
                     WHERE batch_id = ?1 AND status = 'running'",
                    [id],
                )?;
                Ok(changed as u64)
            })
            .await?;
        Ok(n)
    }

    /// Resets every `failed` task in the batch to `pending` and its
    /// `attempt` counter to 0. Idempotent.
    pub async fn retry_failed(&self, id: BatchId) -> TemResult<u64> {
        let n = self
            .store
            .with_conn(move |conn| -> Result<u64, StoreError> {
                let changed = conn.execute(
                    "UPDATE task
                     SET status = 'pending', claimed_at = NULL, completed_at = NULL,
                         error = NULL, attempt = 0, version = version + 1
                     WHERE batch_id = ?1 AND status = 'failed'",
                    [id],
                )?;
                Ok(changed as u64)
            })
            .await?;
        Ok(n)
    }

    /// Unconditional status change, used by the interruption controller and
    /// by callers re-activating an interrupted batch. `resume` never flips
    /// batch status itself; that stays this method's job.
    pub async fn update_status(&self, id: BatchId, status: BatchStatus) -> TemResult<Batch> {
        let batch = self
            .store
            .with_conn(move |conn| -> Result<Option<Batch>, StoreError> {
                let completed_at = matches!(status, BatchStatus::Completed).then(Utc::now);
                conn.query_row(
                    "UPDATE batch SET status = ?2, completed_at = COALESCE(?3, completed_at)
                     WHERE id = ?1
                     RETURNING *",
                    params![id, status, completed_at],
                    row_to_batch,
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;
        batch.ok_or(TemError::BatchNotFound(id))
    }

    pub async fn get_with_criteria(
        &self,
        id: BatchId,
    ) -> TemResult<(Batch, Option<BatchInterruptionCriteria>)> {
        let batch = self.get_by_id(id).await?;
        let criteria = batch.interruption_criteria.clone();
        Ok((batch, criteria))
    }
}

fn map_duplicate_code(err: StoreError, code: &str) -> TemError {
    if let StoreError::Sqlite(rusqlite::Error::SqliteFailure(ref e, _)) = err {
        if e.code == rusqlite::ErrorCode::ConstraintViolation {
            return TemError::DuplicateBatchCode(code.to_string());
        }
    }
    TemError::Store(err)
}
