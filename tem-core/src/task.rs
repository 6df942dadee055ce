//! Task CRUD and the atomic claim protocol.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{StoreError, TemError, TemResult};
use crate::ids::{BatchId, TaskId};
use crate::model::{NewTask, Task, TaskStatus};
use crate::store::Store;

pub(crate) const DEFAULT_MAX_ATTEMPT: u32 = 3;

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let payload_text: String = row.get("payload")?;
    let result_text: Option<String> = row.get("result")?;
    Ok(Task {
        id: row.get("id")?,
        batch_id: row.get("batch_id")?,
        r#type: row.get("type")?,
        status: row.get("status")?,
        payload: serde_json::from_str(&payload_text).unwrap_or(serde_json::Value::Null),
        result: result_text
            .map(|t| serde_json::from_str(&t))
            .transpose()
            .unwrap_or(None),
        error: row.get("error")?,
        attempt: row.get::<_, i64>("attempt")? as u32,
        max_attempt: row.get::<_, i64>("max_attempt")? as u32,
        claimed_at: row.get("claimed_at")?,
        completed_at: row.get("completed_at")?,
        version: row.get::<_, i64>("version")? as u64,
        created_at: row.get("created_at")?,
    })
}

/// Handle over the `task` table. Holds only a `Store` reference — no
/// ownership cycle with [`crate::batch::BatchService`] or the interruption
/// controller.
#[derive(Debug, Clone)]
pub struct TaskService {
    store: Store,
    default_max_attempt: u32,
}

impl TaskService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            default_max_attempt: DEFAULT_MAX_ATTEMPT,
        }
    }

    /// Overrides the per-task retry budget fallback used by `create`/
    /// `create_many` when a `NewTask` doesn't set its own `max_attempt`.
    pub fn with_default_max_attempt(mut self, n: u32) -> Self {
        self.default_max_attempt = n;
        self
    }

    pub async fn create(&self, input: NewTask) -> TemResult<Task> {
        let ids = self.create_many(vec![input]).await?;
        Ok(ids.into_iter().next().expect("createMany returns one row per input"))
    }

    /// Inserts every input inside a single transaction: all persist or none
    /// do.
    pub async fn create_many(&self, inputs: Vec<NewTask>) -> TemResult<Vec<Task>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let default_max_attempt = self.default_max_attempt;
        let tasks = self
            .store
            .with_conn(move |conn| -> Result<Vec<Task>, StoreError> {
                let tx = conn.transaction()?;
                let mut created = Vec::with_capacity(inputs.len());
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO task (batch_id, type, status, payload, attempt, max_attempt, version, created_at)
                         VALUES (?1, ?2, 'pending', ?3, 0, ?4, 0, ?5)
                         RETURNING *",
                    )?;
                    for input in inputs {
                        let payload = serde_json::to_string(&input.payload)?;
                        let max_attempt = input.max_attempt.unwrap_or(default_max_attempt);
                        let now = Utc::now();
                        let task = stmt.query_row(
                            params![input.batch_id, input.r#type, payload, max_attempt, now],
                            row_to_task,
                        )?;
                        created.push(task);
                    }
                }
                tx.commit()?;
                Ok(created)
            })
            .await?;
        Ok(tasks)
    }

    pub async fn get_by_id(&self, id: TaskId) -> TemResult<Task> {
        let found = self
            .store
            .with_conn(move |conn| -> Result<Option<Task>, StoreError> {
                conn.query_row("SELECT * FROM task WHERE id = ?1", [id], row_to_task)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await?;
        found.ok_or(TemError::TaskNotFound(id))
    }

    /// Atomically claims the oldest pending task (optionally restricted to
    /// `batch_id`), transitioning it to `running` and stamping `claimed_at`,
    /// incrementing `attempt` and `version` — all in one conditional
    /// `UPDATE ... RETURNING` so the `status = 'pending'` check is
    /// re-verified at mutation time, not merely inside the subselect.
    ///
    /// Returns `Ok(None)` when nothing is claimable.
    pub async fn claim(&self, batch_id: Option<BatchId>) -> TemResult<Option<Task>> {
        let claimed = self
            .store
            .with_conn(move |conn| -> Result<Option<Task>, StoreError> {
                claim_one(conn, batch_id)
            })
            .await?;
        Ok(claimed)
    }

    /// Marks a (presumably `running`) task `completed`, writing its result.
    /// Not guarded by status: callers are expected to hold a task they
    /// themselves claimed.
    pub async fn complete(&self, id: TaskId, result: serde_json::Value) -> TemResult<Task> {
        let task = self
            .store
            .with_conn(move |conn| -> Result<Option<Task>, StoreError> {
                let result_text = serde_json::to_string(&result)?;
                let now = Utc::now();
                conn.query_row(
                    "UPDATE task
                     SET status = 'completed', completed_at = ?2, result = ?3, version = version + 1
                     WHERE id = ?1
                     RETURNING *",
                    params![id, now, result_text],
                    row_to_task,
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;
        task.ok_or(TemError::TaskNotFound(id))
    }

    /// Marks a task `failed`, recording the error message.
    pub async fn fail(&self, id: TaskId, error: impl Into<String>) -> TemResult<Task> {
        let error = error.into();
        let task = self
            .store
            .with_conn(move |conn| -> Result<Option<Task>, StoreError> {
                let now = Utc::now();
                conn.query_row(
                    "UPDATE task
                     SET status = 'failed', completed_at = ?2, error = ?3, version = version + 1
                     WHERE id = ?1
                     RETURNING *",
                    params![id, now, error],
                    row_to_task,
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;
        task.ok_or(TemError::TaskNotFound(id))
    }

    /// Resets a task to `pending` for retry: clears `claimed_at`, bumps
    /// `version`. `attempt` is left unchanged — it was already incremented
    /// on the claim that produced this failure.
    pub async fn retry(&self, id: TaskId) -> TemResult<Task> {
        let task = self
            .store
            .with_conn(move |conn| -> Result<Option<Task>, StoreError> {
                conn.query_row(
                    "UPDATE task
                     SET status = 'pending', claimed_at = NULL, version = version + 1
                     WHERE id = ?1
                     RETURNING *",
                    [id],
                    row_to_task,
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;
        task.ok_or(TemError::TaskNotFound(id))
    }

    pub async fn list_by_batch(&self, batch_id: BatchId) -> TemResult<Vec<Task>> {
        let tasks = self
            .store
            .with_conn(move |conn| -> Result<Vec<Task>, StoreError> {
                let mut stmt =
                    conn.prepare("SELECT * FROM task WHERE batch_id = ?1 ORDER BY created_at")?;
                let rows = stmt.query_map([batch_id], row_to_task)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
            })
            .await?;
        Ok(tasks)
    }

    pub fn status_filter(status: TaskStatus) -> &'static str {
        match status {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

fn claim_one(conn: &mut Connection, batch_id: Option<BatchId>) -> Result<Option<Task>, StoreError> {
    let now = Utc::now();
    let result = match batch_id {
        Some(batch_id) => conn
            .query_row(
                "UPDATE task
                 SET status = 'running', claimed_at = ?2, attempt = attempt + 1, version = version + 1
                 WHERE id = (
                     SELECT id FROM task
                     WHERE status = 'pending' AND batch_id = ?1
                     ORDER BY created_at
                     LIMIT 1
                 )
                 AND status = 'pending'
                 RETURNING *",
                params![batch_id, now],
                row_to_task,
            )
            .optional(),
        None => conn
            .query_row(
                "UPDATE task
                 SET status = 'running', claimed_at = ?1, attempt = attempt + 1, version = version + 1
                 WHERE id = (
                     SELECT id FROM task
                     WHERE status = 'pending'
                     ORDER BY created_at
                     LIMIT 1
                 )
                 AND status = 'pending'
                 RETURNING *",
                params![now],
                row_to_task,
            )
            .optional(),
    };
    result.map_err(StoreError::from)
}
