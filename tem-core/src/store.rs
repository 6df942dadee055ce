//! Persistent, transactional store backing the engine.
//!
//! A single `rusqlite::Connection` guarded by a `Mutex` and shared via `Arc`:
//! one writer at a time (`locking_mode = EXCLUSIVE`, WAL journaling).
//! Blocking calls are dispatched through `spawn_blocking` so the async
//! worker loop never stalls its reactor thread on disk I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::StoreError;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE batch (
            id INTEGER PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'interrupted', 'completed')),
            created_at TEXT NOT NULL,
            completed_at TEXT,
            metadata TEXT,
            interruption_criteria TEXT
        );

        CREATE INDEX batch_code_idx ON batch(code);
        CREATE INDEX batch_type_idx ON batch(type);
        CREATE INDEX batch_status_idx ON batch(status);

        CREATE TABLE task (
            id INTEGER PRIMARY KEY,
            batch_id INTEGER REFERENCES batch(id) ON DELETE CASCADE,
            type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'running', 'completed', 'failed')),
            payload TEXT NOT NULL,
            result TEXT,
            error TEXT,
            attempt INTEGER NOT NULL DEFAULT 0,
            max_attempt INTEGER NOT NULL DEFAULT 3,
            claimed_at TEXT,
            completed_at TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX task_batch_id_idx ON task(batch_id);
        CREATE INDEX task_status_idx ON task(status);
        CREATE INDEX task_type_idx ON task(type);
        CREATE INDEX task_status_claimed_at_idx ON task(status, claimed_at);
        CREATE INDEX task_pending_created_at_idx ON task(status, created_at)
            WHERE status = 'pending';

        CREATE TABLE batch_interrupt_log (
            id INTEGER PRIMARY KEY,
            batch_id INTEGER NOT NULL REFERENCES batch(id) ON DELETE CASCADE,
            reason TEXT NOT NULL,
            message TEXT NOT NULL,
            stats_snapshot TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX batch_interrupt_log_batch_id_idx ON batch_interrupt_log(batch_id);
        "#,
    ),
];

/// Persistent handle to the task/batch database.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens the database at `path`, creating it (and its schema) if it
    /// doesn't exist, then applying any migrations not yet recorded in
    /// `_migration`.
    pub async fn open_or_create(path: impl AsRef<Path> + Send + 'static) -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(path.as_ref())?;
            conn.pragma_update(None, "foreign_keys", true)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5_000)?;
            conn.pragma_update(None, "temp_store", "MEMORY")?;

            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS _migration (
                    id INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );",
            )?;

            let applied: i64 = conn
                .query_row("SELECT COALESCE(MAX(id), 0) FROM _migration", [], |row| row.get(0))?;

            for (id, sql) in MIGRATIONS {
                if *id > applied {
                    let tx = conn.unchecked_transaction()?;
                    tx.execute_batch(sql)?;
                    tx.execute("INSERT INTO _migration (id) VALUES (?1)", [id])?;
                    tx.commit()?;
                    tracing::info!(migration = id, "applied store migration");
                }
            }

            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an existing database read-only, for diagnostic tools that must
    /// never mutate it. Fails if the file doesn't already exist or carries
    /// no applied migrations.
    pub async fn open_read_only(path: impl AsRef<Path> + Send + 'static) -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open_with_flags(path.as_ref(), rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            conn.pragma_update(None, "busy_timeout", 5_000)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database, for tests and demos. Skips file
    /// durability pragmas that don't apply to `:memory:`.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, StoreError> {
            let conn = Connection::open_in_memory()?;
            conn.pragma_update(None, "foreign_keys", true)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS _migration (
                    id INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );",
            )?;
            for (id, sql) in MIGRATIONS {
                let tx = conn.unchecked_transaction()?;
                tx.execute_batch(sql)?;
                tx.execute("INSERT INTO _migration (id) VALUES (?1)", [id])?;
                tx.commit()?;
            }
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the underlying connection on a blocking thread.
    ///
    /// `f` receives a `&mut Connection` so callers can open transactions;
    /// this is the single choke point every other module routes SQL through.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poison| poison.into_inner());
            f(&mut guard)
        })
        .await?
    }

    /// Closes the store. Dropping the last `Arc` closes the SQLite
    /// connection; this is provided for symmetry with the facade's own
    /// `stop()`/`close()` pair.
    pub async fn close(self) {
        drop(self.conn);
    }
}
