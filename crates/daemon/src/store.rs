//! Durable task store backed by SQLite.
//!
//! Source of truth for every discovered file and its processing state.
//! The store runs in single-writer mode (one pooled connection, WAL
//! journal) with idempotent additive migrations on startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// A task is eligible for scheduling while its retry count stays below this.
pub const MAX_ATTEMPTS: i64 = 3;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error creating the database directory
    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    /// Insert collided with an existing source path
    #[error("a task already exists for {0}")]
    DuplicatePath(String),
}

/// Lifecycle state of a task
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Irrecoverable,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Irrecoverable => write!(f, "irrecoverable"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "irrecoverable" => Ok(TaskStatus::Irrecoverable),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One transcode task: a source file and its processing state
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    /// Monotonically assigned identity, stable for the task's lifetime
    pub id: i64,
    /// Absolute path of the source file, unique across the store
    pub source_path: String,
    /// Source modification time (unix milliseconds) at creation or last reset
    pub source_mtime: i64,
    /// Source size in bytes at creation or last reset
    pub source_size: i64,
    pub status: TaskStatus,
    pub retry_count: i64,
    /// Advisory progress percentage in [0, 100]
    pub progress: f64,
    /// Size of the published output once known, else 0
    pub output_size: i64,
    /// Corruption-tolerance strategy last chosen: "", "discard", or "cfr"
    pub repair_mode: String,
    pub created_at: DateTime<Utc>,
    /// Set exactly when status is completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Last note attached to a status change
    pub log: Option<String>,
}

impl Task {
    /// The log note, or an empty string when none was recorded.
    pub fn log_text(&self) -> &str {
        self.log.as_deref().unwrap_or("")
    }
}

/// Aggregate counts and saved bytes, computed in one pass
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub irrecoverable: i64,
    /// Σ(source_size − output_size) over completed tasks
    pub total_saved: i64,
}

/// Handle to the task store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str = "id, source_path, source_mtime, source_size, status, retry_count, \
     progress, output_size, repair_mode, created_at, completed_at, log";

impl TaskStore {
    /// Open (or create) the store at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Single-writer discipline: one connection serializes all writes,
        // WAL keeps readers unblocked.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables and indexes, then add any columns introduced after the
    /// original schema. Safe to run on every startup.
    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_path TEXT NOT NULL UNIQUE,
                source_mtime INTEGER NOT NULL,
                source_size INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                progress REAL NOT NULL DEFAULT 0,
                output_size INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                completed_at DATETIME,
                log TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_source_path ON tasks(source_path);
            CREATE INDEX IF NOT EXISTS idx_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_completed_at ON tasks(completed_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.ensure_columns().await
    }

    async fn ensure_columns(&self) -> Result<(), StoreError> {
        let rows = sqlx::query("PRAGMA table_info(tasks)")
            .fetch_all(&self.pool)
            .await?;
        let columns: Vec<String> = rows
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        if !columns.iter().any(|c| c == "repair_mode") {
            sqlx::query("ALTER TABLE tasks ADD COLUMN repair_mode TEXT NOT NULL DEFAULT ''")
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Insert a new pending task. Rejects a duplicate source path.
    pub async fn create(
        &self,
        source_path: &str,
        source_mtime: i64,
        source_size: i64,
    ) -> Result<Task, StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO tasks (source_path, source_mtime, source_size, status, repair_mode, created_at) \
             VALUES (?, ?, ?, ?, '', ?)",
        )
        .bind(source_path)
        .bind(source_mtime)
        .bind(source_size)
        .bind(TaskStatus::Pending)
        .bind(created_at)
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(r) => r,
            Err(e) => {
                if e.as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false)
                {
                    return Err(StoreError::DuplicatePath(source_path.to_string()));
                }
                return Err(e.into());
            }
        };

        Ok(Task {
            id: result.last_insert_rowid(),
            source_path: source_path.to_string(),
            source_mtime,
            source_size,
            status: TaskStatus::Pending,
            retry_count: 0,
            progress: 0.0,
            output_size: 0,
            repair_mode: String::new(),
            created_at,
            completed_at: None,
            log: None,
        })
    }

    /// Look a task up by source path. Absence is not an error.
    pub async fn get_by_path(&self, path: &str) -> Result<Option<Task>, StoreError> {
        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE source_path = ?"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    /// Atomic status + log write. Moving into completed stamps the
    /// completion time; every other status clears it.
    pub async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        log: &str,
    ) -> Result<(), StoreError> {
        let completed_at = match status {
            TaskStatus::Completed => Some(Utc::now()),
            _ => None,
        };
        sqlx::query("UPDATE tasks SET status = ?, log = ?, completed_at = ? WHERE id = ?")
            .bind(status)
            .bind(log)
            .bind(completed_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Conditionally move a pending task to processing. Returns false when
    /// another worker won the row first.
    pub async fn try_lease(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, log = NULL WHERE id = ? AND status = ?",
        )
        .bind(TaskStatus::Processing)
        .bind(id)
        .bind(TaskStatus::Pending)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_progress(&self, id: i64, progress: f64) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET progress = ? WHERE id = ?")
            .bind(progress)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_output_size(&self, id: i64, size: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET output_size = ? WHERE id = ?")
            .bind(size)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_repair_mode(&self, id: i64, mode: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET repair_mode = ? WHERE id = ?")
            .bind(mode)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rewrite a stored path. Used to migrate legacy relative-path records
    /// to absolute form.
    pub async fn update_path(&self, id: i64, new_path: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET source_path = ? WHERE id = ?")
            .bind(new_path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rewrite the fingerprint and return the task to pending with all
    /// attempt state cleared.
    pub async fn reset_to_pending(
        &self,
        path: &str,
        mtime: i64,
        size: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tasks \
             SET status = ?, source_mtime = ?, source_size = ?, retry_count = 0, \
                 progress = 0, completed_at = NULL, log = NULL, repair_mode = '' \
             WHERE source_path = ?",
        )
        .bind(TaskStatus::Pending)
        .bind(mtime)
        .bind(size)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_retry(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET retry_count = retry_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Operator-initiated bulk retry of all failed tasks.
    pub async fn reset_failed_to_pending(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = ?, retry_count = 0, progress = 0, completed_at = NULL, log = ? \
             WHERE status = ?",
        )
        .bind(TaskStatus::Pending)
        .bind("bulk retry requested")
        .bind(TaskStatus::Failed)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Crash recovery: a processing task cannot survive a restart.
    /// Invoked exactly once at startup.
    pub async fn reset_processing_to_pending(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = ?, retry_count = 0, progress = 0, completed_at = NULL, log = ? \
             WHERE status = ?",
        )
        .bind(TaskStatus::Pending)
        .bind("requeued after restart")
        .bind(TaskStatus::Processing)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Up to `limit` schedulable tasks, oldest first (ties broken by id).
    pub async fn get_pending_batch(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let tasks = sqlx::query_as::<_, Task>(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks \
             WHERE status = ? AND retry_count < ? \
             ORDER BY created_at ASC, id ASC LIMIT ?"
        ))
        .bind(TaskStatus::Pending)
        .bind(MAX_ATTEMPTS)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    /// Completed tasks whose completion time is older than `cutoff`.
    pub async fn get_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = sqlx::query_as::<_, Task>(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE status = ? AND completed_at < ?"
        ))
        .bind(TaskStatus::Completed)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    /// Paged task listing, optionally filtered by status, newest first.
    pub async fn get_all(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = match status {
            Some(status) => {
                sqlx::query_as::<_, Task>(&format!(
                    "SELECT {SELECT_COLUMNS} FROM tasks WHERE status = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
                ))
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Task>(&format!(
                    "SELECT {SELECT_COLUMNS} FROM tasks \
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(tasks)
    }

    /// Tasks the scanner's output verification flagged and requeued.
    pub async fn get_scan_error_tasks(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = sqlx::query_as::<_, Task>(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks \
             WHERE status != ? AND COALESCE(log, '') LIKE ? \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(TaskStatus::Completed)
        .bind("%queued for re-encode%")
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    pub async fn delete(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Aggregate counts and saved bytes in a single query.
    pub async fn stats(&self) -> Result<Stats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = 'irrecoverable' THEN 1 ELSE 0 END), 0) AS irrecoverable,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN (source_size - output_size) ELSE 0 END), 0) AS total_saved
            FROM tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Stats {
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            irrecoverable: row.get("irrecoverable"),
            total_saved: row.get("total_saved"),
        })
    }
}
