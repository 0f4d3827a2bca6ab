// Imports
// ----------------------------------------------------------------
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, ToSql};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{now_ts, QueueStats, Task, TaskDbError, TaskDbResult, TaskPatch, TaskStatus};

// Constants
// ----------------------------------------------------------------

/// Bump when a migration is added; applied migrations are tracked in the
/// database itself through `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 2;

/// Extra attempts after a "database is locked" failure, with 100 ms * 2^k
/// sleeps in between. The third failure surfaces as [`TaskDbError::Busy`].
const LOCKED_RETRIES: u32 = 2;

const TASK_COLUMNS: &str = "id, original_filename, status, created_at, updated_at, downloaded, \
     result_path, message, progress, s3_url, file_hash, worker_id, processing_started";

/// Serializes the one-time init + migration sequence across the process.
/// Steady-state operations rely on SQLite's own locking instead.
static INIT_LOCK: Mutex<()> = Mutex::new(());

// Implementation
// ----------------------------------------------------------------

/// Handle on the task database. Cheap to clone; every operation opens its
/// own connection and runs on the blocking thread pool, so a single handle
/// can be shared freely between workers, the reaper and the HTTP surface.
#[derive(Debug, Clone)]
pub struct TaskDb {
    path: PathBuf,
}

impl TaskDb {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> TaskDbResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 10_000)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", 10_000)?;
        Ok(conn)
    }

    /// Ensure the schema exists and is at [`SCHEMA_VERSION`]. Idempotent;
    /// calling it twice leaves both schema and version untouched.
    pub async fn init(&self) -> TaskDbResult<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.init_blocking()).await?
    }

    /// Insert a fresh task. The row is written exactly as the snapshot
    /// says, including its timestamps.
    pub async fn create(&self, task: &Task) -> TaskDbResult<()> {
        let db = self.clone();
        let task = task.clone();
        tokio::task::spawn_blocking(move || db.create_blocking(&task)).await?
    }

    pub async fn get(&self, id: Uuid) -> TaskDbResult<Option<Task>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.get_blocking(id)).await?
    }

    /// Most recent completed task with the given content hash, if any. The
    /// caller is responsible for checking that the recorded artifact still
    /// exists on disk.
    pub async fn get_by_hash(&self, file_hash: &str) -> TaskDbResult<Option<Task>> {
        let db = self.clone();
        let file_hash = file_hash.to_string();
        tokio::task::spawn_blocking(move || db.get_by_hash_blocking(&file_hash)).await?
    }

    /// Whitelisted partial update. Always bumps `updated_at`, even for an
    /// empty patch.
    pub async fn update(&self, id: Uuid, patch: TaskPatch) -> TaskDbResult<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.update_blocking(id, &patch)).await?
    }

    /// Atomically claim the oldest queued task for `worker_id`, marking it
    /// `processing` and stamping `processing_started`. Returns the updated
    /// row, or `None` when the queue is empty (including when a concurrent
    /// claimant won the head).
    pub async fn claim_next(&self, worker_id: &str) -> TaskDbResult<Option<Task>> {
        let db = self.clone();
        let worker_id = worker_id.to_string();
        tokio::task::spawn_blocking(move || db.claim_next_blocking(&worker_id)).await?
    }

    /// Return every `processing` task whose claim is older than
    /// `timeout_secs` back to the queue. A timeout of zero releases all
    /// currently processing tasks.
    pub async fn release_stale(&self, timeout_secs: u64) -> TaskDbResult<usize> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.release_stale_blocking(timeout_secs)).await?
    }

    /// Fail every task left `processing` by a previous process instance.
    /// Run once at startup, before any worker is spawned.
    pub async fn reset_startup(&self) -> TaskDbResult<usize> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.reset_startup_blocking()).await?
    }

    pub async fn delete(&self, id: Uuid) -> TaskDbResult<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.delete_blocking(id)).await?
    }

    /// Delete rows older than `days` and hand back `(id, result_path)` so
    /// the caller can unlink the artifacts.
    pub async fn cleanup_older_than(
        &self,
        days: u32,
    ) -> TaskDbResult<Vec<(Uuid, Option<String>)>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.cleanup_older_than_blocking(days)).await?
    }

    /// Tasks not yet downloaded by a consumer, newest first.
    pub async fn list_pending(&self) -> TaskDbResult<Vec<Task>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.list_pending_blocking()).await?
    }

    pub async fn stats(&self) -> TaskDbResult<QueueStats> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.stats_blocking()).await?
    }

    // Blocking bodies
    // ----------------------------------------------------------------

    fn init_blocking(&self) -> TaskDbResult<()> {
        let _guard = INIT_LOCK.lock().expect("init lock poisoned");
        let conn = self.connect()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                original_filename TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                downloaded INTEGER NOT NULL DEFAULT 0,
                result_path TEXT,
                message TEXT NOT NULL DEFAULT '',
                progress INTEGER NOT NULL DEFAULT 0,
                s3_url TEXT,
                file_hash TEXT,
                worker_id TEXT,
                processing_started REAL
            );

            CREATE INDEX IF NOT EXISTS idx_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_created_at ON tasks(created_at);
            CREATE INDEX IF NOT EXISTS idx_downloaded ON tasks(downloaded);
            CREATE INDEX IF NOT EXISTS idx_file_hash ON tasks(file_hash);
            CREATE INDEX IF NOT EXISTS idx_completed_recent
                ON tasks(updated_at) WHERE status = 'completed';
            "#,
        )?;

        self.migrate(&conn)?;

        info!(path = %self.path.display(), "task database initialized");
        Ok(())
    }

    fn migrate(&self, conn: &Connection) -> TaskDbResult<()> {
        let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        debug!(current, target = SCHEMA_VERSION, "checking schema version");

        if current < 2 {
            self.migrate_to_v2(conn)?;
        }

        if current < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            info!(from = current, to = SCHEMA_VERSION, "schema migrated");
        }
        Ok(())
    }

    /// v1 -> v2: queue support. Adds the claim bookkeeping columns, rewrites
    /// the legacy `pending` status, and creates the partial indexes backing
    /// `claim_next` and the reaper. Each step is guarded so re-running on a
    /// half-migrated database is safe.
    fn migrate_to_v2(&self, conn: &Connection) -> TaskDbResult<()> {
        if !has_column(conn, "tasks", "worker_id")? {
            conn.execute("ALTER TABLE tasks ADD COLUMN worker_id TEXT", [])?;
        }
        if !has_column(conn, "tasks", "processing_started")? {
            conn.execute("ALTER TABLE tasks ADD COLUMN processing_started REAL", [])?;
        }

        conn.execute(
            "UPDATE tasks SET status = 'queued' WHERE status = 'pending'",
            [],
        )?;

        conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue
                ON tasks(status, created_at) WHERE status = 'queued';
            CREATE INDEX IF NOT EXISTS idx_stale_tasks
                ON tasks(status, processing_started) WHERE status = 'processing';
            "#,
        )?;
        Ok(())
    }

    fn create_blocking(&self, task: &Task) -> TaskDbResult<()> {
        with_retry(|| {
            let conn = self.connect()?;
            let result = conn.execute(
                "INSERT INTO tasks (
                    id, original_filename, status, created_at, updated_at,
                    downloaded, result_path, message, progress, s3_url,
                    file_hash, worker_id, processing_started
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    task.id.to_string(),
                    task.original_filename,
                    task.status.as_str(),
                    task.created_at,
                    task.updated_at,
                    task.downloaded,
                    task.result_path,
                    task.message,
                    task.progress,
                    task.s3_url,
                    task.file_hash,
                    task.worker_id,
                    task.processing_started,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(TaskDbError::DuplicateId(task.id))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn get_blocking(&self, id: Uuid) -> TaskDbResult<Option<Task>> {
        let conn = self.connect()?;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    fn get_by_hash_blocking(&self, file_hash: &str) -> TaskDbResult<Option<Task>> {
        let conn = self.connect()?;
        let task = conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE file_hash = ?1 AND status = 'completed'
                     ORDER BY created_at DESC
                     LIMIT 1"
                ),
                params![file_hash],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    fn update_blocking(&self, id: Uuid, patch: &TaskPatch) -> TaskDbResult<()> {
        with_retry(|| {
            let mut sets: Vec<&'static str> = Vec::new();
            let mut values: Vec<Box<dyn ToSql>> = Vec::new();

            if let Some(status) = patch.status {
                sets.push("status = ?");
                values.push(Box::new(status.as_str()));
            }
            if let Some(message) = &patch.message {
                sets.push("message = ?");
                values.push(Box::new(message.clone()));
            }
            if let Some(progress) = patch.progress {
                sets.push("progress = ?");
                values.push(Box::new(progress));
            }
            if let Some(result_path) = &patch.result_path {
                sets.push("result_path = ?");
                values.push(Box::new(result_path.clone()));
            }
            if let Some(s3_url) = &patch.s3_url {
                sets.push("s3_url = ?");
                values.push(Box::new(s3_url.clone()));
            }
            if let Some(downloaded) = patch.downloaded {
                sets.push("downloaded = ?");
                values.push(Box::new(downloaded));
            }
            if let Some(worker_id) = &patch.worker_id {
                sets.push("worker_id = ?");
                values.push(Box::new(worker_id.clone()));
            }
            if let Some(processing_started) = &patch.processing_started {
                sets.push("processing_started = ?");
                values.push(Box::new(*processing_started));
            }
            if let Some(file_hash) = &patch.file_hash {
                sets.push("file_hash = ?");
                values.push(Box::new(file_hash.clone()));
            }

            // Every committed mutation is observable through updated_at.
            sets.push("updated_at = ?");
            values.push(Box::new(now_ts()));
            values.push(Box::new(id.to_string()));

            let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
            let conn = self.connect()?;
            let changed = conn.execute(&sql, params_from_iter(values.iter().map(|v| v.as_ref())))?;
            if changed == 0 {
                debug!(%id, "update matched no task");
            }
            Ok(())
        })
    }

    fn claim_next_blocking(&self, worker_id: &str) -> TaskDbResult<Option<Task>> {
        with_retry(|| {
            let conn = self.connect()?;
            let now = now_ts();
            // Single-statement claim: the subselect and the update commit
            // together, so at most one claimant observes the row. Ties on
            // created_at fall back to insertion order via rowid.
            let task = conn
                .query_row(
                    &format!(
                        "UPDATE tasks
                         SET status = 'processing',
                             worker_id = ?1,
                             processing_started = ?2,
                             updated_at = ?2
                         WHERE id = (
                             SELECT id FROM tasks
                             WHERE status = 'queued'
                             ORDER BY created_at ASC, rowid ASC
                             LIMIT 1
                         )
                         RETURNING {TASK_COLUMNS}"
                    ),
                    params![worker_id, now],
                    task_from_row,
                )
                .optional()?;
            Ok(task)
        })
    }

    fn release_stale_blocking(&self, timeout_secs: u64) -> TaskDbResult<usize> {
        with_retry(|| {
            let conn = self.connect()?;
            let now = now_ts();
            let cutoff = now - timeout_secs as f64;
            let released = conn.execute(
                "UPDATE tasks
                 SET status = 'queued',
                     worker_id = NULL,
                     processing_started = NULL,
                     message = 'Returned to queue after timeout',
                     updated_at = ?1
                 WHERE status = 'processing' AND processing_started < ?2",
                params![now, cutoff],
            )?;
            if released > 0 {
                warn!(released, "released stale tasks back to queue");
            }
            Ok(released)
        })
    }

    fn reset_startup_blocking(&self) -> TaskDbResult<usize> {
        with_retry(|| {
            let conn = self.connect()?;
            let failed = conn.execute(
                "UPDATE tasks
                 SET status = 'failed',
                     message = 'Server was restarted while processing',
                     worker_id = NULL,
                     processing_started = NULL,
                     updated_at = ?1
                 WHERE status = 'processing'",
                params![now_ts()],
            )?;
            if failed > 0 {
                info!(failed, "failed tasks orphaned by a previous instance");
            }
            Ok(failed)
        })
    }

    fn delete_blocking(&self, id: Uuid) -> TaskDbResult<()> {
        with_retry(|| {
            let conn = self.connect()?;
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])?;
            Ok(())
        })
    }

    fn cleanup_older_than_blocking(&self, days: u32) -> TaskDbResult<Vec<(Uuid, Option<String>)>> {
        with_retry(|| {
            let cutoff = now_ts() - days as f64 * 86_400.0;
            let mut conn = self.connect()?;
            let tx = conn.transaction()?;

            let old: Vec<(Uuid, Option<String>)> = {
                let mut stmt =
                    tx.prepare("SELECT id, result_path FROM tasks WHERE created_at < ?1")?;
                let rows = stmt.query_map(params![cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                })?;
                rows.filter_map(|r| match r {
                    Ok((id, path)) => match Uuid::parse_str(&id) {
                        Ok(id) => Some(Ok((id, path))),
                        Err(_) => {
                            warn!(%id, "skipping row with malformed id during cleanup");
                            None
                        }
                    },
                    Err(e) => Some(Err(e)),
                })
                .collect::<Result<_, _>>()?
            };

            tx.execute("DELETE FROM tasks WHERE created_at < ?1", params![cutoff])?;
            tx.commit()?;
            Ok(old)
        })
    }

    fn list_pending_blocking(&self) -> TaskDbResult<Vec<Task>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status != 'failed' AND downloaded = 0
             ORDER BY created_at DESC"
        ))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn stats_blocking(&self) -> TaskDbResult<QueueStats> {
        let conn = self.connect()?;
        let hour_ago = now_ts() - 3_600.0;
        let stats = conn.query_row(
            "SELECT
                SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                COUNT(*),
                COUNT(DISTINCT CASE WHEN status = 'processing' AND worker_id IS NOT NULL
                      THEN worker_id END),
                SUM(CASE WHEN status = 'completed' AND updated_at > ?1 THEN 1 ELSE 0 END),
                AVG(CASE WHEN status = 'completed' AND processing_started IS NOT NULL
                    AND updated_at > ?1
                    THEN updated_at - processing_started END)
             FROM tasks",
            params![hour_ago],
            |row| {
                Ok(QueueStats {
                    queued: row.get::<_, Option<u64>>(0)?.unwrap_or(0),
                    processing: row.get::<_, Option<u64>>(1)?.unwrap_or(0),
                    completed: row.get::<_, Option<u64>>(2)?.unwrap_or(0),
                    failed: row.get::<_, Option<u64>>(3)?.unwrap_or(0),
                    total: row.get(4)?,
                    active_workers: row.get(5)?,
                    completed_last_hour: row.get::<_, Option<u64>>(6)?.unwrap_or(0),
                    avg_processing_secs: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
                })
            },
        )?;
        Ok(stats)
    }
}

// Helpers
// ----------------------------------------------------------------

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let status: String = row.get(2)?;
    let status = TaskStatus::from_str(&status).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
    })?;

    Ok(Task {
        id,
        original_filename: row.get(1)?,
        status,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        downloaded: row.get(5)?,
        result_path: row.get(6)?,
        message: row.get(7)?,
        progress: row.get(8)?,
        s3_url: row.get(9)?,
        file_hash: row.get(10)?,
        worker_id: row.get(11)?,
        processing_started: row.get(12)?,
    })
}

fn has_column(conn: &Connection, table: &str, column: &str) -> TaskDbResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    Ok(rows.any(|name| matches!(name, Ok(ref n) if n == column)))
}

fn is_locked(err: &TaskDbError) -> bool {
    match err {
        TaskDbError::Sql(rusqlite::Error::SqliteFailure(e, msg)) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
                || msg.as_deref().is_some_and(|m| m.contains("locked"))
        }
        _ => false,
    }
}

/// Transparent retry for transient lock contention: 100 ms * 2^k between
/// attempts, surfacing [`TaskDbError::Busy`] once the budget is spent.
fn with_retry<T>(mut op: impl FnMut() -> TaskDbResult<T>) -> TaskDbResult<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if is_locked(&e) => {
                if attempt < LOCKED_RETRIES {
                    let backoff = Duration::from_millis(100 << attempt);
                    debug!(attempt, ?backoff, "task store locked, retrying");
                    std::thread::sleep(backoff);
                    attempt += 1;
                } else {
                    return Err(TaskDbError::Busy(e.to_string()));
                }
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    // Only private helpers are tested here; the public API is exercised
    // from the tests directory.

    use super::*;
    use tempfile::tempdir;

    fn open_initialized(path: &Path) -> TaskDb {
        let db = TaskDb::new(path);
        db.init_blocking().unwrap();
        db
    }

    #[test]
    fn has_column_sees_migrated_columns() {
        let dir = tempdir().unwrap();
        let db = open_initialized(&dir.path().join("tasks.db"));
        let conn = db.connect().unwrap();
        assert!(has_column(&conn, "tasks", "worker_id").unwrap());
        assert!(has_column(&conn, "tasks", "processing_started").unwrap());
        assert!(!has_column(&conn, "tasks", "no_such_column").unwrap());
    }

    #[test]
    fn legacy_pending_rows_become_queued() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let db = open_initialized(&path);

        // Smuggle in a pre-v2 status value, then re-run the migration.
        let conn = db.connect().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, original_filename, status, created_at, updated_at)
             VALUES ('00000000-0000-0000-0000-000000000001', 'a.pdf', 'pending', 1.0, 1.0)",
            [],
        )
        .unwrap();
        db.migrate_to_v2(&conn).unwrap();

        let status: String = conn
            .query_row(
                "SELECT status FROM tasks WHERE id = '00000000-0000-0000-0000-000000000001'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "queued");
    }

    #[test]
    fn retry_gives_up_after_budget() {
        let mut calls = 0;
        let result: TaskDbResult<()> = with_retry(|| {
            calls += 1;
            Err(TaskDbError::Sql(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("database is locked".into()),
            )))
        });
        assert!(matches!(result, Err(TaskDbError::Busy(_))));
        assert_eq!(calls, 3);
    }
}
