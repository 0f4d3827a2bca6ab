//! # Quill Task Store
//!
//! Document conversion is slow: a single office file can hold an external
//! converter for minutes, and the process may be restarted at any point in
//! between. Quill therefore keeps every conversion request as a durable row
//! in a single-file SQLite database, and the whole queue protocol — claim,
//! progress, completion, crash recovery — is expressed as transactions over
//! that one `tasks` table.
//!
//! The table doubles as the coordination point between competing workers:
//!
//! - a worker *claims* the oldest `queued` row with a single
//!   `UPDATE ... RETURNING` statement, so two workers can never own the same
//!   task;
//! - the reaper returns rows whose `processing_started` is too old back to
//!   `queued`;
//! - at boot, rows still marked `processing` belong to a dead process and
//!   are failed with a diagnostic message;
//! - `file_hash` lookups let producers and workers reuse the artifact of an
//!   earlier identical upload instead of converting again.
//!
//! Every operation opens its own connection (WAL journal, 10 s busy
//! timeout, `synchronous=NORMAL`) and runs on the blocking thread pool;
//! cross-process and cross-task consistency is entirely SQLite's problem,
//! which it is rather good at.

mod sqlite;

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use sqlite::TaskDb;

// Types
// ----------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum TaskDbError {
    /// The database stayed locked through all retry attempts.
    #[error("task store is busy: {0}")]
    Busy(String),

    /// Insert with an id that already exists.
    #[error("duplicate task id: {0}")]
    DuplicateId(Uuid),

    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type TaskDbResult<T> = Result<T, TaskDbError>;

/// Lifecycle state of a task. Stored as lower-case text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One conversion request. A `Task` is a snapshot of a row; mutating it in
/// memory never changes durable state — only [`TaskDb`] operations do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub original_filename: String,
    pub status: TaskStatus,
    /// Unix seconds, fractional.
    pub created_at: f64,
    pub updated_at: f64,
    pub downloaded: bool,
    pub result_path: Option<String>,
    pub message: String,
    pub progress: u8,
    pub s3_url: Option<String>,
    /// Hex-encoded SHA-256 of the source bytes.
    pub file_hash: Option<String>,
    /// Set while `status == Processing`.
    pub worker_id: Option<String>,
    pub processing_started: Option<f64>,
}

impl Task {
    /// A fresh `queued` task, timestamped now.
    pub fn new(id: Uuid, original_filename: impl Into<String>, file_hash: Option<String>) -> Self {
        let now = now_ts();
        Self {
            id,
            original_filename: original_filename.into(),
            status: TaskStatus::Queued,
            created_at: now,
            updated_at: now,
            downloaded: false,
            result_path: None,
            message: "Task queued for processing".to_string(),
            progress: 0,
            s3_url: None,
            file_hash,
            worker_id: None,
            processing_started: None,
        }
    }
}

/// Partial update applied by [`TaskDb::update`]. Only the columns named here
/// are writable through the update path; values are always bound parameters.
///
/// The double `Option` on nullable columns distinguishes "leave alone"
/// (`None`) from "set to NULL" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub message: Option<String>,
    pub progress: Option<u8>,
    pub result_path: Option<Option<String>>,
    pub s3_url: Option<Option<String>>,
    pub downloaded: Option<bool>,
    pub worker_id: Option<Option<String>>,
    pub processing_started: Option<Option<f64>>,
    pub file_hash: Option<String>,
}

impl TaskPatch {
    /// Terminal success: completed, full progress, artifact recorded, the
    /// worker ownership released. `processing_started` is retained so the
    /// stats query can report processing durations.
    pub fn completed(
        result_path: impl Into<String>,
        s3_url: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            progress: Some(100),
            result_path: Some(Some(result_path.into())),
            s3_url: Some(s3_url),
            message: Some(message.into()),
            worker_id: Some(None),
            ..Default::default()
        }
    }

    /// Terminal failure: worker fields cleared so the row satisfies the
    /// non-processing column invariant.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            progress: Some(0),
            message: Some(message.into()),
            worker_id: Some(None),
            processing_started: Some(None),
            ..Default::default()
        }
    }

    /// Give the claim back: queued, no owner.
    pub fn released() -> Self {
        Self {
            status: Some(TaskStatus::Queued),
            worker_id: Some(None),
            processing_started: Some(None),
            ..Default::default()
        }
    }

    /// Progress milestone with a human-readable message.
    pub fn progress(progress: u8, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Aggregate queue health, produced by a single SQL query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    /// Distinct `worker_id`s currently holding a claim.
    pub active_workers: u64,
    pub completed_last_hour: u64,
    /// Mean seconds from claim to completion over the last hour.
    pub avg_processing_secs: f64,
}

/// Current wall-clock time as fractional unix seconds, microsecond
/// resolution. All row timestamps use this representation.
pub fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("pending".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn new_task_is_queued_and_unowned() {
        let task = Task::new(Uuid::new_v4(), "report.docx", None);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0);
        assert!(task.worker_id.is_none());
        assert!(task.processing_started.is_none());
        assert!(task.created_at > 0.0);
        assert_eq!(task.created_at, task.updated_at);
    }
}
