use quill_taskdb::TaskDbError;
use uuid::Uuid;

/// The closed set of failure kinds the service reasons about. Workers fold
/// every underlying error into one of these before persisting terminal
/// state, so the taxonomy is also what ends up in task messages.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The store stayed locked through the retry budget.
    #[error("task store is busy: {0}")]
    StoreBusy(String),

    /// A store-level conflict or corruption (duplicate id, SQL failure).
    #[error("task store conflict: {0}")]
    StoreConflict(String),

    /// No converter is registered for the extension.
    #[error("unsupported format: .{0}")]
    UnsupportedFormat(String),

    /// The conversion engine exited non-zero or produced no output.
    #[error("conversion failed: {0}")]
    ConverterFailed(String),

    /// The conversion engine exceeded its wall-clock budget and was killed.
    #[error("conversion timed out after {0}s")]
    ConverterTimeout(u64),

    /// Building the result archive failed.
    #[error("packaging failed: {0}")]
    PackagingFailed(String),

    /// Uploading the artifact failed. Non-fatal for the task.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("task not found: {0}")]
    NotFound(Uuid),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<TaskDbError> for Error {
    fn from(err: TaskDbError) -> Self {
        match err {
            TaskDbError::Busy(msg) => Error::StoreBusy(msg),
            TaskDbError::DuplicateId(id) => Error::StoreConflict(format!("duplicate task id {id}")),
            TaskDbError::Io(e) => Error::Io(e),
            other => Error::StoreConflict(other.to_string()),
        }
    }
}
