use axum::http::StatusCode;
use axum::response::IntoResponse;
use quill_taskdb::TaskDbError;
use uuid::Uuid;

/// The standardized error returned by the quill HTTP surface.
#[derive(thiserror::Error, Debug)]
pub enum HostError {
    /// For uploads with an extension no converter handles.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// For uploads over the configured size ceiling.
    #[error("file too large, maximum size is {0} bytes")]
    FileTooLarge(u64),

    /// For ZIP uploads that cannot be unwrapped to a single document.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// For multipart requests without a usable file field.
    #[error("request contains no file")]
    MissingFile,

    #[error("task {0} not found")]
    NotFound(Uuid),

    /// For result requests against a task that has not completed.
    #[error("task {0} is not completed yet")]
    NotReady(Uuid),

    /// For completed tasks whose artifact was already cleaned up.
    #[error("result file for task {0} not found")]
    ResultMissing(Uuid),

    /// For I/O errors.
    #[error("there was an I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// For Serde errors.
    #[error("there was a deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// For task store errors.
    #[error("there was an error with the task store: {0}")]
    Store(#[from] TaskDbError),

    /// For errors from the conversion core.
    #[error("there was an error with the core: {0}")]
    Core(#[from] quill_core::Error),

    /// For broken multipart bodies.
    #[error("there was a multipart error: {0}")]
    Multipart(#[from] axum::extract::multipart::MultipartError),
}

impl HostError {
    fn status(&self) -> StatusCode {
        match self {
            HostError::UnsupportedFormat(_)
            | HostError::FileTooLarge(_)
            | HostError::InvalidArchive(_)
            | HostError::MissingFile
            | HostError::NotReady(_)
            | HostError::Multipart(_) => StatusCode::BAD_REQUEST,
            HostError::NotFound(_) | HostError::ResultMissing(_) => StatusCode::NOT_FOUND,
            HostError::Store(TaskDbError::Busy(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            HostError::UnsupportedFormat(_) => "unsupported_format",
            HostError::FileTooLarge(_) => "file_too_large",
            HostError::InvalidArchive(_) => "invalid_archive",
            HostError::MissingFile => "missing_file",
            HostError::NotFound(_) => "not_found",
            HostError::NotReady(_) => "not_ready",
            HostError::ResultMissing(_) => "result_missing",
            HostError::Io(_) => "io_error",
            HostError::Serde(_) => "serde_error",
            HostError::Store(_) => "store_error",
            HostError::Core(_) => "core_error",
            HostError::Multipart(_) => "multipart_error",
        }
    }
}

impl IntoResponse for HostError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = axum::Json(serde_json::json!({
            "status": "error",
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// A type alias for the standardized result type returned by the quill host.
pub type HostResult<T> = Result<T, HostError>;
