//! The axum route surface: a thin adapter translating HTTP requests into
//! [`ConversionService`] calls.

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use quill_core::files::SUPPORTED_FORMATS;
use quill_taskdb::{QueueStats, Task, TaskStatus};

use crate::error::{HostError, HostResult};
use crate::service::ConversionService;

#[derive(Clone)]
pub struct AppState {
    pub service: ConversionService,
}

pub fn router(state: AppState) -> Router {
    // Leave the multipart framing some headroom over the document itself.
    let body_limit = state.service.max_file_size() as usize + (1 << 20);
    Router::new()
        .route("/api/v1/convert", post(convert))
        .route("/api/v1/task/:task_id", get(task_status))
        .route("/api/v1/download/:task_id", get(download))
        .route("/api/v1/tasks/pending", get(pending_tasks))
        .route("/api/v1/stats", get(queue_stats))
        .route("/api/v1/formats", get(supported_formats))
        .route("/api/v1/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

// Responses
// ----------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ConversionResponse {
    task_id: Uuid,
    status: TaskStatus,
    message: String,
}

#[derive(Debug, Serialize)]
struct TaskStatusResponse {
    task_id: Uuid,
    status: TaskStatus,
    progress: u8,
    message: String,
    created_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    s3_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct PendingTask {
    task_id: Uuid,
    original_filename: String,
    status: TaskStatus,
    created_at: f64,
    progress: u8,
    downloaded: bool,
}

#[derive(Debug, Serialize)]
struct PendingTasksResponse {
    tasks: Vec<PendingTask>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct SupportedFormatsResponse {
    formats: &'static [&'static str],
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database: bool,
    queue: Option<QueueStats>,
}

// Handlers
// ----------------------------------------------------------------

/// Accept a document (multipart field `file`) and enqueue its conversion.
async fn convert(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> HostResult<Json<ConversionResponse>> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };

        let mut sink = state.service.begin_upload().await?;
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = sink.write_chunk(&chunk).await {
                        sink.discard().await;
                        return Err(e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    sink.discard().await;
                    return Err(e.into());
                }
            }
        }
        let staged = sink.finish().await?;

        let outcome = state.service.enqueue_task(&filename, staged).await?;
        let message = if outcome.cached {
            "Returning cached result".to_string()
        } else {
            outcome.task.message.clone()
        };
        return Ok(Json(ConversionResponse {
            task_id: outcome.task.id,
            status: outcome.task.status,
            message,
        }));
    }
    Err(HostError::MissingFile)
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> HostResult<Json<TaskStatusResponse>> {
    let task = state.service.get_task(task_id).await?;
    let result_url = (task.status == TaskStatus::Completed)
        .then(|| format!("/api/v1/download/{task_id}"));
    Ok(Json(TaskStatusResponse {
        task_id,
        status: task.status,
        progress: task.progress,
        message: task.message,
        created_at: task.created_at,
        result_url,
        s3_url: task.s3_url,
    }))
}

/// Stream the result archive and schedule the task's cleanup.
async fn download(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> HostResult<Response> {
    let (path, filename) = state.service.prepare_download(task_id).await?;
    let file = tokio::fs::File::open(&path).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let service = state.service.clone();
    tokio::spawn(async move { service.finish_download(task_id).await });

    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, body).into_response())
}

async fn pending_tasks(
    State(state): State<AppState>,
) -> HostResult<Json<PendingTasksResponse>> {
    let tasks: Vec<PendingTask> = state
        .service
        .list_pending()
        .await?
        .into_iter()
        .map(|task: Task| PendingTask {
            task_id: task.id,
            original_filename: task.original_filename,
            status: task.status,
            created_at: task.created_at,
            progress: task.progress,
            downloaded: task.downloaded,
        })
        .collect();
    let total = tasks.len();
    Ok(Json(PendingTasksResponse { tasks, total }))
}

async fn queue_stats(State(state): State<AppState>) -> HostResult<Json<QueueStats>> {
    Ok(Json(state.service.stats().await?))
}

async fn supported_formats() -> Json<SupportedFormatsResponse> {
    Json(SupportedFormatsResponse {
        formats: SUPPORTED_FORMATS,
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue = state.service.stats().await.ok();
    Json(HealthResponse {
        status: if queue.is_some() { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database: queue.is_some(),
        queue,
    })
}
