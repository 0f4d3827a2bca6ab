use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quill_core::files::{file_extension, sanitize_filename, sha256_file};
use quill_core::package::create_result_zip;
use quill_core::{Converters, Error, QueueOpts, ResultPublisher};
use quill_taskdb::{Task, TaskDb, TaskPatch};

/// What happened to a claimed task. `Done` means a terminal state was
/// persisted; `Released` means the claim went back to the queue because the
/// worker is shutting down.
enum Outcome {
    Done,
    Released,
}

/// A single queue drainer. Claims at most one task at a time and persists a
/// terminal state (or releases the claim) before going back to idle — a
/// `processing` row must never outlive its worker.
pub struct Worker {
    id: String,
    db: TaskDb,
    converters: Converters,
    publisher: Option<Arc<dyn ResultPublisher>>,
    opts: QueueOpts,
    upload_dir: PathBuf,
    results_dir: PathBuf,
    cancel: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        db: TaskDb,
        converters: Converters,
        publisher: Option<Arc<dyn ResultPublisher>>,
        opts: QueueOpts,
        upload_dir: impl Into<PathBuf>,
        results_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            db,
            converters,
            publisher,
            opts,
            upload_dir: upload_dir.into(),
            results_dir: results_dir.into(),
            cancel,
        }
    }

    /// Claim-process-idle loop. Returns once the cancellation token fires
    /// and the current task (if any) has reached a terminal state or been
    /// released.
    pub async fn run(self) {
        info!(worker = %self.id, "worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.db.claim_next(&self.id).await {
                Ok(Some(task)) => {
                    if self.cancel.is_cancelled() {
                        // Claimed just as shutdown began; hand it back.
                        self.release(task.id).await;
                        break;
                    }
                    self.run_claimed(task).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.opts.poll_interval()) => {}
                    }
                }
                Err(e) => {
                    error!(worker = %self.id, error = %e, "claim failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.opts.poll_interval()) => {}
                    }
                }
            }
        }
        info!(worker = %self.id, "worker stopped");
    }

    /// Run one claimed task to its end. Every error path persists `failed`
    /// before returning; packaging leftovers from the failed attempt are
    /// removed best-effort.
    async fn run_claimed(&self, task: Task) {
        let task_id = task.id;
        info!(worker = %self.id, task = %task_id, file = %task.original_filename, "processing task");

        let artifact = self.artifact_path(&task);
        match self.process(&task, &artifact).await {
            Ok(Outcome::Done) => {
                info!(worker = %self.id, task = %task_id, "task finished");
            }
            Ok(Outcome::Released) => {
                info!(worker = %self.id, task = %task_id, "claim released on shutdown");
            }
            Err(err) => {
                warn!(worker = %self.id, task = %task_id, error = %err, "task failed");
                if let Err(e) = self
                    .db
                    .update(task_id, TaskPatch::failed(format!("Error: {err}")))
                    .await
                {
                    error!(worker = %self.id, task = %task_id, error = %e,
                        "could not persist failure; the reaper will reclaim the task");
                }
                if artifact.exists() {
                    if let Err(e) = tokio::fs::remove_file(&artifact).await {
                        warn!(task = %task_id, error = %e, "could not remove partial artifact");
                    }
                }
            }
        }
    }

    async fn process(&self, task: &Task, artifact: &Path) -> Result<Outcome, Error> {
        // The same bytes may already have been converted for an earlier
        // task that completed after this one was enqueued.
        if let Some(hash) = &task.file_hash {
            if self.try_cached(task, hash).await? {
                return Ok(Outcome::Done);
            }
        }

        let input = self
            .upload_dir
            .join(task.id.to_string())
            .join(sanitize_filename(&task.original_filename));
        if !input.is_file() {
            return Err(Error::ConverterFailed(format!(
                "input file not found: {}",
                input.display()
            )));
        }

        // Older enqueue paths did not record the hash; derive and persist
        // it so future duplicates can hit the cache.
        if task.file_hash.is_none() {
            let hash = sha256_file(&input).await?;
            self.db
                .update(
                    task.id,
                    TaskPatch {
                        file_hash: Some(hash),
                        ..Default::default()
                    },
                )
                .await?;
        }

        if self.cancel.is_cancelled() {
            self.release(task.id).await;
            return Ok(Outcome::Released);
        }

        let extension = file_extension(&task.original_filename);
        let converter = self.converters.for_extension(&extension)?;

        let result_dir = self.results_dir.join(task.id.to_string());
        tokio::fs::create_dir_all(&result_dir).await?;

        self.db
            .update(task.id, TaskPatch::progress(30, "Conversion started"))
            .await?;
        let conversion = converter.convert(&input, &result_dir).await?;

        self.db
            .update(task.id, TaskPatch::progress(70, "Packaging result"))
            .await?;
        let zip_path = create_result_zip(
            conversion.markdown.clone(),
            conversion.images_dir.clone(),
            artifact.to_path_buf(),
        )
        .await?;

        let mut message = "Conversion completed successfully".to_string();
        let mut s3_url = None;
        if let Some(publisher) = &self.publisher {
            match publisher
                .publish(&zip_path, &task.original_filename, task.id)
                .await
            {
                Ok(url) => s3_url = url,
                Err(e) => {
                    // The local artifact stays authoritative.
                    warn!(task = %task.id, error = %e, "publish failed, keeping local result");
                    message = format!("Conversion completed; upload failed: {e}");
                }
            }
        }

        self.db
            .update(
                task.id,
                TaskPatch::completed(zip_path.to_string_lossy().into_owned(), s3_url, message),
            )
            .await?;
        Ok(Outcome::Done)
    }

    /// In-worker cache recheck. A hit must still exist on disk; a stale row
    /// falls through to a real conversion.
    async fn try_cached(&self, task: &Task, hash: &str) -> Result<bool, Error> {
        let Some(cached) = self.db.get_by_hash(hash).await? else {
            return Ok(false);
        };
        if cached.id == task.id {
            return Ok(false);
        }
        let Some(result_path) = cached.result_path else {
            return Ok(false);
        };
        if !Path::new(&result_path).is_file() {
            debug!(task = %task.id, "cached artifact no longer on disk, converting");
            return Ok(false);
        }

        info!(task = %task.id, cached = %cached.id, "using cached result");
        self.db
            .update(
                task.id,
                TaskPatch::completed(result_path, cached.s3_url, "Used cached result"),
            )
            .await?;
        Ok(true)
    }

    async fn release(&self, task_id: uuid::Uuid) {
        if let Err(e) = self.db.update(task_id, TaskPatch::released()).await {
            error!(worker = %self.id, task = %task_id, error = %e,
                "could not release claim; the reaper will reclaim the task");
        }
    }

    /// `<results_dir>/<task_id>/<stem>_<ext>_result.zip`
    fn artifact_path(&self, task: &Task) -> PathBuf {
        let sanitized = sanitize_filename(&task.original_filename);
        let name = Path::new(&sanitized);
        let stem = name
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let extension = file_extension(&sanitized);
        let zip_name = if extension.is_empty() {
            format!("{stem}_result.zip")
        } else {
            format!("{stem}_{extension}_result.zip")
        };
        self.results_dir.join(task.id.to_string()).join(zip_name)
    }
}
