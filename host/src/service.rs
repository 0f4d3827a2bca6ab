//! The operations behind the HTTP routes: staged uploads with streaming
//! hashing and size enforcement, single-document ZIP unwrapping, the
//! enqueue-time cache consult, result lookup, and file cleanup.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use quill_core::files::{file_extension, is_format_supported, sanitize_filename};
use quill_core::QueueOpts;
use quill_taskdb::{QueueStats, Task, TaskDb, TaskPatch, TaskStatus};

use crate::error::{HostError, HostResult};

/// Thin coordination layer over the task store and the filesystem layout.
/// Cloneable; every route handler shares one instance.
#[derive(Clone)]
pub struct ConversionService {
    db: TaskDb,
    opts: QueueOpts,
    upload_dir: PathBuf,
    results_dir: PathBuf,
}

/// What `enqueue_task` produced: either a brand-new queued task or, for
/// duplicate content, the already-completed task it matched.
#[derive(Debug)]
pub struct EnqueueOutcome {
    pub task: Task,
    pub cached: bool,
}

/// Where a finished result can be fetched from.
#[derive(Debug, Clone)]
pub struct ResultRef {
    pub local_path: Option<PathBuf>,
    pub url: Option<String>,
}

/// An upload being streamed to the staging area. Bytes are hashed and
/// size-checked as they arrive, so oversized uploads are cut off without
/// ever being buffered in memory.
pub struct UploadSink {
    file: tokio::fs::File,
    hasher: Sha256,
    size: u64,
    max: u64,
    path: PathBuf,
}

/// A fully received upload sitting in the staging area.
pub struct StagedUpload {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

impl UploadSink {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> HostResult<()> {
        self.size += chunk.len() as u64;
        if self.size > self.max {
            return Err(HostError::FileTooLarge(self.max));
        }
        self.hasher.update(chunk);
        self.file.write_all(chunk).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> HostResult<StagedUpload> {
        self.file.flush().await?;
        Ok(StagedUpload {
            path: self.path,
            size: self.size,
            sha256: hex::encode(self.hasher.finalize()),
        })
    }

    /// Best-effort removal of the staging file after an aborted upload.
    pub async fn discard(self) {
        drop(self.file);
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

impl StagedUpload {
    pub async fn discard(self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

impl ConversionService {
    pub fn new(
        db: TaskDb,
        opts: QueueOpts,
        upload_dir: impl Into<PathBuf>,
        results_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            opts,
            upload_dir: upload_dir.into(),
            results_dir: results_dir.into(),
        }
    }

    pub fn db(&self) -> &TaskDb {
        &self.db
    }

    pub fn max_file_size(&self) -> u64 {
        self.opts.max_file_size
    }

    /// Open a staging file for an incoming upload.
    pub async fn begin_upload(&self) -> HostResult<UploadSink> {
        let staging = self.upload_dir.join(".staging");
        tokio::fs::create_dir_all(&staging).await?;
        let path = staging.join(Uuid::new_v4().to_string());
        let file = tokio::fs::File::create(&path).await?;
        Ok(UploadSink {
            file,
            hasher: Sha256::new(),
            size: 0,
            max: self.opts.max_file_size,
            path,
        })
    }

    /// Turn a staged upload into a queued task.
    ///
    /// ZIP uploads are transparently unwrapped when they hold exactly one
    /// supported document at the archive root. Content already converted
    /// (same SHA-256, artifact still on disk) short-circuits to the
    /// existing completed task without inserting a row.
    pub async fn enqueue_task(
        &self,
        original_filename: &str,
        staged: StagedUpload,
    ) -> HostResult<EnqueueOutcome> {
        if !is_format_supported(original_filename) {
            let ext = file_extension(original_filename);
            staged.discard().await;
            return Err(HostError::UnsupportedFormat(ext));
        }

        let (staged, filename) = if file_extension(original_filename) == "zip" {
            self.unwrap_archive(staged).await?
        } else {
            (staged, original_filename.to_string())
        };

        if let Some(cached) = self.db.get_by_hash(&staged.sha256).await? {
            if let Some(result_path) = &cached.result_path {
                if Path::new(result_path).is_file() {
                    info!(task = %cached.id, hash = %staged.sha256, "enqueue matched cached result");
                    staged.discard().await;
                    return Ok(EnqueueOutcome {
                        task: cached,
                        cached: true,
                    });
                }
            }
        }

        let id = Uuid::new_v4();
        let task_dir = self.upload_dir.join(id.to_string());
        tokio::fs::create_dir_all(&task_dir).await?;
        let dest = task_dir.join(sanitize_filename(&filename));
        tokio::fs::rename(&staged.path, &dest).await?;

        let task = Task::new(id, &filename, Some(staged.sha256));
        self.db.create(&task).await?;
        info!(task = %id, file = %filename, size = staged.size, "task enqueued");
        Ok(EnqueueOutcome {
            task,
            cached: false,
        })
    }

    /// Replace a staged ZIP with the single supported document at its
    /// root. Zero or several candidates reject the upload.
    async fn unwrap_archive(&self, staged: StagedUpload) -> HostResult<(StagedUpload, String)> {
        let zip_path = staged.path.clone();
        let out_path = zip_path.with_extension("unwrapped");
        let out_path_ = out_path.clone();

        let extracted: HostResult<(String, u64, String)> =
            tokio::task::spawn_blocking(move || {
                let file = std::fs::File::open(&zip_path)?;
                let mut archive = zip::ZipArchive::new(file)
                    .map_err(|e| HostError::InvalidArchive(e.to_string()))?;

                let mut document: Option<String> = None;
                let mut unsupported: Vec<String> = Vec::new();
                for i in 0..archive.len() {
                    let entry = archive
                        .by_index(i)
                        .map_err(|e| HostError::InvalidArchive(e.to_string()))?;
                    let name = entry.name().to_string();
                    // Only files at the archive root are considered.
                    if entry.is_dir() || name.contains('/') {
                        continue;
                    }
                    let ext = file_extension(&name);
                    if ext != "zip" && is_format_supported(&name) {
                        if let Some(first) = &document {
                            return Err(HostError::InvalidArchive(format!(
                                "archive holds several documents: {first} and {name}"
                            )));
                        }
                        document = Some(name);
                    } else {
                        unsupported.push(name);
                    }
                }

                let Some(document) = document else {
                    return Err(match unsupported.first() {
                        Some(name) => HostError::InvalidArchive(format!(
                            "archive holds no supported document, found: {name}"
                        )),
                        None => HostError::InvalidArchive(
                            "archive is empty or holds only directories".to_string(),
                        ),
                    });
                };

                // Extract while hashing, same as a direct upload.
                let mut entry = archive
                    .by_name(&document)
                    .map_err(|e| HostError::InvalidArchive(e.to_string()))?;
                let mut out = std::fs::File::create(&out_path_)?;
                let mut hasher = Sha256::new();
                let mut size = 0u64;
                let mut buf = [0u8; 8192];
                loop {
                    let n = entry.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    std::io::Write::write_all(&mut out, &buf[..n])?;
                    size += n as u64;
                }
                Ok((document, size, hex::encode(hasher.finalize())))
            })
            .await
            .map_err(|e| HostError::Io(std::io::Error::other(e)))?;

        let result = match extracted {
            Ok((document, size, sha256)) => {
                info!(document = %document, "unwrapped single-document archive");
                Ok((
                    StagedUpload {
                        path: out_path,
                        size,
                        sha256,
                    },
                    document,
                ))
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&out_path).await;
                Err(e)
            }
        };
        staged.discard().await;
        result
    }

    pub async fn get_task(&self, id: Uuid) -> HostResult<Task> {
        self.db.get(id).await?.ok_or(HostError::NotFound(id))
    }

    pub async fn get_result(&self, id: Uuid) -> HostResult<ResultRef> {
        let task = self.get_task(id).await?;
        if task.status != TaskStatus::Completed {
            return Err(HostError::NotReady(id));
        }
        let local_path = task
            .result_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.is_file());
        if local_path.is_none() && task.s3_url.is_none() {
            return Err(HostError::ResultMissing(id));
        }
        Ok(ResultRef {
            local_path,
            url: task.s3_url,
        })
    }

    /// Resolve the artifact for a download response.
    pub async fn prepare_download(&self, id: Uuid) -> HostResult<(PathBuf, String)> {
        let result = self.get_result(id).await?;
        let path = result.local_path.ok_or(HostError::ResultMissing(id))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "result.zip".to_string());
        Ok((path, filename))
    }

    /// Post-download cleanup: mark the task downloaded, drop its files and
    /// finally its row. Runs in the background after the response is sent.
    pub async fn finish_download(&self, id: Uuid) {
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        if let Err(e) = self
            .db
            .update(
                id,
                TaskPatch {
                    downloaded: Some(true),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(task = %id, error = %e, "could not mark task downloaded");
        }
        self.remove_task_files(id).await;
        if let Err(e) = self.db.delete(id).await {
            warn!(task = %id, error = %e, "could not delete downloaded task");
        }
        info!(task = %id, "cleaned up downloaded task");
    }

    pub async fn list_pending(&self) -> HostResult<Vec<Task>> {
        Ok(self.db.list_pending().await?)
    }

    pub async fn stats(&self) -> HostResult<QueueStats> {
        Ok(self.db.stats().await?)
    }

    /// Retention sweep: drop rows older than the configured cutoff along
    /// with their files. Returns how many tasks were removed.
    pub async fn cleanup_old_tasks(&self) -> HostResult<usize> {
        let old = self.db.cleanup_older_than(self.opts.cleanup_days).await?;
        let count = old.len();
        for (id, _result_path) in old {
            self.remove_task_files(id).await;
        }
        if count > 0 {
            info!(count, "removed tasks past the retention cutoff");
        }
        Ok(count)
    }

    async fn remove_task_files(&self, id: Uuid) {
        for dir in [
            self.upload_dir.join(id.to_string()),
            self.results_dir.join(id.to_string()),
        ] {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(task = %id, dir = %dir.display(), error = %e, "could not remove task files");
                }
            }
        }
    }
}
