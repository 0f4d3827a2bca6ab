use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use quill_core::{Converters, QueueOpts, ResultPublisher, Result};
use quill_taskdb::TaskDb;

use crate::worker::Worker;

/// Supervises the workers and the reaper.
///
/// Startup order matters: orphans from a previous process are failed before
/// any worker can claim them, then `num_workers` workers are spawned with
/// stable identities, then exactly one reaper. The reaper is a pool-level
/// singleton — running one per worker would release each other's healthy
/// claims.
pub struct WorkerPool {
    db: TaskDb,
    converters: Converters,
    publisher: Option<Arc<dyn ResultPublisher>>,
    opts: QueueOpts,
    upload_dir: PathBuf,
    results_dir: PathBuf,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        db: TaskDb,
        converters: Converters,
        publisher: Option<Arc<dyn ResultPublisher>>,
        opts: QueueOpts,
        upload_dir: impl Into<PathBuf>,
        results_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            converters,
            publisher,
            opts,
            upload_dir: upload_dir.into(),
            results_dir: results_dir.into(),
            cancel: CancellationToken::new(),
            workers: Vec::new(),
            reaper: None,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        let orphaned = self.db.reset_startup().await?;
        if orphaned > 0 {
            info!(orphaned, "failed tasks left processing by a previous instance");
        }

        for i in 1..=self.opts.num_workers {
            let worker = Worker::new(
                format!("worker_{i}"),
                self.db.clone(),
                self.converters.clone(),
                self.publisher.clone(),
                self.opts.clone(),
                self.upload_dir.clone(),
                self.results_dir.clone(),
                self.cancel.clone(),
            );
            self.workers.push(tokio::spawn(worker.run()));
        }

        self.reaper = Some(tokio::spawn(reap(
            self.db.clone(),
            self.opts.stale_timeout_secs,
            self.opts.stale_check_interval(),
            self.cancel.clone(),
        )));

        info!(workers = self.opts.num_workers, "worker pool started");
        Ok(())
    }

    /// Cancel everything and wait. Each worker finishes (or releases) its
    /// current task before exiting, so no `processing` row survives a clean
    /// stop.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.await;
        }
        info!("worker pool stopped");
    }
}

/// Singleton reaper loop: every `interval`, return claims older than
/// `stale_timeout_secs` to the queue.
async fn reap(
    db: TaskDb,
    stale_timeout_secs: u64,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match db.release_stale(stale_timeout_secs).await {
            Ok(released) if released > 0 => {
                info!(released, "reaper returned stale tasks to the queue");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "reaper sweep failed"),
        }
    }
}
