use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::FmtSubscriber;

use quill_core::Converters;
use quill_host::server::{serve, AppState};
use quill_host::service::ConversionService;
use quill_host::Cli;
use quill_taskdb::TaskDb;
use quill_workers::WorkerPool;

/// How often the retention sweep runs. The cutoff itself comes from
/// `cleanup_days`.
const CLEANUP_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut opts = Cli::parse();
    opts.merge_from_file()
        .context("could not read the config file")?;

    let _guard = subscribe_log(&opts.log_path, &opts.log_level, opts.max_log);
    info!("start config:\n{:#?}", opts);

    for dir in [&opts.data_dir, &opts.upload_dir, &opts.results_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("could not create {}", dir.display()))?;
    }

    let db = TaskDb::new(opts.db_path());
    db.init().await.context("task database init failed")?;

    let converters = Converters::new(&opts.queue);
    let mut pool = WorkerPool::new(
        db.clone(),
        converters,
        None,
        opts.queue.clone(),
        &opts.upload_dir,
        &opts.results_dir,
    );
    pool.start().await.context("worker pool start failed")?;

    let service = ConversionService::new(
        db.clone(),
        opts.queue.clone(),
        &opts.upload_dir,
        &opts.results_dir,
    );

    let sweeper = tokio::spawn(run_cleanup_sweep(service.clone()));

    serve(AppState { service }, &opts.address).await?;

    // Graceful teardown: the HTTP server has already stopped accepting
    // requests; drain the workers before exiting.
    sweeper.abort();
    pool.stop().await;
    Ok(())
}

async fn run_cleanup_sweep(service: ConversionService) {
    let mut interval = tokio::time::interval(CLEANUP_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = service.cleanup_old_tasks().await {
            error!(error = %e, "retention sweep failed");
        }
    }
}

fn subscribe_log(
    log_path: &Option<PathBuf>,
    log_level: &String,
    max_log: usize,
) -> Option<WorkerGuard> {
    let subscriber_builder = FmtSubscriber::builder()
        .with_env_filter(log_level)
        .with_test_writer();
    match log_path {
        Some(ref log_path) => {
            let file_appender = Builder::new()
                .rotation(Rotation::DAILY)
                .filename_prefix("quill.log")
                .max_log_files(max_log)
                .build(log_path)
                .expect("initializing rolling file appender failed");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let subscriber = subscriber_builder.json().with_writer(non_blocking).finish();
            tracing::subscriber::set_global_default(subscriber).expect("setting subscriber failed");
            Some(guard)
        }
        None => {
            let subscriber = subscriber_builder.finish();
            tracing::subscriber::set_global_default(subscriber).expect("setting subscriber failed");
            None
        }
    }
}
