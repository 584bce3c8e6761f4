//! Conveyor worker - drains the durable job queue

use anyhow::Result;
use conveyor_common::logging::{init_logging, LogConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use conveyor_engine::{
    config::{EngineConfig, QueueMode},
    db,
    jobs::{builtin, ApalisQueue, JobEngine, JobWorkerPool, PgRunStore},
    storage::S3Store,
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("conveyor-worker")
        .filter_directives("conveyor_engine=debug,apalis=info,sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env().unwrap_or(log_config);
    let _guard = init_logging(&log_config)?;

    info!("Starting Conveyor worker");

    let config = EngineConfig::load()?;
    if config.jobs.queue_mode != QueueMode::Durable {
        anyhow::bail!("The worker needs CONVEYOR_QUEUE_MODE=durable, inline runs need no worker");
    }

    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;
    info!("Database migrations completed");

    let store = Arc::new(S3Store::new(&config.storage));
    let queue = Arc::new(ApalisQueue::setup(&pool).await?);

    let builder = JobEngine::builder(Arc::new(PgRunStore::new(pool.clone())))
        .config(config.jobs.clone())
        .queue(queue.clone());
    let engine = builtin::register_builtin(builder, &pool, store, &config.jobs.app_id, &config.storage)
        .build()?;
    let engine = Arc::new(engine);
    info!(jobs = ?engine.job_names(), "Job engine ready");

    let workers = JobWorkerPool::new(engine, &queue, config.jobs.worker_concurrency);
    let handle = workers.start().await?;

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        result = handle => {
            if let Err(e) = result {
                warn!(error = %e, "Worker task ended unexpectedly");
            }
        },
    }

    info!("Conveyor worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
