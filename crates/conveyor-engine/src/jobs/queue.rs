//! Durable job queue
//!
//! Sets up the apalis queue with PostgreSQL storage. Each queued message
//! carries the run id created by `enqueue`; workers hand it straight back to
//! [`JobEngine::perform`].

use apalis::prelude::*;
use apalis_postgres::PostgresStorage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::engine::JobEngine;
use super::job::JobArgs;
use crate::error::{EngineError, EngineResult};

/// Queue message for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub run_id: i64,
    pub job_class: String,
    pub job_id: String,
    pub user_id: String,
    pub options: Value,
}

impl QueuedJob {
    pub fn args(&self) -> JobArgs {
        JobArgs::new(self.job_id.clone(), self.user_id.clone(), self.options.clone())
    }
}

/// Where `enqueue` submits jobs in durable mode.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: QueuedJob) -> EngineResult<()>;
}

/// apalis queue backed by PostgreSQL
#[derive(Clone)]
pub struct ApalisQueue {
    storage: PostgresStorage<QueuedJob>,
}

impl ApalisQueue {
    /// Create the apalis tables if needed and open the queue.
    pub async fn setup(pool: &PgPool) -> EngineResult<Self> {
        info!("Setting up PostgreSQL storage for apalis");
        PostgresStorage::setup(pool)
            .await
            .map_err(EngineError::queue)?;
        Ok(Self {
            storage: PostgresStorage::new(pool),
        })
    }

    pub fn storage(&self) -> PostgresStorage<QueuedJob> {
        self.storage.clone()
    }
}

#[async_trait]
impl JobQueue for ApalisQueue {
    async fn push(&self, job: QueuedJob) -> EngineResult<()> {
        let run_id = job.run_id;
        let mut storage = self.storage.clone();
        storage.push(job).await.map_err(EngineError::queue)?;
        info!(run_id, "Job pushed to queue");
        Ok(())
    }
}

/// Workers draining an [`ApalisQueue`].
pub struct JobWorkerPool {
    engine: Arc<JobEngine>,
    storage: PostgresStorage<QueuedJob>,
    concurrency: usize,
}

impl JobWorkerPool {
    pub fn new(engine: Arc<JobEngine>, queue: &ApalisQueue, concurrency: usize) -> Self {
        Self {
            engine,
            storage: queue.storage(),
            concurrency: concurrency.max(1),
        }
    }

    /// Start the workers on a background task.
    pub async fn start(self) -> anyhow::Result<JoinHandle<()>> {
        info!(workers = self.concurrency, "Starting job workers");

        let JobWorkerPool {
            engine,
            storage,
            concurrency,
        } = self;

        let handle = tokio::spawn(async move {
            let mut monitor = Monitor::new();
            for index in 0..concurrency {
                let name = format!("conveyor-worker-{index}");
                let storage = storage.clone();
                let engine = engine.clone();
                monitor = monitor.register(move |_index| {
                    WorkerBuilder::new(&name)
                        .backend(storage.clone())
                        .data(engine.clone())
                        .build(process_queued_job)
                });
            }

            if let Err(e) = monitor.run().await {
                error!("Job worker error: {:?}", e);
            }
            info!("Job workers stopped");
        });

        Ok(handle)
    }
}

/// Called by the apalis worker for every delivered message.
async fn process_queued_job(job: QueuedJob, engine: Data<Arc<JobEngine>>) -> Result<(), EngineError> {
    info!(run_id = job.run_id, job_class = %job.job_class, "Processing queued job");
    engine.perform(job).await
}
