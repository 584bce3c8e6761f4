//! Conveyor Engine Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Background ETL jobs between PostgreSQL and S3-compatible object storage.
//!
//! # Overview
//!
//! - **Jobs**: a lifecycle engine recording every run (`queued -> running ->
//!   done | failed`) with hooks, fault notification and completion waits
//! - **Streams**: pull/push [`Reader`](streams::Reader) and
//!   [`Writer`](streams::Writer) stages for database cursors, CSV, gzip and
//!   S3 objects
//! - **Storage**: the [`ObjectStore`](storage::ObjectStore) abstraction and
//!   the parallel multipart merge of many objects into one
//!
//! # Architecture
//!
//! ```text
//!   enqueue ──> conveyor_job_runs (queued) ──> apalis queue ──> worker
//!                                                              │
//!                     pg_notify <── done | failed <── Job::execute
//! ```
//!
//! Jobs are plain structs implementing [`Job`](jobs::Job). The built-in
//! export, import and merge jobs live in [`jobs::builtin`].
//!
//! # Example
//!
//! ```no_run
//! use conveyor_engine::config::{EngineConfig, QueueMode};
//! use conveyor_engine::jobs::{builtin, ApalisQueue, JobEngine, PgRunStore};
//! use conveyor_engine::{db, storage::S3Store};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     let store = Arc::new(S3Store::new(&config.storage));
//!
//!     let builder = JobEngine::builder(Arc::new(PgRunStore::new(pool.clone())))
//!         .config(config.jobs.clone())
//!         .queue(Arc::new(ApalisQueue::setup(&pool).await?));
//!     let engine = builtin::register_builtin(builder, &pool, store, "conveyor", &config.storage)
//!         .build()?;
//!
//!     let run = engine
//!         .enqueue_and_wait(
//!             "export",
//!             "7",
//!             "42",
//!             serde_json::json!({ "db": { "query": "SELECT * FROM users" } }),
//!             None,
//!         )
//!         .await?;
//!     println!("{}: {}", run.status, run.details);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod storage;
pub mod streams;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};
