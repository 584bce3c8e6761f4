//! Job-run persistence tests
//!
//! The PostgreSQL run store, its completion notifications and the durable
//! apalis queue end to end.
//!
//! ```bash
//! cargo test --test run_store_tests -- --ignored --nocapture
//! ```

mod common;

use async_trait::async_trait;
use common::{init_test_tracing, TestPostgres};
use conveyor_engine::config::{JobsConfig, QueueMode};
use conveyor_engine::jobs::{
    ApalisQueue, Job, JobContext, JobEngine, JobStatus, JobWorkerPool, PgRunStore, RunQuery,
    RunStore,
};
use conveyor_engine::EngineError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Double;

#[async_trait]
impl Job for Double {
    const NAME: &'static str = "double";
    type Output = i64;

    async fn execute(&self, ctx: &mut JobContext) -> anyhow::Result<i64> {
        let n = ctx.options()["n"].as_i64().unwrap_or_default();
        if n < 0 {
            anyhow::bail!("negative input {n}");
        }
        Ok(n * 2)
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_run_lifecycle_in_postgres() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let store = PgRunStore::new(pg.pool_clone());

    let run = store.create("double", "7", "42").await.unwrap();
    assert_eq!(run.status, JobStatus::Queued);
    assert_eq!(run.details, json!({}));

    let running = store.mark_running(run.id).await.unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert!(running.executed_at.is_some());

    let err = store.mark_running(run.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: JobStatus::Running,
            to: JobStatus::Running,
            ..
        }
    ));

    let done = store
        .mark_finished(run.id, JobStatus::Done, &json!({ "result": 14 }))
        .await
        .unwrap();
    assert!(done.is_done());
    assert!(done.completed_at.is_some());
    assert_eq!(done.result(), Some(&json!(14)));

    assert!(matches!(
        store.mark_running(9999).await.unwrap_err(),
        EngineError::NotFound(9999)
    ));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_query_orders_newest_first() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let store = PgRunStore::new(pg.pool_clone());

    let first = store.create("double", "7", "1").await.unwrap();
    let second = store.create("double", "7", "2").await.unwrap();
    store.create("double", "8", "1").await.unwrap();
    store.mark_running(first.id).await.unwrap();

    let all = store.query(&RunQuery::new("double", "7")).await.unwrap();
    assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second.id, first.id]);

    let mine = store
        .query(&RunQuery::new("double", "7").user(Some("1")))
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);

    let queued = store
        .query(&RunQuery::new("double", "7").statuses(&[JobStatus::Queued]).limit(5))
        .await
        .unwrap();
    assert_eq!(queued.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second.id]);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_notification_wakes_waiter() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let store = Arc::new(PgRunStore::new(pg.pool_clone()));

    let run = store.create("double", "7", "42").await.unwrap();
    store.mark_running(run.id).await.unwrap();

    let engine = JobEngine::builder(store.clone())
        .config(JobsConfig::inline())
        .register(Double)
        .build()
        .unwrap();
    let handle = engine.handle(run.clone());

    let finisher = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            store
                .mark_finished(run.id, JobStatus::Failed, &json!({ "error": "stopped" }))
                .await
                .unwrap();
            store.notify_finished(run.id).await.unwrap();
        })
    };

    let finished = handle
        .wait_until_finished(Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .expect("run finished before the timeout");
    finisher.await.unwrap();

    assert!(finished.is_failed());
    assert_eq!(finished.error(), Some("stopped"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_durable_queue_end_to_end() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let queue = Arc::new(ApalisQueue::setup(pg.pool()).await.unwrap());

    let engine = JobEngine::builder(Arc::new(PgRunStore::new(pg.pool_clone())))
        .config(JobsConfig {
            queue_mode: QueueMode::Durable,
            ..JobsConfig::default()
        })
        .queue(queue.clone())
        .register(Double)
        .build()
        .unwrap();
    let engine = Arc::new(engine);

    let handle = engine.enqueue("double", "7", "42", json!({ "n": 21 })).await.unwrap();
    assert_eq!(handle.run().status, JobStatus::Queued);

    let workers = JobWorkerPool::new(engine.clone(), &queue, 2);
    let task = workers.start().await.unwrap();

    let done = handle
        .wait_until_finished(Some(Duration::from_secs(30)))
        .await
        .unwrap()
        .expect("worker finished the run");
    assert!(done.is_done(), "{}", done.details);
    assert_eq!(done.result(), Some(&json!(42)));

    let failed = engine
        .enqueue_and_wait("double", "7", "42", json!({ "n": -1 }), Some(Duration::from_secs(30)))
        .await
        .unwrap();
    assert!(failed.is_failed());
    assert_eq!(failed.error(), Some("negative input -1"));

    let last = engine.last_runs("double", "7", 5, None).await.unwrap();
    assert_eq!(last.len(), 2);
    assert_eq!(last[0].id, failed.id);
    assert!(engine.runs_unfinished("double", "7", None).await.unwrap().is_empty());
    assert_eq!(
        engine.last_run("double", "7", Some("42")).await.unwrap().map(|r| r.details),
        Some(json!({ "error": "negative input -1", "error_type": "Error" }))
    );

    task.abort();
}
