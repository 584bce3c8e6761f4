//! Job execution engine
//!
//! Every invocation, queued or synchronous, goes through the same envelope:
//!
//! 1. log the censored options
//! 2. move the run to `running` (stored runs only)
//! 3. `before` hook
//! 4. job body
//! 5. turn the return value into JSON; failure to do so fails the run with
//!    [`INVALID_RESULT_MESSAGE`]
//! 6. record `done` or `failed` unless the body declared an outcome itself
//! 7. `success` or `error` hook, then `after`
//! 8. publish the completion (stored runs only)
//!
//! If the outcome cannot be recorded, `error` and `after` still run against
//! an in-memory failed copy of the run before the store error is returned.
//!
//! Hook faults, including panics, are logged and swallowed. Job panics are
//! recorded as failures like any other fault.

use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::job::{Declared, ErasedJob, ExecuteError, Hook, Job, JobArgs, JobContext, Registered};
use super::notifier::FaultNotifier;
use super::queue::{JobQueue, QueuedJob};
use super::run::{JobRun, JobStatus};
use super::store::{RunQuery, RunStore};
use crate::config::{JobsConfig, QueueMode};
use crate::error::{EngineError, EngineResult, INVALID_RESULT_MESSAGE};
use crate::storage::{MergeError, StorageError};
use crate::streams::StreamError;
use conveyor_common::censor::censor_keys;

/// A job body panicked.
#[derive(Error, Debug)]
#[error("job panicked: {0}")]
pub struct JobPanicked(pub String);

/// How the body of one invocation ended.
enum Outcome {
    Done(Value),
    Declared(String),
    Invalid,
    Fault(anyhow::Error),
}

impl Outcome {
    /// What a synchronous caller sees. Faults come back as the original error.
    fn into_result(self) -> anyhow::Result<Value> {
        match self {
            Outcome::Done(value) => Ok(value),
            Outcome::Declared(message) => Err(EngineError::JobFailed(message).into()),
            Outcome::Invalid => Err(EngineError::InvalidResult.into()),
            Outcome::Fault(fault) => Err(fault),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Short tag for the kind of fault, stored next to the message.
fn fault_type(fault: &anyhow::Error) -> &'static str {
    if fault.is::<JobPanicked>() {
        "Panic"
    } else if fault.is::<StreamError>() {
        "StreamError"
    } else if fault.is::<MergeError>() {
        "MergeError"
    } else if fault.is::<StorageError>() {
        "StorageError"
    } else if fault.is::<sqlx::Error>() {
        "DatabaseError"
    } else if fault.is::<EngineError>() {
        "EngineError"
    } else if fault.is::<std::io::Error>() {
        "IoError"
    } else if fault.is::<serde_json::Error>() {
        "SerializationError"
    } else {
        "Error"
    }
}

fn truncate_message(message: &str, limit: usize) -> String {
    message.chars().take(limit).collect()
}

/// Runs registered jobs and records their runs.
pub struct JobEngine {
    jobs: HashMap<&'static str, Arc<dyn ErasedJob>>,
    store: Arc<dyn RunStore>,
    queue: Option<Arc<dyn JobQueue>>,
    notifiers: Vec<Arc<dyn FaultNotifier>>,
    config: JobsConfig,
}

pub struct JobEngineBuilder {
    jobs: HashMap<&'static str, Arc<dyn ErasedJob>>,
    store: Arc<dyn RunStore>,
    queue: Option<Arc<dyn JobQueue>>,
    notifiers: Vec<Arc<dyn FaultNotifier>>,
    config: JobsConfig,
}

impl JobEngineBuilder {
    pub fn config(mut self, config: JobsConfig) -> Self {
        self.config = config;
        self
    }

    /// Register `job` under [`Job::NAME`], replacing any job of that name.
    pub fn register<J: Job>(mut self, job: J) -> Self {
        if self.jobs.insert(J::NAME, Arc::new(Registered(job))).is_some() {
            warn!(job_class = J::NAME, "Job registered twice, keeping the last one");
        }
        self
    }

    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn FaultNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn build(self) -> EngineResult<JobEngine> {
        self.config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        if self.config.queue_mode == QueueMode::Durable && self.queue.is_none() {
            return Err(EngineError::Config(
                "durable queue mode needs a job queue".to_string(),
            ));
        }

        Ok(JobEngine {
            jobs: self.jobs,
            store: self.store,
            queue: self.queue,
            notifiers: self.notifiers,
            config: self.config,
        })
    }
}

impl JobEngine {
    pub fn builder(store: Arc<dyn RunStore>) -> JobEngineBuilder {
        JobEngineBuilder {
            jobs: HashMap::new(),
            store,
            queue: None,
            notifiers: Vec::new(),
            config: JobsConfig::default(),
        }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Names of all registered jobs, sorted.
    pub fn job_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.jobs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn job(&self, job_class: &str) -> EngineResult<Arc<dyn ErasedJob>> {
        self.jobs
            .get(job_class)
            .cloned()
            .ok_or_else(|| EngineError::UnknownJob(job_class.to_string()))
    }

    pub fn handle(&self, run: JobRun) -> RunHandle {
        RunHandle {
            run,
            store: Arc::clone(&self.store),
        }
    }

    /// Create a queued run and submit it.
    ///
    /// In inline mode the job has already finished when this returns; the
    /// returned run is reloaded either way. Job failures are recorded on the
    /// run and are not returned here.
    #[instrument(skip(self, options), fields(run_id))]
    pub async fn enqueue(
        &self,
        job_class: &str,
        job_id: &str,
        user_id: &str,
        options: Value,
    ) -> EngineResult<RunHandle> {
        let args = JobArgs::new(job_id, user_id, options);
        args.validate()?;
        self.job(job_class)?;

        let run = self.store.create(job_class, job_id, user_id).await?;
        tracing::Span::current().record("run_id", run.id);
        info!(run_id = run.id, "Job run queued");

        let queued = QueuedJob {
            run_id: run.id,
            job_class: job_class.to_string(),
            job_id: args.job_id,
            user_id: args.user_id,
            options: args.options,
        };
        match self.config.queue_mode {
            QueueMode::Inline => self.perform(queued).await?,
            QueueMode::Durable => {
                let queue = self.queue.as_ref().ok_or_else(|| {
                    EngineError::Config("durable queue mode needs a job queue".to_string())
                })?;
                queue.push(queued).await?;
            },
        }

        let run = self
            .store
            .find(run.id)
            .await?
            .ok_or(EngineError::NotFound(run.id))?;
        Ok(self.handle(run))
    }

    /// [`enqueue`](Self::enqueue), then wait for the run to finish.
    pub async fn enqueue_and_wait(
        &self,
        job_class: &str,
        job_id: &str,
        user_id: &str,
        options: Value,
        timeout: Option<Duration>,
    ) -> EngineResult<JobRun> {
        let handle = self.enqueue(job_class, job_id, user_id, options).await?;
        handle
            .wait_until_finished(timeout)
            .await?
            .ok_or(EngineError::WaitTimeout {
                run_id: handle.id(),
            })
    }

    /// Execute a job right away without storing a run.
    ///
    /// Returns the job's result. A fault raised by the job body is returned
    /// as the original error, so callers can downcast it; a declared failure
    /// is an [`EngineError::JobFailed`] and an unstorable result an
    /// [`EngineError::InvalidResult`].
    pub async fn run_sync(
        &self,
        job_class: &str,
        job_id: &str,
        user_id: &str,
        options: Value,
    ) -> anyhow::Result<Value> {
        let job = self.job(job_class)?;
        let args = JobArgs::new(job_id, user_id, options);
        args.validate()?;

        let run = JobRun::ephemeral(job.name(), job_id, user_id);
        self.execute(job.as_ref(), args, run).await?.into_result()
    }

    /// [`run_sync`](Self::run_sync), but the run is stored and its
    /// completion published like a queued one.
    pub async fn run_sync_persisted(
        &self,
        job_class: &str,
        job_id: &str,
        user_id: &str,
        options: Value,
    ) -> anyhow::Result<Value> {
        let job = self.job(job_class)?;
        let args = JobArgs::new(job_id, user_id, options);
        args.validate()?;

        let run = self.store.create(job.name(), job_id, user_id).await?;
        self.execute(job.as_ref(), args, run).await?.into_result()
    }

    /// Execute a queued run. Runs that already finished are skipped, since
    /// the queue may deliver a message more than once.
    pub async fn perform(&self, queued: QueuedJob) -> EngineResult<()> {
        let job = self.job(&queued.job_class)?;
        let run = self
            .store
            .find(queued.run_id)
            .await?
            .ok_or(EngineError::NotFound(queued.run_id))?;

        if run.is_finished() {
            info!(run_id = run.id, status = %run.status, "Run already finished, skipping");
            return Ok(());
        }
        if run.is_running() {
            warn!(run_id = run.id, "Run was started before, executing it again");
        }

        self.execute(job.as_ref(), queued.args(), run).await?;
        Ok(())
    }

    async fn execute(&self, job: &dyn ErasedJob, args: JobArgs, run: JobRun) -> EngineResult<Outcome> {
        let job_class = job.name();
        let censored = censor_keys(&args.options, &self.config.censored_keys);
        info!(
            job_class,
            job_id = %args.job_id,
            user_id = %args.user_id,
            run_id = run.id,
            options = %censored,
            "Executing job"
        );
        let started = Instant::now();

        let run = if run.is_queued() {
            self.store.mark_running(run.id).await?
        } else {
            run
        };

        self.run_hook(job, Hook::Before, &run, &args).await;

        let mut ctx = JobContext::new(args.clone(), run.clone());
        let executed = AssertUnwindSafe(job.execute(&mut ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ExecuteError::Fault(JobPanicked(panic_message(&*panic)).into()))
            });
        let limit = self.config.error_message_limit;

        let (status, details, outcome) = match (executed, ctx.take_declared()) {
            (Err(ExecuteError::Fault(fault)), _) => {
                let message = truncate_message(&format!("{fault:#}"), limit);
                error!(job_class, run_id = run.id, error = %message, "Job failed");
                let details = json!({ "error": message, "error_type": fault_type(&fault) });
                (JobStatus::Failed, details, Outcome::Fault(fault))
            },
            (_, Some(Declared::Failed(message))) => {
                let message = truncate_message(&message, limit);
                warn!(job_class, run_id = run.id, error = %message, "Job declared failure");
                (JobStatus::Failed, json!({ "error": message }), Outcome::Declared(message))
            },
            (Err(ExecuteError::InvalidResult(e)), _) => {
                warn!(job_class, run_id = run.id, error = %e, "Job returned an unstorable result");
                let details = json!({ "error": INVALID_RESULT_MESSAGE, "error_type": "InvalidResult" });
                (JobStatus::Failed, details, Outcome::Invalid)
            },
            (Ok(value), Some(Declared::Done(details))) => {
                (JobStatus::Done, details, Outcome::Done(value))
            },
            (Ok(value), None) => (
                JobStatus::Done,
                json!({ "result": value.clone() }),
                Outcome::Done(value),
            ),
        };

        let run = if run.ephemeral {
            JobRun {
                status,
                details,
                completed_at: Some(chrono::Utc::now()),
                ..run
            }
        } else {
            match self.store.mark_finished(run.id, status, &details).await {
                Ok(run) => run,
                Err(e) => {
                    error!(job_class, run_id = run.id, error = %e, "Failed to record run outcome");
                    let unrecorded = JobRun {
                        status: JobStatus::Failed,
                        details: json!({ "error": e.to_string(), "error_type": "EngineError" }),
                        completed_at: Some(chrono::Utc::now()),
                        ..run
                    };
                    self.run_hook(job, Hook::Error, &unrecorded, &args).await;
                    self.run_hook(job, Hook::After, &unrecorded, &args).await;
                    return Err(e);
                },
            }
        };

        if let Outcome::Fault(fault) = &outcome {
            self.notify_fault(fault, job_class, &run);
        }

        let hook = if status == JobStatus::Done {
            Hook::Success
        } else {
            Hook::Error
        };
        self.run_hook(job, hook, &run, &args).await;
        self.run_hook(job, Hook::After, &run, &args).await;

        if !run.ephemeral {
            if let Err(e) = self.store.notify_finished(run.id).await {
                error!(run_id = run.id, error = %e, "Failed to publish run completion");
            }
        }

        info!(
            job_class,
            run_id = run.id,
            status = %run.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        );
        Ok(outcome)
    }

    async fn run_hook(&self, job: &dyn ErasedJob, hook: Hook, run: &JobRun, args: &JobArgs) {
        debug!(job_class = job.name(), run_id = run.id, %hook, "Running hook");
        let fault = match AssertUnwindSafe(job.hook(hook, run, args)).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(panic) => anyhow::anyhow!("{hook} hook panicked: {}", panic_message(&*panic)),
        };

        warn!(job_class = job.name(), run_id = run.id, %hook, error = %fault, "Job hook failed");
        if self.config.notify_hook_faults {
            self.notify_fault(&fault, job.name(), run);
        }
    }

    fn notify_fault(&self, fault: &anyhow::Error, job_class: &str, run: &JobRun) {
        for notifier in &self.notifiers {
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| notifier.notify(fault, job_class, run)));
            match result {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(error = %e, "Fault notifier failed"),
                Err(panic) => warn!(panic = %panic_message(&*panic), "Fault notifier panicked"),
            }
        }
    }

    pub async fn find_run(&self, id: i64) -> EngineResult<Option<JobRun>> {
        self.store.find(id).await
    }

    /// Most recent run of `job_class` for `job_id`, optionally for one user.
    pub async fn last_run(
        &self,
        job_class: &str,
        job_id: &str,
        user_id: Option<&str>,
    ) -> EngineResult<Option<JobRun>> {
        let query = RunQuery::new(job_class, job_id).user(user_id).limit(1);
        Ok(self.store.query(&query).await?.into_iter().next())
    }

    /// Up to `n` most recent runs, newest first.
    pub async fn last_runs(
        &self,
        job_class: &str,
        job_id: &str,
        n: i64,
        user_id: Option<&str>,
    ) -> EngineResult<Vec<JobRun>> {
        let query = RunQuery::new(job_class, job_id).user(user_id).limit(n);
        self.store.query(&query).await
    }

    /// Runs still queued or running.
    pub async fn runs_unfinished(
        &self,
        job_class: &str,
        job_id: &str,
        user_id: Option<&str>,
    ) -> EngineResult<Vec<JobRun>> {
        let query = RunQuery::new(job_class, job_id)
            .user(user_id)
            .statuses(&[JobStatus::Queued, JobStatus::Running]);
        self.store.query(&query).await
    }
}

/// A stored run plus the means to wait for it.
#[derive(Clone)]
pub struct RunHandle {
    run: JobRun,
    store: Arc<dyn RunStore>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle").field("run", &self.run).finish()
    }
}

impl RunHandle {
    pub fn id(&self) -> i64 {
        self.run.id
    }

    /// The run as of the last load.
    pub fn run(&self) -> &JobRun {
        &self.run
    }

    pub fn into_run(self) -> JobRun {
        self.run
    }

    pub async fn reload(&mut self) -> EngineResult<&JobRun> {
        self.run = self.load().await?;
        Ok(&self.run)
    }

    async fn load(&self) -> EngineResult<JobRun> {
        self.store
            .find(self.run.id)
            .await?
            .ok_or(EngineError::NotFound(self.run.id))
    }

    /// Block until the run is `done` or `failed`, or `timeout` passes.
    ///
    /// Returns the finished run, or `None` on timeout. The subscription is
    /// made before the status is checked, so a completion published in
    /// between still wakes this waiter. Without a timeout this only returns
    /// once the run has finished.
    pub async fn wait_until_finished(&self, timeout: Option<Duration>) -> EngineResult<Option<JobRun>> {
        let mut subscription = self.store.subscribe(self.run.id).await?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let run = self.load().await?;
            if run.is_finished() {
                return Ok(Some(run));
            }

            match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, subscription.recv()).await {
                        Ok(signal) => signal?,
                        Err(_) => break,
                    }
                },
                None => subscription.recv().await?,
            }
        }

        let run = self.load().await?;
        Ok(run.is_finished().then_some(run))
    }
}
