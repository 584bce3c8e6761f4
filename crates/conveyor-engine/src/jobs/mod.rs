//! Job lifecycle
//!
//! A job is registered once on a [`JobEngine`] under its [`Job::NAME`]. Every
//! invocation through [`JobEngine::enqueue`] is recorded as a [`JobRun`] that
//! moves `queued -> running -> done | failed`; the terminal transition is
//! published so that [`RunHandle::wait_until_finished`] can return without
//! polling. [`JobEngine::run_sync`] executes the same envelope without
//! storing anything.
//!
//! Runs are persisted by a [`RunStore`] ([`PgRunStore`] in production,
//! [`MemoryRunStore`] in tests). Queued runs are delivered to workers by a
//! [`JobQueue`], or executed inline when the engine runs in
//! [`QueueMode::Inline`](crate::config::QueueMode::Inline).

pub mod builtin;
pub mod engine;
pub mod job;
pub mod memory;
pub mod notifier;
pub mod queue;
pub mod run;
pub mod store;

pub use engine::{JobEngine, JobEngineBuilder, JobPanicked, RunHandle};
pub use job::{Hook, Job, JobArgs, JobContext};
pub use memory::MemoryRunStore;
pub use notifier::FaultNotifier;
pub use queue::{ApalisQueue, JobQueue, JobWorkerPool, QueuedJob};
pub use run::{JobRun, JobStatus};
pub use store::{channel_name, PgRunStore, RunQuery, RunStore, RunSubscription};
