//! External fault notification

use super::run::JobRun;

/// Sink for faults worth a human's attention (error trackers, paging).
///
/// Called for uncaught job faults and, when enabled, for hook faults.
/// Errors and panics raised here are logged by the engine and go no further.
pub trait FaultNotifier: Send + Sync {
    fn notify(&self, error: &anyhow::Error, job_class: &str, run: &JobRun) -> anyhow::Result<()>;
}
