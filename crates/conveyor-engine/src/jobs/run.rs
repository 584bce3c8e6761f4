//! Job run records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// Lifecycle state of a run: `queued -> running -> done | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(EngineError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// One execution attempt of a job.
///
/// `details` holds `{"result": ..}` after an implicit success, whatever the
/// job passed to `done` after an explicit one, and `{"error": .., "error_type": ..}`
/// after a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: i64,
    pub job_id: String,
    pub job_class: String,
    pub user_id: String,
    pub status: JobStatus,
    pub queued_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub details: Value,
    /// Built for a synchronous run that is never stored.
    #[serde(skip)]
    pub ephemeral: bool,
}

impl JobRun {
    /// An in-memory run for `run_sync`, already running.
    pub fn ephemeral(job_class: &str, job_id: &str, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            job_id: job_id.to_string(),
            job_class: job_class.to_string(),
            user_id: user_id.to_string(),
            status: JobStatus::Running,
            queued_at: now,
            executed_at: Some(now),
            completed_at: None,
            details: json!({}),
            ephemeral: true,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.status == JobStatus::Queued
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn is_unfinished(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_done(&self) -> bool {
        self.status == JobStatus::Done
    }

    pub fn is_failed(&self) -> bool {
        self.status == JobStatus::Failed
    }

    pub fn error(&self) -> Option<&str> {
        self.details.get("error").and_then(Value::as_str)
    }

    pub fn result(&self) -> Option<&Value> {
        self.details.get("result")
    }

    /// Name of the file an export of this run is written to.
    pub fn filename(&self, app_id: &str) -> String {
        let time = self.queued_at.format("%Y_%m_%dT%H_%M_%S_%3fZ");
        format!("{app_id}_export_{}_{}_{time}.csv", self.job_id, self.user_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Done));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));

        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn test_status_parse() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_details_accessors() {
        let mut run = JobRun::ephemeral("export", "7", "42");
        assert!(run.is_running());
        assert!(run.error().is_none());

        run.details = json!({ "error": "boom", "error_type": "Error" });
        assert_eq!(run.error(), Some("boom"));

        run.details = json!({ "result": { "rows": 3 } });
        assert_eq!(run.result(), Some(&json!({ "rows": 3 })));
    }

    #[test]
    fn test_filename() {
        let mut run = JobRun::ephemeral("export", "7", "42");
        run.queued_at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 1).unwrap()
            + chrono::Duration::milliseconds(27);

        assert_eq!(
            run.filename("reports"),
            "reports_export_7_42_2024_03_09T14_05_01_027Z.csv"
        );
    }
}
