//! Job run persistence and completion signalling
//!
//! A [`RunStore`] owns the run table and the publish/subscribe channel that
//! wakes waiters. [`PgRunStore`] keeps runs in `conveyor_job_runs` and uses
//! `LISTEN`/`NOTIFY` on one channel per run, so waiters in other processes
//! see completions without polling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool};
use sqlx::{Postgres, QueryBuilder};
use tracing::debug;

use super::run::{JobRun, JobStatus};
use crate::error::{EngineError, EngineResult};

const RUN_COLUMNS: &str =
    "id, job_id, job_class, user_id, status, queued_at, executed_at, completed_at, details";

/// Channel a run's completion is published on.
pub fn channel_name(run_id: i64) -> String {
    format!("conveyor_job_run_{run_id}")
}

/// Filter for the finders; newest runs first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunQuery {
    pub job_class: String,
    pub job_id: String,
    pub user_id: Option<String>,
    /// Empty means any status.
    pub statuses: Vec<JobStatus>,
    pub limit: Option<i64>,
}

impl RunQuery {
    pub fn new(job_class: &str, job_id: &str) -> Self {
        Self {
            job_class: job_class.to_string(),
            job_id: job_id.to_string(),
            ..Self::default()
        }
    }

    pub fn user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self
    }

    pub fn statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// In-process equivalent of the SQL filter.
    pub fn matches(&self, run: &JobRun) -> bool {
        run.job_class == self.job_class
            && run.job_id == self.job_id
            && self.user_id.as_ref().is_none_or(|u| *u == run.user_id)
            && (self.statuses.is_empty() || self.statuses.contains(&run.status))
    }
}

/// A live subscription to one run's completion channel.
#[async_trait]
pub trait RunSubscription: Send {
    /// Wait for the next signal. Spurious wakeups are allowed; callers
    /// reload the run afterwards.
    async fn recv(&mut self) -> EngineResult<()>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new `queued` run.
    async fn create(&self, job_class: &str, job_id: &str, user_id: &str) -> EngineResult<JobRun>;

    async fn find(&self, id: i64) -> EngineResult<Option<JobRun>>;

    /// `queued -> running`, stamping `executed_at`.
    async fn mark_running(&self, id: i64) -> EngineResult<JobRun>;

    /// `running -> done | failed`, storing `details` and `completed_at`.
    async fn mark_finished(&self, id: i64, status: JobStatus, details: &Value) -> EngineResult<JobRun>;

    async fn query(&self, query: &RunQuery) -> EngineResult<Vec<JobRun>>;

    /// Wake every subscriber of `id`.
    async fn notify_finished(&self, id: i64) -> EngineResult<()>;

    async fn subscribe(&self, id: i64) -> EngineResult<Box<dyn RunSubscription>>;
}

#[derive(sqlx::FromRow)]
struct JobRunRow {
    id: i64,
    job_id: String,
    job_class: String,
    user_id: String,
    status: String,
    queued_at: DateTime<Utc>,
    executed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    details: Value,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = EngineError;

    fn try_from(row: JobRunRow) -> Result<Self, Self::Error> {
        Ok(JobRun {
            id: row.id,
            job_id: row.job_id,
            job_class: row.job_class,
            user_id: row.user_id,
            status: row.status.parse()?,
            queued_at: row.queued_at,
            executed_at: row.executed_at,
            completed_at: row.completed_at,
            details: row.details,
            ephemeral: false,
        })
    }
}

/// Runs stored in PostgreSQL.
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn transition(
        &self,
        id: i64,
        from: JobStatus,
        to: JobStatus,
        details: Option<&Value>,
    ) -> EngineResult<JobRun> {
        let sql = match to {
            JobStatus::Running => format!(
                "UPDATE conveyor_job_runs SET status = $1, executed_at = now() \
                 WHERE id = $2 AND status = $3 RETURNING {RUN_COLUMNS}"
            ),
            _ => format!(
                "UPDATE conveyor_job_runs SET status = $1, completed_at = now(), details = $4 \
                 WHERE id = $2 AND status = $3 RETURNING {RUN_COLUMNS}"
            ),
        };

        let mut query = sqlx::query_as::<_, JobRunRow>(&sql)
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str());
        if to != JobStatus::Running {
            query = query.bind(details.cloned().unwrap_or_else(|| Value::Object(Default::default())));
        }

        match query.fetch_optional(&self.pool).await? {
            Some(row) => row.try_into(),
            None => {
                let current = self.find(id).await?.ok_or(EngineError::NotFound(id))?;
                Err(EngineError::InvalidTransition {
                    id,
                    from: current.status,
                    to,
                })
            },
        }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create(&self, job_class: &str, job_id: &str, user_id: &str) -> EngineResult<JobRun> {
        let sql = format!(
            "INSERT INTO conveyor_job_runs (job_id, job_class, user_id, status, queued_at, details) \
             VALUES ($1, $2, $3, 'queued', now(), '{{}}'::jsonb) RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRunRow>(&sql)
            .bind(job_id)
            .bind(job_class)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn find(&self, id: i64) -> EngineResult<Option<JobRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM conveyor_job_runs WHERE id = $1");
        sqlx::query_as::<_, JobRunRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRun::try_from)
            .transpose()
    }

    async fn mark_running(&self, id: i64) -> EngineResult<JobRun> {
        self.transition(id, JobStatus::Queued, JobStatus::Running, None)
            .await
    }

    async fn mark_finished(&self, id: i64, status: JobStatus, details: &Value) -> EngineResult<JobRun> {
        if !status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id,
                from: JobStatus::Running,
                to: status,
            });
        }
        self.transition(id, JobStatus::Running, status, Some(details))
            .await
    }

    async fn query(&self, query: &RunQuery) -> EngineResult<Vec<JobRun>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {RUN_COLUMNS} FROM conveyor_job_runs WHERE job_class = "
        ));
        builder
            .push_bind(query.job_class.clone())
            .push(" AND job_id = ")
            .push_bind(query.job_id.clone());
        if let Some(user_id) = &query.user_id {
            builder.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<String> = query.statuses.iter().map(|s| s.as_str().to_string()).collect();
            builder.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        builder.push(" ORDER BY queued_at DESC, id DESC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        builder
            .build_query_as::<JobRunRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(JobRun::try_from)
            .collect()
    }

    async fn notify_finished(&self, id: i64) -> EngineResult<()> {
        let channel = channel_name(id);
        debug!(run_id = id, channel = %channel, "Publishing run completion");
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, id: i64) -> EngineResult<Box<dyn RunSubscription>> {
        // The listener holds its own pooled connection until dropped.
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&channel_name(id)).await?;
        Ok(Box::new(PgSubscription { listener }))
    }
}

struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl RunSubscription for PgSubscription {
    async fn recv(&mut self) -> EngineResult<()> {
        let notification = self.listener.recv().await?;
        debug!(channel = notification.channel(), "Received run completion");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name(42), "conveyor_job_run_42");
    }

    #[test]
    fn test_query_matches() {
        let mut run = JobRun::ephemeral("export", "7", "42");
        run.status = JobStatus::Queued;

        assert!(RunQuery::new("export", "7").matches(&run));
        assert!(RunQuery::new("export", "7").user(Some("42")).matches(&run));
        assert!(!RunQuery::new("export", "7").user(Some("43")).matches(&run));
        assert!(!RunQuery::new("import", "7").matches(&run));
        assert!(RunQuery::new("export", "7")
            .statuses(&[JobStatus::Queued, JobStatus::Running])
            .matches(&run));
        assert!(!RunQuery::new("export", "7")
            .statuses(&[JobStatus::Done])
            .matches(&run));
    }
}
