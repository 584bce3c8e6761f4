//! In-process run store, used by tests and inline engines without a database.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{broadcast, Mutex};

use super::run::{JobRun, JobStatus};
use super::store::{RunQuery, RunStore, RunSubscription};
use crate::error::{EngineError, EngineResult};

#[derive(Default)]
struct State {
    runs: BTreeMap<i64, JobRun>,
    next_id: i64,
    notifications: HashMap<i64, usize>,
}

pub struct MemoryRunStore {
    state: Mutex<State>,
    completions: broadcast::Sender<i64>,
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRunStore {
    pub fn new() -> Self {
        let (completions, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            completions,
        }
    }

    /// How many completion signals were published for `id`.
    pub async fn notifications(&self, id: i64) -> usize {
        self.state
            .lock()
            .await
            .notifications
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn runs(&self) -> Vec<JobRun> {
        self.state.lock().await.runs.values().cloned().collect()
    }

    async fn transition(
        &self,
        id: i64,
        to: JobStatus,
        details: Option<&Value>,
    ) -> EngineResult<JobRun> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        if !run.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                id,
                from: run.status,
                to,
            });
        }

        run.status = to;
        if to == JobStatus::Running {
            run.executed_at = Some(Utc::now());
        } else {
            run.completed_at = Some(Utc::now());
            run.details = details.cloned().unwrap_or_else(|| json!({}));
        }
        Ok(run.clone())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, job_class: &str, job_id: &str, user_id: &str) -> EngineResult<JobRun> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let run = JobRun {
            id: state.next_id,
            job_id: job_id.to_string(),
            job_class: job_class.to_string(),
            user_id: user_id.to_string(),
            status: JobStatus::Queued,
            queued_at: Utc::now(),
            executed_at: None,
            completed_at: None,
            details: json!({}),
            ephemeral: false,
        };
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn find(&self, id: i64) -> EngineResult<Option<JobRun>> {
        Ok(self.state.lock().await.runs.get(&id).cloned())
    }

    async fn mark_running(&self, id: i64) -> EngineResult<JobRun> {
        self.transition(id, JobStatus::Running, None).await
    }

    async fn mark_finished(&self, id: i64, status: JobStatus, details: &Value) -> EngineResult<JobRun> {
        if !status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id,
                from: JobStatus::Running,
                to: status,
            });
        }
        self.transition(id, status, Some(details)).await
    }

    async fn query(&self, query: &RunQuery) -> EngineResult<Vec<JobRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<JobRun> = state
            .runs
            .values()
            .filter(|run| query.matches(run))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.queued_at.cmp(&a.queued_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = query.limit {
            runs.truncate(usize::try_from(limit).unwrap_or(0));
        }
        Ok(runs)
    }

    async fn notify_finished(&self, id: i64) -> EngineResult<()> {
        *self.state.lock().await.notifications.entry(id).or_default() += 1;
        // No receivers is fine: nobody is waiting.
        let _ = self.completions.send(id);
        Ok(())
    }

    async fn subscribe(&self, id: i64) -> EngineResult<Box<dyn RunSubscription>> {
        Ok(Box::new(MemorySubscription {
            id,
            receiver: self.completions.subscribe(),
        }))
    }
}

struct MemorySubscription {
    id: i64,
    receiver: broadcast::Receiver<i64>,
}

#[async_trait]
impl RunSubscription for MemorySubscription {
    async fn recv(&mut self) -> EngineResult<()> {
        loop {
            match self.receiver.recv().await {
                Ok(id) if id == self.id => return Ok(()),
                Ok(_) => continue,
                // Missed signals may include ours; let the caller reload.
                Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EngineError::queue("run store was dropped"))
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lifecycle() {
        let store = MemoryRunStore::new();
        let run = store.create("export", "7", "42").await.unwrap();
        assert!(run.is_queued());
        assert!(run.executed_at.is_none());

        let run = store.mark_running(run.id).await.unwrap();
        assert!(run.is_running());
        assert!(run.executed_at.is_some());

        let run = store
            .mark_finished(run.id, JobStatus::Done, &json!({ "result": 1 }))
            .await
            .unwrap();
        assert!(run.is_done());
        assert_eq!(run.result(), Some(&json!(1)));
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_rejects_illegal_transitions() {
        let store = MemoryRunStore::new();
        let run = store.create("export", "7", "42").await.unwrap();

        let err = store
            .mark_finished(run.id, JobStatus::Done, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: JobStatus::Queued,
                to: JobStatus::Done,
                ..
            }
        ));

        store.mark_running(run.id).await.unwrap();
        assert!(store.mark_running(run.id).await.is_err());
        assert!(store
            .mark_finished(run.id, JobStatus::Queued, &json!({}))
            .await
            .is_err());
        assert!(matches!(
            store.mark_running(999).await,
            Err(EngineError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_query_newest_first() {
        let store = MemoryRunStore::new();
        let first = store.create("export", "7", "42").await.unwrap();
        let second = store.create("export", "7", "43").await.unwrap();
        store.create("export", "8", "42").await.unwrap();
        store.mark_running(first.id).await.unwrap();

        let all = store.query(&RunQuery::new("export", "7")).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second.id, first.id]);

        let limited = store.query(&RunQuery::new("export", "7").limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, second.id);

        let running = store
            .query(&RunQuery::new("export", "7").statuses(&[JobStatus::Running]))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, first.id);
    }

    #[tokio::test]
    async fn test_subscription_only_wakes_for_its_run() {
        let store = MemoryRunStore::new();
        let mut subscription = store.subscribe(2).await.unwrap();

        store.notify_finished(1).await.unwrap();
        let early = tokio::time::timeout(Duration::from_millis(20), subscription.recv()).await;
        assert!(early.is_err());

        store.notify_finished(2).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.notifications(2).await, 1);
    }
}
