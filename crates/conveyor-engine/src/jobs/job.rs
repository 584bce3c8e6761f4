//! The job contract
//!
//! A job implements [`Job::execute`] and, optionally, any of the four hooks.
//! Every hook receives the same arguments, the current run plus the
//! caller's job id, user id and options; jobs ignore what they don't need.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use super::run::JobRun;
use crate::error::{EngineError, EngineResult};

/// Caller-supplied arguments of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct JobArgs {
    pub job_id: String,
    pub user_id: String,
    pub options: Value,
}

impl JobArgs {
    pub fn new(job_id: impl Into<String>, user_id: impl Into<String>, options: Value) -> Self {
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            options,
        }
    }

    /// Reject missing ids and options that are not a map.
    pub fn validate(&self) -> EngineResult<()> {
        if self.job_id.is_empty() {
            return Err(EngineError::validation("job id is required"));
        }
        if self.user_id.is_empty() {
            return Err(EngineError::validation("user id is required"));
        }
        if !self.options.is_object() {
            return Err(EngineError::validation("options must be a map"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Before,
    Success,
    Error,
    After,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::Before => "before",
            Hook::Success => "success",
            Hook::Error => "error",
            Hook::After => "after",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job body reported explicitly, overriding the implicit outcome.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Declared {
    Done(Value),
    Failed(String),
}

/// Handed to [`Job::execute`].
pub struct JobContext {
    args: JobArgs,
    run: JobRun,
    declared: Option<Declared>,
}

impl JobContext {
    pub(crate) fn new(args: JobArgs, run: JobRun) -> Self {
        Self {
            args,
            run,
            declared: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.args.job_id
    }

    pub fn user_id(&self) -> &str {
        &self.args.user_id
    }

    pub fn options(&self) -> &Value {
        &self.args.options
    }

    /// The options deserialized into a typed struct.
    pub fn parse_options<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.args.options.clone())
            .map_err(|e| anyhow::anyhow!("invalid job options: {e}"))
    }

    /// The run being executed. For `run_sync` this is an unsaved run.
    pub fn run(&self) -> &JobRun {
        &self.run
    }

    /// Finish successfully and store `details` as-is instead of
    /// `{"result": <return value>}`. Anything but a map is stored under
    /// `result`.
    pub fn done(&mut self, details: Value) {
        let details = match details {
            Value::Object(_) => details,
            other => serde_json::json!({ "result": other }),
        };
        self.declared = Some(Declared::Done(details));
    }

    /// Finish as failed with `message`, whatever the body returns.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.declared = Some(Declared::Failed(message.into()));
    }

    pub(crate) fn take_declared(&mut self) -> Option<Declared> {
        self.declared.take()
    }
}

#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Name the job is registered and recorded under.
    const NAME: &'static str;

    type Output: Serialize + Send;

    async fn execute(&self, ctx: &mut JobContext) -> anyhow::Result<Self::Output>;

    async fn before(&self, _run: &JobRun, _args: &JobArgs) -> anyhow::Result<()> {
        Ok(())
    }

    async fn success(&self, _run: &JobRun, _args: &JobArgs) -> anyhow::Result<()> {
        Ok(())
    }

    async fn error(&self, _run: &JobRun, _args: &JobArgs) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after(&self, _run: &JobRun, _args: &JobArgs) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Why a body produced no storable result.
#[derive(Debug)]
pub(crate) enum ExecuteError {
    Fault(anyhow::Error),
    InvalidResult(serde_json::Error),
}

/// Object-safe view of a [`Job`], built once at registration.
#[async_trait]
pub(crate) trait ErasedJob: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut JobContext) -> Result<Value, ExecuteError>;

    async fn hook(&self, hook: Hook, run: &JobRun, args: &JobArgs) -> anyhow::Result<()>;
}

pub(crate) struct Registered<J>(pub J);

#[async_trait]
impl<J: Job> ErasedJob for Registered<J> {
    fn name(&self) -> &'static str {
        J::NAME
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<Value, ExecuteError> {
        let output = self.0.execute(ctx).await.map_err(ExecuteError::Fault)?;
        serde_json::to_value(output).map_err(ExecuteError::InvalidResult)
    }

    async fn hook(&self, hook: Hook, run: &JobRun, args: &JobArgs) -> anyhow::Result<()> {
        match hook {
            Hook::Before => self.0.before(run, args).await,
            Hook::Success => self.0.success(run, args).await,
            Hook::Error => self.0.error(run, args).await,
            Hook::After => self.0.after(run, args).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_args_validation() {
        assert!(JobArgs::new("1", "2", json!({})).validate().is_ok());
        assert!(JobArgs::new("", "2", json!({})).validate().is_err());
        assert!(JobArgs::new("1", "", json!({})).validate().is_err());
        assert!(JobArgs::new("1", "2", Value::Null).validate().is_err());
        assert!(JobArgs::new("1", "2", json!([1])).validate().is_err());
    }

    #[test]
    fn test_context_declarations() {
        let run = JobRun::ephemeral("t", "1", "2");
        let mut ctx = JobContext::new(JobArgs::new("1", "2", json!({ "n": 3 })), run);
        assert_eq!(ctx.job_id(), "1");
        assert_eq!(ctx.options()["n"], 3);
        assert!(ctx.take_declared().is_none());

        ctx.done(json!({ "rows": 3 }));
        ctx.fail("nope");
        assert_eq!(ctx.take_declared(), Some(Declared::Failed("nope".to_string())));
        assert!(ctx.take_declared().is_none());
    }

    #[test]
    fn test_parse_options() {
        #[derive(Deserialize)]
        struct Opts {
            n: u32,
        }

        let run = JobRun::ephemeral("t", "1", "2");
        let ctx = JobContext::new(JobArgs::new("1", "2", json!({ "n": 3 })), run.clone());
        assert_eq!(ctx.parse_options::<Opts>().unwrap().n, 3);

        let ctx = JobContext::new(JobArgs::new("1", "2", json!({ "n": "x" })), run);
        assert!(ctx.parse_options::<Opts>().is_err());
    }
}
