//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::db::DbConfig;
use crate::storage::StorageConfig;
use conveyor_common::censor::DEFAULT_CENSORED_KEYS;

// ============================================================================
// Job Engine Configuration Constants
// ============================================================================

/// Default application id, used in export file names.
pub const DEFAULT_APP_ID: &str = "conveyor";

/// Default maximum length of a stored error message, in characters.
pub const DEFAULT_ERROR_MESSAGE_LIMIT: usize = 1000;

/// Default number of queue workers.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// How `enqueue` hands a job over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Execute the job inside `enqueue` before it returns.
    Inline,
    /// Push the job onto the durable queue.
    #[default]
    Durable,
}

impl FromStr for QueueMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" | "sync" => Ok(QueueMode::Inline),
            "durable" | "async" => Ok(QueueMode::Durable),
            other => anyhow::bail!("Unknown queue mode '{other}' (expected inline or durable)"),
        }
    }
}

/// Job execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub app_id: String,
    /// Option keys redacted before options are logged.
    pub censored_keys: Vec<String>,
    pub error_message_limit: usize,
    /// Forward hook faults to the fault notifiers too.
    pub notify_hook_faults: bool,
    pub queue_mode: QueueMode,
    pub worker_concurrency: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            censored_keys: DEFAULT_CENSORED_KEYS.iter().map(|k| k.to_string()).collect(),
            error_message_limit: DEFAULT_ERROR_MESSAGE_LIMIT,
            notify_hook_faults: true,
            queue_mode: QueueMode::default(),
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
        }
    }
}

impl JobsConfig {
    /// Settings for running everything inline, e.g. in tests.
    pub fn inline() -> Self {
        Self {
            queue_mode: QueueMode::Inline,
            ..Self::default()
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            app_id: std::env::var("CONVEYOR_APP_ID").unwrap_or(defaults.app_id),
            censored_keys: std::env::var("CONVEYOR_CENSORED_KEYS")
                .map(|keys| {
                    keys.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.censored_keys),
            error_message_limit: std::env::var("CONVEYOR_ERROR_MESSAGE_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.error_message_limit),
            notify_hook_faults: std::env::var("CONVEYOR_NOTIFY_HOOK_FAULTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.notify_hook_faults),
            queue_mode: match std::env::var("CONVEYOR_QUEUE_MODE") {
                Ok(mode) => mode.parse()?,
                Err(_) => defaults.queue_mode,
            },
            worker_concurrency: std::env::var("CONVEYOR_WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.worker_concurrency),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.app_id.is_empty() {
            anyhow::bail!("Application id cannot be empty");
        }
        if self.error_message_limit == 0 {
            anyhow::bail!("Error message limit must be greater than 0");
        }
        if self.worker_concurrency == 0 {
            anyhow::bail!("Worker concurrency must be greater than 0");
        }
        Ok(())
    }
}

/// Everything a worker process needs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database: DbConfig,
    pub storage: StorageConfig,
    pub jobs: JobsConfig,
}

impl EngineConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = EngineConfig {
            database: DbConfig::from_env()?,
            storage: StorageConfig::from_env()?,
            jobs: JobsConfig::from_env()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!("Database min_connections cannot exceed max_connections");
        }

        self.storage.validate()?;
        self.jobs.validate()?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_jobs_defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.app_id, "conveyor");
        assert_eq!(config.censored_keys, vec!["password", "secret_access_key"]);
        assert!(config.notify_hook_faults);
        assert_eq!(config.queue_mode, QueueMode::Durable);
        config.validate().unwrap();
    }

    #[test]
    fn test_queue_mode_parse() {
        assert_eq!("inline".parse::<QueueMode>().unwrap(), QueueMode::Inline);
        assert_eq!("Durable".parse::<QueueMode>().unwrap(), QueueMode::Durable);
        assert!("later".parse::<QueueMode>().is_err());
    }

    #[test]
    #[serial]
    fn test_jobs_from_env() {
        std::env::set_var("CONVEYOR_APP_ID", "reports");
        std::env::set_var("CONVEYOR_CENSORED_KEYS", "password, token");
        std::env::set_var("CONVEYOR_QUEUE_MODE", "inline");

        let config = JobsConfig::from_env().unwrap();
        assert_eq!(config.app_id, "reports");
        assert_eq!(config.censored_keys, vec!["password", "token"]);
        assert_eq!(config.queue_mode, QueueMode::Inline);

        std::env::remove_var("CONVEYOR_APP_ID");
        std::env::remove_var("CONVEYOR_CENSORED_KEYS");
        std::env::remove_var("CONVEYOR_QUEUE_MODE");
    }

    #[test]
    #[serial]
    fn test_invalid_queue_mode_in_env() {
        std::env::set_var("CONVEYOR_QUEUE_MODE", "later");
        assert!(JobsConfig::from_env().is_err());
        std::env::remove_var("CONVEYOR_QUEUE_MODE");
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = JobsConfig::default();
        config.error_message_limit = 0;
        assert!(config.validate().is_err());

        let mut config = JobsConfig::default();
        config.worker_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
