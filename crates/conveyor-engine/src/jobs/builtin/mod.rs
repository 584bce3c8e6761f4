//! Jobs shipped with the worker
//!
//! - [`ExportJob`]: query result to a CSV object
//! - [`ImportJob`]: CSV object to a new table
//! - [`MergeJob`]: many objects under a prefix to one object

use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;

use super::engine::JobEngineBuilder;
use crate::storage::{ObjectStore, StorageConfig};

pub mod export;
pub mod import;
pub mod merge;

pub use export::{ExportJob, ExportResult};
pub use import::{ImportJob, ImportResult};
pub use merge::{MergeJob, MergeResult};

/// `s3` section shared by the export and import options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct S3Location {
    pub bucket: Option<String>,
    pub key: Option<String>,
}

impl S3Location {
    /// The bucket, falling back to the configured default.
    pub fn bucket_or(&self, default: Option<&str>) -> anyhow::Result<String> {
        self.bucket
            .as_deref()
            .or(default)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("No S3 bucket given"))
    }
}

/// Register export, import and merge.
pub fn register_builtin(
    builder: JobEngineBuilder,
    pool: &PgPool,
    store: Arc<dyn ObjectStore>,
    app_id: &str,
    storage: &StorageConfig,
) -> JobEngineBuilder {
    builder
        .register(ExportJob::new(pool.clone(), store.clone(), app_id, storage))
        .register(ImportJob::new(pool.clone(), store.clone(), storage))
        .register(MergeJob::new(store, storage))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_fallback() {
        let location = S3Location::default();
        assert_eq!(location.bucket_or(Some("exports")).unwrap(), "exports");
        assert!(location.bucket_or(None).is_err());

        let location = S3Location {
            bucket: Some("mine".to_string()),
            key: None,
        };
        assert_eq!(location.bucket_or(Some("exports")).unwrap(), "mine");

        let location = S3Location {
            bucket: Some(String::new()),
            key: None,
        };
        assert!(location.bucket_or(None).is_err());
    }
}
