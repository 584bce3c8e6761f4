//! Merge every object under a prefix into one object

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::jobs::{Job, JobContext};
use crate::storage::merge::{merge_objects, MergeOptions};
use crate::storage::{ObjectStore, PartLimits, StorageConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct MergeSource {
    pub bucket: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeDestination {
    /// Defaults to the source bucket.
    pub bucket: Option<String>,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeJobOptions {
    pub src: MergeSource,
    pub dest: MergeDestination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub bucket: String,
    pub key: String,
    pub strategy: String,
    pub sources: usize,
    pub size: u64,
}

pub struct MergeJob {
    store: Arc<dyn ObjectStore>,
    limits: PartLimits,
    read_block_size: u64,
}

impl MergeJob {
    pub fn new(store: Arc<dyn ObjectStore>, storage: &StorageConfig) -> Self {
        Self {
            store,
            limits: storage.limits,
            read_block_size: storage.read_block_size,
        }
    }
}

#[async_trait]
impl Job for MergeJob {
    const NAME: &'static str = "merge";
    type Output = MergeResult;

    async fn execute(&self, ctx: &mut JobContext) -> anyhow::Result<MergeResult> {
        let options: MergeJobOptions = ctx.parse_options()?;
        let dest_bucket = options
            .dest
            .bucket
            .unwrap_or_else(|| options.src.bucket.clone());

        let outcome = merge_objects(
            self.store.clone(),
            &options.src.bucket,
            &options.src.prefix,
            &dest_bucket,
            &options.dest.key,
            MergeOptions {
                limits: self.limits,
                read_block_size: self.read_block_size,
            },
        )
        .await?;

        info!(
            bucket = %outcome.bucket,
            key = %outcome.key,
            strategy = outcome.strategy.as_str(),
            sources = outcome.sources,
            "Merge finished"
        );
        Ok(MergeResult {
            bucket: outcome.bucket,
            key: outcome.key,
            strategy: outcome.strategy.as_str().to_string(),
            sources: outcome.sources,
            size: outcome.size,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::jobs::{JobEngine, MemoryRunStore};
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn engine(store: Arc<MemoryStore>) -> JobEngine {
        JobEngine::builder(Arc::new(MemoryRunStore::new()))
            .config(JobsConfig::inline())
            .register(MergeJob::new(store, &StorageConfig::default()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_merges_small_objects() {
        let store = Arc::new(MemoryStore::default());
        store.insert("data", "parts/0", "a,1\n").await;
        store.insert("data", "parts/1", "b,2\n").await;
        let engine = engine(store.clone());

        let run = engine
            .enqueue(
                "merge",
                "9",
                "42",
                json!({ "src": { "bucket": "data", "prefix": "parts/" }, "dest": { "key": "all.csv" } }),
            )
            .await
            .unwrap()
            .into_run();

        assert!(run.is_done(), "{:?}", run.details);
        let result: MergeResult = serde_json::from_value(run.result().unwrap().clone()).unwrap();
        assert_eq!(result.bucket, "data");
        assert_eq!(result.strategy, "download");
        assert_eq!(result.sources, 2);
        assert_eq!(result.size, 8);
        assert_eq!(store.get("data", "all.csv").await.unwrap().as_ref(), b"a,1\nb,2\n");
    }

    #[tokio::test]
    async fn test_empty_prefix_fails() {
        let engine = engine(Arc::new(MemoryStore::default()));

        let run = engine
            .enqueue(
                "merge",
                "9",
                "42",
                json!({ "src": { "bucket": "data", "prefix": "none/" }, "dest": { "bucket": "out", "key": "x" } }),
            )
            .await
            .unwrap()
            .into_run();

        assert!(run.is_failed());
        assert_eq!(run.details["error_type"], "MergeError");
    }
}
