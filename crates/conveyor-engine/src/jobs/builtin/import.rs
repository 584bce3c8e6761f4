//! Load a CSV object into a new table

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

use super::S3Location;
use crate::db::{quote_identifier, quote_qualified};
use crate::jobs::{Job, JobContext};
use crate::storage::{ObjectStore, StorageConfig};
use crate::streams::{
    pipe, CopyWriter, CsvOptions, CsvReader, CsvWriter, GzipReader, HeaderMode, InsertWriter,
    Reader, S3Reader, StreamResult, Writer,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ImportDbOptions {
    pub table: String,
    #[serde(default)]
    pub dropifexists: bool,
    /// Bulk load with `COPY ... FROM STDIN` instead of row-wise inserts.
    #[serde(default)]
    pub copy: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportOptions {
    pub db: ImportDbOptions,
    #[serde(default)]
    pub s3: S3Location,
    #[serde(default)]
    pub csv: CsvOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub table: String,
    pub rows: u64,
}

type ByteSource = Box<dyn Reader<Item = Bytes>>;

pub struct ImportJob {
    pool: PgPool,
    store: Arc<dyn ObjectStore>,
    default_bucket: Option<String>,
    read_block_size: u64,
}

impl ImportJob {
    pub fn new(pool: PgPool, store: Arc<dyn ObjectStore>, storage: &StorageConfig) -> Self {
        Self {
            pool,
            store,
            default_bucket: storage.default_bucket.clone(),
            read_block_size: storage.read_block_size,
        }
    }

    async fn open_source(&self, bucket: &str, key: &str) -> StreamResult<ByteSource> {
        let reader = S3Reader::open(self.store.clone(), bucket, key, self.read_block_size).await?;
        if key.ends_with(".gz") {
            Ok(Box::new(GzipReader::new(reader)))
        } else {
            Ok(Box::new(reader))
        }
    }

    async fn create_table(&self, table: &str, columns: &[String], drop: bool) -> anyhow::Result<()> {
        let table = quote_qualified(table);
        if drop {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&self.pool)
                .await?;
        }
        let columns: Vec<String> = columns
            .iter()
            .map(|c| format!("{} VARCHAR", quote_identifier(c)))
            .collect();
        sqlx::query(&format!("CREATE TABLE {table} ({})", columns.join(", ")))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_rows<R>(&self, rows: &mut R, table: &str, columns: &[String]) -> anyhow::Result<u64>
    where
        R: Reader<Item = Vec<String>>,
    {
        let mut writer = InsertWriter::begin(&self.pool, table, columns).await?;
        if let Err(e) = pipe(rows, &mut writer).await {
            if let Err(abort) = writer.abort().await {
                warn!(table, error = %abort, "Failed to roll back import");
            }
            return Err(e.into());
        }
        writer.close().await?;
        Ok(writer.rows())
    }

    async fn copy_rows<R>(
        &self,
        rows: &mut R,
        table: &str,
        columns: &[String],
        col_sep: char,
    ) -> anyhow::Result<u64>
    where
        R: Reader<Item = Vec<String>>,
    {
        let options = CsvOptions::default()
            .with_col_sep(col_sep)
            .with_headers(HeaderMode::Explicit(columns.to_vec()));
        options.validate()?;
        let copy = CopyWriter::begin(&self.pool, table, columns, col_sep).await?;
        let mut writer = CsvWriter::new(copy, options)?;

        if let Err(e) = pipe(rows, &mut writer).await {
            if let Err(abort) = writer.get_mut().abort(&e.to_string()).await {
                warn!(table, error = %abort, "Failed to abort COPY");
            }
            return Err(e.into());
        }
        writer.close().await?;
        Ok(writer.get_ref().rows())
    }
}

#[async_trait]
impl Job for ImportJob {
    const NAME: &'static str = "import";
    type Output = ImportResult;

    async fn execute(&self, ctx: &mut JobContext) -> anyhow::Result<ImportResult> {
        let options: ImportOptions = ctx.parse_options()?;
        let table = options.db.table.clone();
        if table.trim().is_empty() {
            anyhow::bail!("No table given");
        }
        let bucket = options.s3.bucket_or(self.default_bucket.as_deref())?;
        let key = options
            .s3
            .key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No S3 key given"))?;
        info!(bucket = %bucket, key = %key, table = %table, copy = options.db.copy, "Importing CSV");

        let mut csv = options.csv;
        csv.return_headers = false;
        if csv.headers == HeaderMode::None {
            csv.headers = HeaderMode::FirstRow;
        }

        let source = self.open_source(&bucket, &key).await?;
        let mut reader = CsvReader::sniffed(source, csv).await?;
        let columns = match reader.headers().await? {
            Some(columns) if !columns.is_empty() => columns,
            _ => {
                reader.close().await?;
                anyhow::bail!("No CSV headers!");
            },
        };

        self.create_table(&table, &columns, options.db.dropifexists).await?;

        let loaded = if options.db.copy {
            let col_sep = reader.col_sep();
            self.copy_rows(&mut reader, &table, &columns, col_sep).await
        } else {
            self.insert_rows(&mut reader, &table, &columns).await
        };
        if let Err(e) = reader.close().await {
            warn!(bucket = %bucket, key = %key, error = %e, "Failed to close import source");
        }
        let rows = loaded?;

        info!(table = %table, rows, "Import finished");
        Ok(ImportResult { table, rows })
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

    async fn engine(store: Arc<MemoryStore>) -> JobEngine {
        let pool = PgPool::connect_lazy("postgresql://localhost/test").unwrap();
        let job = ImportJob::new(pool, store, &StorageConfig::default());
        JobEngine::builder(Arc::new(MemoryRunStore::new()))
            .config(JobsConfig::inline())
            .register(job)
            .build()
            .unwrap()
    }

    #[test]
    fn test_options_parse() {
        let options: ImportOptions = serde_json::from_value(json!({
            "db": { "table": "public.people", "copy": true },
            "s3": { "bucket": "in", "key": "people.csv.gz" },
            "csv": { "headers": ["a", "b"] }
        }))
        .unwrap();

        assert_eq!(options.db.table, "public.people");
        assert!(options.db.copy);
        assert!(!options.db.dropifexists);
        assert_eq!(
            options.csv.headers,
            HeaderMode::Explicit(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[tokio::test]
    async fn test_missing_key_fails() {
        let engine = engine(Arc::new(MemoryStore::default())).await;

        let run = engine
            .enqueue("import", "1", "2", json!({ "db": { "table": "t" }, "s3": { "bucket": "in" } }))
            .await
            .unwrap()
            .into_run();

        assert!(run.is_failed());
        assert_eq!(run.error(), Some("No S3 key given"));
    }

    #[tokio::test]
    async fn test_missing_object_fails() {
        let engine = engine(Arc::new(MemoryStore::default())).await;

        let run = engine
            .enqueue(
                "import",
                "1",
                "2",
                json!({ "db": { "table": "t" }, "s3": { "bucket": "in", "key": "nope.csv" } }),
            )
            .await
            .unwrap()
            .into_run();

        assert!(run.is_failed());
        assert_eq!(run.details["error_type"], "StreamError");
    }

    #[tokio::test]
    async fn test_empty_object_has_no_headers() {
        let store = Arc::new(MemoryStore::default());
        store.insert("in", "empty.csv", Bytes::new()).await;
        let engine = engine(store).await;

        let run = engine
            .enqueue(
                "import",
                "1",
                "2",
                json!({ "db": { "table": "t" }, "s3": { "bucket": "in", "key": "empty.csv" } }),
            )
            .await
            .unwrap()
            .into_run();

        assert!(run.is_failed());
        assert_eq!(run.error(), Some("No CSV headers!"));
    }
}
