//! Export a query result to a CSV object

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::S3Location;
use crate::jobs::{Job, JobContext};
use crate::storage::{ObjectStore, PartLimits, StorageConfig};
use crate::streams::database::DEFAULT_FETCH_SIZE;
use crate::streams::{
    pipe, CsvGenerator, CsvOptions, CursorQuery, CursorReader, HeaderMode, Reader, S3Writer,
    S3WriterOptions, Writer,
};

/// Rows returned by [`ExportJob::preview`].
pub const PREVIEW_ROWS: usize = 100;

/// Column separator of exports that don't set one.
pub const EXPORT_COL_SEP: char = '|';

#[derive(Debug, Clone, Deserialize)]
pub struct ExportDbOptions {
    pub query: String,
    pub fetch_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportOptions {
    pub db: ExportDbOptions,
    #[serde(default)]
    pub s3: S3Location,
    #[serde(default)]
    pub csv: CsvOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    pub bucket: String,
    pub key: String,
}

/// Cursor names derived from caller ids; anything but `[A-Za-z0-9_]` is replaced.
fn cursor_name(parts: &[&str]) -> String {
    parts
        .join("_")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

pub struct ExportJob {
    pool: PgPool,
    store: Arc<dyn ObjectStore>,
    app_id: String,
    default_bucket: Option<String>,
    limits: PartLimits,
}

impl ExportJob {
    pub fn new(pool: PgPool, store: Arc<dyn ObjectStore>, app_id: &str, storage: &StorageConfig) -> Self {
        Self {
            pool,
            store,
            app_id: app_id.to_string(),
            default_bucket: storage.default_bucket.clone(),
            limits: storage.limits,
        }
    }

    /// Run the query and return its columns and first rows without
    /// exporting anything: `{columns, rows}`, or `{error}` if it fails.
    pub async fn preview(&self, user_id: &str, options: &Value) -> Value {
        info!(user_id, "Previewing export");
        match self.preview_rows(user_id, options).await {
            Ok((columns, rows)) => json!({ "columns": columns, "rows": rows }),
            Err(e) => {
                error!(user_id, error = %e, "Export preview failed");
                json!({ "error": e.to_string() })
            },
        }
    }

    async fn preview_rows(
        &self,
        user_id: &str,
        options: &Value,
    ) -> anyhow::Result<(Vec<String>, Vec<Vec<Option<String>>>)> {
        let db: ExportDbOptions = serde_json::from_value(
            options.get("db").cloned().unwrap_or_else(|| options.clone()),
        )?;
        let time = Utc::now().format("%Y_%m_%dT%H_%M_%S_%3fZ").to_string();
        let name = cursor_name(&[&self.app_id, "validate", user_id, &time]);
        let query = CursorQuery::new(&name, &db.query, db.fetch_size.unwrap_or(PREVIEW_ROWS))?;

        let mut cursor = CursorReader::open(&self.pool, query).await?;
        let fetched = async {
            let columns = cursor.columns().await?;
            let rows = cursor.read().await?.unwrap_or_default();
            Ok::<_, anyhow::Error>((columns, rows))
        }
        .await;
        if let Err(e) = cursor.close().await {
            warn!(cursor = %name, error = %e, "Failed to close preview cursor");
        }
        fetched
    }
}

#[async_trait]
impl Job for ExportJob {
    const NAME: &'static str = "export";
    type Output = ExportResult;

    async fn execute(&self, ctx: &mut JobContext) -> anyhow::Result<ExportResult> {
        let options: ExportOptions = ctx.parse_options()?;
        let bucket = options.s3.bucket_or(self.default_bucket.as_deref())?;
        let key = options
            .s3
            .key
            .clone()
            .unwrap_or_else(|| ctx.run().filename(&self.app_id));

        let name = cursor_name(&[&self.app_id, "export", ctx.job_id(), &ctx.run().id.to_string()]);
        let query = CursorQuery::new(
            &name,
            &options.db.query,
            options.db.fetch_size.unwrap_or(DEFAULT_FETCH_SIZE),
        )?;
        info!(bucket = %bucket, key = %key, cursor = %name, "Exporting query");

        let mut csv = options.csv;
        csv.col_sep.get_or_insert(EXPORT_COL_SEP);
        csv.validate()?;

        let mut cursor = CursorReader::open(&self.pool, query).await?;
        if csv.return_headers && csv.headers == HeaderMode::None {
            let columns = cursor.columns().await?;
            if !columns.is_empty() {
                csv.headers = HeaderMode::Explicit(columns);
            }
        }

        let mut rows = CsvGenerator::new(cursor, csv)?;
        let mut writer = S3Writer::create(
            self.store.clone(),
            &bucket,
            &key,
            S3WriterOptions {
                expected_size: None,
                limits: self.limits,
            },
        )
        .await?;

        let piped = pipe(&mut rows, &mut writer).await;
        let closed = rows.close().await;
        if let Err(e) = piped.map_err(anyhow::Error::from).and(closed.map_err(Into::into)) {
            if let Err(abort) = writer.abort().await {
                warn!(bucket = %bucket, key = %key, error = %abort, "Failed to abort export upload");
            }
            return Err(e);
        }

        writer.close().await?;
        if writer.bytes_written() == 0 {
            // An empty result still produces a (empty) file.
            self.store.put(&bucket, &key, Bytes::new()).await?;
        }

        info!(bucket = %bucket, key = %key, bytes = writer.bytes_written(), "Export finished");
        Ok(ExportResult { bucket, key })
    }
}
