//! Object store access
//!
//! [`ObjectStore`] is the narrow set of operations the pipeline and the merge
//! algorithm need: ranged reads, listing, simple put/delete and the five
//! multipart calls. [`S3Store`] talks to S3 (or MinIO) through the AWS SDK;
//! [`MemoryStore`] keeps everything in process for tests.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod config;
pub mod memory;
pub mod merge;

pub use config::{PartLimits, StorageConfig};
pub use memory::MemoryStore;
pub use merge::{merge_objects, MergeError, MergeOptions, MergeOutcome, MergeStrategy};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 {operation} failed for s3://{bucket}/{key}: {message}")]
    Sdk {
        operation: &'static str,
        bucket: String,
        key: String,
        message: String,
    },

    #[error("s3://{bucket}/{key} does not exist")]
    NotFound { bucket: String, key: String },

    #[error("Invalid multipart upload: {0}")]
    InvalidUpload(String),

    #[error("Invalid byte range {start}-{end} for s3://{bucket}/{key}")]
    InvalidRange {
        bucket: String,
        key: String,
        start: u64,
        end: u64,
    },
}

impl StorageError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    fn sdk<'a, E>(
        operation: &'static str,
        bucket: &'a str,
        key: &'a str,
    ) -> impl FnOnce(E) -> Self + 'a
    where
        E: std::error::Error,
    {
        move |e| Self::Sdk {
            operation,
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: DisplayErrorContext(&e).to_string(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One listed or inspected object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// An open multipart upload. Owned by exactly one writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// A finished part: what `complete_multipart` needs to stitch the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Inclusive byte range of an existing object, used as a copy source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    pub bucket: String,
    pub key: String,
    pub start: u64,
    pub end: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Size of an object, or `None` if it does not exist.
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectInfo>>;

    /// Every object under `prefix`, sorted by key.
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<ObjectInfo>>;

    /// Bytes `start..=end` of an object.
    async fn get_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> StorageResult<Bytes>;

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()>;

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    async fn create_multipart(&self, bucket: &str, key: &str) -> StorageResult<MultipartUpload>;

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<UploadedPart>;

    /// Server-side copy of `source` into part `part_number`.
    async fn upload_part_copy(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        source: &CopySource,
    ) -> StorageResult<UploadedPart>;

    /// Finish the upload; `parts` must be in ascending part-number order.
    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: Vec<UploadedPart>,
    ) -> StorageResult<()>;

    async fn abort_multipart(&self, upload: &MultipartUpload) -> StorageResult<()>;
}

/// S3-compatible store backed by the AWS SDK.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> Self {
        debug!(endpoint = ?config.endpoint, region = %config.region, "Initializing S3 client");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "conveyor-storage",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version_latest()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(region = %config.region, "S3 client initialized");

        Self {
            client: Client::from_conf(builder.build()),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn byte_range(start: u64, end: u64) -> String {
    format!("bytes={start}-{end}")
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectInfo>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
            })),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(None),
            Err(e) => Err(StorageError::sdk("HeadObject", bucket, key)(e)),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(StorageError::sdk("ListObjectsV2", bucket, prefix))?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectInfo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                })
            }));

            match response.next_continuation_token() {
                Some(next) if response.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                },
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(count = objects.len(), "Listed objects");
        Ok(objects)
    }

    async fn get_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(byte_range(start, end))
            .send()
            .await
            .map_err(StorageError::sdk("GetObject", bucket, key))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(StorageError::sdk("GetObject", bucket, key))?
            .into_bytes();
        Ok(data)
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(StorageError::sdk("PutObject", bucket, key))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(StorageError::sdk("DeleteObject", bucket, key))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_multipart(&self, bucket: &str, key: &str) -> StorageResult<MultipartUpload> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(StorageError::sdk("CreateMultipartUpload", bucket, key))?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| StorageError::InvalidUpload("no upload id returned".to_string()))?;

        Ok(MultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        })
    }

    #[instrument(skip(self, upload, data), fields(key = %upload.key, size = data.len()))]
    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<UploadedPart> {
        let response = self
            .client
            .upload_part()
            .bucket(&upload.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(StorageError::sdk("UploadPart", &upload.bucket, &upload.key))?;

        Ok(UploadedPart {
            part_number,
            etag: response.e_tag().unwrap_or_default().to_string(),
        })
    }

    #[instrument(skip(self, upload), fields(key = %upload.key))]
    async fn upload_part_copy(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        source: &CopySource,
    ) -> StorageResult<UploadedPart> {
        let response = self
            .client
            .upload_part_copy()
            .bucket(&upload.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .copy_source(format!("{}/{}", source.bucket, source.key))
            .copy_source_range(byte_range(source.start, source.end))
            .send()
            .await
            .map_err(StorageError::sdk("UploadPartCopy", &source.bucket, &source.key))?;

        let etag = response
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .unwrap_or_default()
            .to_string();
        Ok(UploadedPart { part_number, etag })
    }

    #[instrument(skip(self, upload, parts), fields(key = %upload.key, parts = parts.len()))]
    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: Vec<UploadedPart>,
    ) -> StorageResult<()> {
        let completed: Vec<CompletedPart> = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&upload.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(StorageError::sdk("CompleteMultipartUpload", &upload.bucket, &upload.key))?;

        info!(bucket = %upload.bucket, key = %upload.key, "Multipart upload completed");
        Ok(())
    }

    #[instrument(skip(self, upload), fields(key = %upload.key))]
    async fn abort_multipart(&self, upload: &MultipartUpload) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&upload.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .send()
            .await
            .map_err(StorageError::sdk("AbortMultipartUpload", &upload.bucket, &upload.key))?;
        Ok(())
    }
}
