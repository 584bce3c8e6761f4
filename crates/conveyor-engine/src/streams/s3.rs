//! Object store stream stages

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Reader, StreamError, StreamResult, Writer};
use crate::storage::config::DEFAULT_READ_BLOCK_SIZE;
use crate::storage::{MultipartUpload, ObjectInfo, ObjectStore, PartLimits, StorageError, UploadedPart};

/// Suffix of the marker objects some tools write next to a "directory".
pub const FOLDER_SUFFIX: &str = "_$folder$";

/// Reads one object, or every object behind a folder key, as a single byte
/// stream using ranged GETs of `block_size` bytes.
pub struct S3Reader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    block_size: u64,
    listed: bool,
    objects: Vec<ObjectInfo>,
    index: usize,
    offset: u64,
    consumed: u64,
    total: u64,
    closed: bool,
}

impl S3Reader {
    /// Open `bucket/key`.
    ///
    /// When objects exist under `key_$folder$` those are read in key order.
    /// Otherwise a key ending in `/` reads everything under that prefix, and
    /// any other key must name an existing object.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        key: &str,
        block_size: u64,
    ) -> StreamResult<Self> {
        let mut reader = Self::with_objects(store, bucket, key, Vec::new(), block_size);
        reader.listed = true;
        reader.resolve().await?;
        Ok(reader)
    }

    /// Read exactly `objects`, in the given order, without listing.
    pub fn for_objects(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        objects: Vec<ObjectInfo>,
        block_size: u64,
    ) -> Self {
        let key = objects.first().map(|o| o.key.clone()).unwrap_or_default();
        Self::with_objects(store, bucket, &key, objects, block_size)
    }

    fn with_objects(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        key: &str,
        objects: Vec<ObjectInfo>,
        block_size: u64,
    ) -> Self {
        let mut reader = Self {
            store,
            bucket: bucket.to_string(),
            key: key.to_string(),
            block_size: if block_size == 0 { DEFAULT_READ_BLOCK_SIZE } else { block_size },
            listed: false,
            objects: Vec::new(),
            index: 0,
            offset: 0,
            consumed: 0,
            total: 0,
            closed: false,
        };
        reader.reset(objects);
        reader
    }

    fn reset(&mut self, objects: Vec<ObjectInfo>) {
        self.objects = objects.into_iter().filter(|o| o.size > 0).collect();
        self.total = self.objects.iter().map(|o| o.size).sum();
        self.index = 0;
        self.offset = 0;
        self.consumed = 0;
        self.closed = false;
    }

    async fn resolve(&mut self) -> StreamResult<()> {
        let marker = format!("{}{}", self.key, FOLDER_SUFFIX);
        let mut objects = self.store.list(&self.bucket, &marker).await?;

        if objects.is_empty() {
            if self.key.ends_with('/') {
                objects = self.store.list(&self.bucket, &self.key).await?;
                if objects.is_empty() {
                    return Err(StorageError::not_found(&self.bucket, &self.key).into());
                }
            } else {
                let info = self
                    .store
                    .head(&self.bucket, &self.key)
                    .await?
                    .ok_or_else(|| StorageError::not_found(&self.bucket, &self.key))?;
                objects.push(info);
            }
        }

        debug!(
            bucket = %self.bucket,
            key = %self.key,
            objects = objects.len(),
            "Resolved S3 read source"
        );
        self.reset(objects);
        Ok(())
    }

    pub fn objects(&self) -> &[ObjectInfo] {
        &self.objects
    }

    /// Total bytes across all objects.
    pub fn size(&self) -> u64 {
        self.total
    }

    pub fn position(&self) -> u64 {
        self.consumed
    }
}

#[async_trait]
impl Reader for S3Reader {
    type Item = Bytes;

    async fn read(&mut self) -> StreamResult<Option<Bytes>> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        while self.index < self.objects.len() && self.offset >= self.objects[self.index].size {
            self.index += 1;
            self.offset = 0;
        }
        let Some(object) = self.objects.get(self.index) else {
            return Ok(None);
        };

        let end = (self.offset + self.block_size - 1).min(object.size - 1);
        let data = self
            .store
            .get_range(&self.bucket, &object.key, self.offset, end)
            .await?;
        if data.is_empty() {
            return Err(StorageError::InvalidRange {
                bucket: self.bucket.clone(),
                key: object.key.clone(),
                start: self.offset,
                end,
            }
            .into());
        }

        self.offset += data.len() as u64;
        self.consumed += data.len() as u64;
        Ok(Some(data))
    }

    fn eof(&self) -> bool {
        self.consumed >= self.total
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.closed = true;
        Ok(())
    }

    async fn rewind(&mut self) -> StreamResult<()> {
        if self.listed {
            self.resolve().await
        } else {
            let objects = std::mem::take(&mut self.objects);
            self.reset(objects);
            Ok(())
        }
    }
}

/// Sizing for [`S3Writer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct S3WriterOptions {
    /// Upper bound of the final object size, if known. Large hints raise the
    /// part size so the upload stays within the part-count limit.
    pub expected_size: Option<u64>,
    pub limits: PartLimits,
}

impl S3WriterOptions {
    /// Bytes buffered before a part is uploaded.
    pub fn chunk_size(&self) -> u64 {
        let derived = self
            .expected_size
            .map(|size| size.div_ceil(u64::from(self.limits.max_parts.max(1))))
            .unwrap_or(0);
        derived.max(self.limits.min_part_size)
    }
}

/// Streams bytes into a multipart upload.
///
/// The upload is created up front. Closing a writer that never produced a
/// part aborts the upload, so no object is created.
pub struct S3Writer {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    options: S3WriterOptions,
    chunk_size: usize,
    upload: Option<MultipartUpload>,
    buffer: BytesMut,
    parts: Vec<UploadedPart>,
    next_part: i32,
    bytes_written: u64,
}

impl S3Writer {
    pub async fn create(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        key: &str,
        options: S3WriterOptions,
    ) -> StreamResult<Self> {
        let upload = store.create_multipart(bucket, key).await?;
        debug!(bucket, key, upload_id = %upload.upload_id, "Started multipart upload");
        Ok(Self {
            store,
            bucket: bucket.to_string(),
            key: key.to_string(),
            chunk_size: usize::try_from(options.chunk_size()).unwrap_or(usize::MAX),
            options,
            upload: Some(upload),
            buffer: BytesMut::new(),
            parts: Vec::new(),
            next_part: 1,
            bytes_written: 0,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn parts(&self) -> &[UploadedPart] {
        &self.parts
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_open(&self) -> bool {
        self.upload.is_some()
    }

    async fn upload_buffer(&mut self) -> StreamResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let upload = self.upload.as_ref().ok_or(StreamError::Closed)?;
        let data = self.buffer.split().freeze();
        let part = self.store.upload_part(upload, self.next_part, data).await?;
        self.parts.push(part);
        self.next_part += 1;
        Ok(())
    }

    /// Abort the upload and discard everything written.
    pub async fn abort(&mut self) -> StreamResult<()> {
        self.buffer.clear();
        self.parts.clear();
        if let Some(upload) = self.upload.take() {
            self.store.abort_multipart(&upload).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Writer for S3Writer {
    type Item = Bytes;

    async fn write(&mut self, data: Bytes) -> StreamResult<()> {
        if self.upload.is_none() {
            return Err(StreamError::Closed);
        }
        self.bytes_written += data.len() as u64;
        self.buffer.extend_from_slice(&data);
        if self.buffer.len() > self.chunk_size {
            self.upload_buffer().await?;
        }
        Ok(())
    }

    /// Uploads the buffer only once it is large enough to be a non-final part.
    async fn flush(&mut self) -> StreamResult<()> {
        if self.buffer.len() as u64 >= self.options.limits.min_part_size {
            self.upload_buffer().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        if self.upload.is_none() {
            return Ok(());
        }
        self.upload_buffer().await?;

        let Some(upload) = self.upload.take() else {
            return Ok(());
        };
        if self.parts.is_empty() {
            debug!(bucket = %self.bucket, key = %self.key, "Aborting upload without parts");
            self.store.abort_multipart(&upload).await?;
            return Ok(());
        }

        let count = self.parts.len();
        if let Err(e) = self.store.complete_multipart(&upload, self.parts.clone()).await {
            if let Err(abort) = self.store.abort_multipart(&upload).await {
                warn!(key = %self.key, error = %abort, "Failed to abort upload after completion error");
            }
            return Err(e.into());
        }

        info!(
            bucket = %self.bucket,
            key = %self.key,
            parts = count,
            bytes = self.bytes_written,
            "S3 upload finished"
        );
        Ok(())
    }

    async fn rewind(&mut self) -> StreamResult<()> {
        self.abort().await?;
        self.upload = Some(self.store.create_multipart(&self.bucket, &self.key).await?);
        self.next_part = 1;
        self.bytes_written = 0;
        Ok(())
    }
}

impl Drop for S3Writer {
    fn drop(&mut self) {
        let Some(upload) = self.upload.take() else {
            return;
        };
        warn!(bucket = %self.bucket, key = %self.key, "S3 writer dropped while open, aborting upload");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            handle.spawn(async move {
                if let Err(e) = store.abort_multipart(&upload).await {
                    warn!(key = %upload.key, error = %e, "Abort of dropped upload failed");
                }
            });
        }
    }
}
