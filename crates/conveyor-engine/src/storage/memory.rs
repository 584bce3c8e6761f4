//! In-process object store
//!
//! Behaves like S3 where the pipeline and the merge algorithm can tell the
//! difference: inclusive ranges, sorted listings, and multipart completion
//! that rejects empty part lists, out-of-order parts and undersized
//! non-final parts.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::config::MIN_PART_SIZE;
use super::{
    CopySource, MultipartUpload, ObjectInfo, ObjectStore, StorageError, StorageResult,
    UploadedPart,
};

#[derive(Default)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String), Bytes>,
    uploads: HashMap<String, PendingUpload>,
    failing_sources: HashSet<String>,
    next_upload: u64,
}

pub struct MemoryStore {
    state: Mutex<State>,
    min_part_size: u64,
    copies: AtomicUsize,
    uploads_started: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MIN_PART_SIZE)
    }
}

fn etag(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

impl MemoryStore {
    /// A store enforcing `min_part_size` for every part but the last.
    pub fn new(min_part_size: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            min_part_size,
            copies: AtomicUsize::new(0),
            uploads_started: AtomicUsize::new(0),
        }
    }

    pub async fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut state = self.state.lock().await;
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let state = self.state.lock().await;
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Make every part copy reading from `key` fail.
    pub async fn fail_copies_from(&self, key: &str) {
        self.state.lock().await.failing_sources.insert(key.to_string());
    }

    /// Multipart uploads neither completed nor aborted.
    pub async fn open_uploads(&self) -> usize {
        self.state.lock().await.uploads.len()
    }

    /// Number of server-side part copies performed.
    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn uploads_started(&self) -> usize {
        self.uploads_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectInfo>> {
        Ok(self.get(bucket, key).await.map(|data| ObjectInfo {
            key: key.to_string(),
            size: data.len() as u64,
        }))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), data)| ObjectInfo {
                key: k.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn get_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        let data = self
            .get(bucket, key)
            .await
            .ok_or_else(|| StorageError::not_found(bucket, key))?;
        if start > end || start >= data.len() as u64 {
            return Err(StorageError::InvalidRange {
                bucket: bucket.to_string(),
                key: key.to_string(),
                start,
                end,
            });
        }
        let end = end.min(data.len() as u64 - 1);
        Ok(data.slice(start as usize..=end as usize))
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
        self.insert(bucket, key, data).await;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn create_multipart(&self, bucket: &str, key: &str) -> StorageResult<MultipartUpload> {
        let mut state = self.state.lock().await;
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        self.uploads_started.fetch_add(1, Ordering::SeqCst);

        Ok(MultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<UploadedPart> {
        let mut state = self.state.lock().await;
        let pending = state
            .uploads
            .get_mut(&upload.upload_id)
            .ok_or_else(|| StorageError::InvalidUpload(format!("unknown upload {}", upload.upload_id)))?;

        let tag = etag(&data);
        pending.parts.insert(part_number, (tag.clone(), data));
        Ok(UploadedPart {
            part_number,
            etag: tag,
        })
    }

    async fn upload_part_copy(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        source: &CopySource,
    ) -> StorageResult<UploadedPart> {
        // Let concurrent copies interleave like real network calls would.
        tokio::task::yield_now().await;

        let mut state = self.state.lock().await;
        if state.failing_sources.contains(&source.key) {
            return Err(StorageError::Sdk {
                operation: "UploadPartCopy",
                bucket: source.bucket.clone(),
                key: source.key.clone(),
                message: "injected copy failure".to_string(),
            });
        }

        let data = state
            .objects
            .get(&(source.bucket.clone(), source.key.clone()))
            .ok_or_else(|| StorageError::not_found(&source.bucket, &source.key))?;
        if source.start > source.end || source.end >= data.len() as u64 {
            return Err(StorageError::InvalidRange {
                bucket: source.bucket.clone(),
                key: source.key.clone(),
                start: source.start,
                end: source.end,
            });
        }
        let slice = data.slice(source.start as usize..=source.end as usize);

        let pending = state
            .uploads
            .get_mut(&upload.upload_id)
            .ok_or_else(|| StorageError::InvalidUpload(format!("unknown upload {}", upload.upload_id)))?;
        let tag = etag(&slice);
        pending.parts.insert(part_number, (tag.clone(), slice));
        self.copies.fetch_add(1, Ordering::SeqCst);

        Ok(UploadedPart {
            part_number,
            etag: tag,
        })
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: Vec<UploadedPart>,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let pending = state
            .uploads
            .get(&upload.upload_id)
            .ok_or_else(|| StorageError::InvalidUpload(format!("unknown upload {}", upload.upload_id)))?;

        if parts.is_empty() {
            return Err(StorageError::InvalidUpload("no parts to complete".to_string()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StorageError::InvalidUpload(
                "parts are not in ascending order".to_string(),
            ));
        }

        let mut body = BytesMut::new();
        for (idx, part) in parts.iter().enumerate() {
            let (tag, data) = pending.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::InvalidUpload(format!("part {} was never uploaded", part.part_number))
            })?;
            if *tag != part.etag {
                return Err(StorageError::InvalidUpload(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            if idx + 1 < parts.len() && (data.len() as u64) < self.min_part_size {
                return Err(StorageError::InvalidUpload(format!(
                    "part {} is smaller than {} bytes",
                    part.part_number, self.min_part_size
                )));
            }
            body.extend_from_slice(data);
        }

        let object = (pending.bucket.clone(), pending.key.clone());
        state.uploads.remove(&upload.upload_id);
        state.objects.insert(object, body.freeze());
        Ok(())
    }

    async fn abort_multipart(&self, upload: &MultipartUpload) -> StorageResult<()> {
        self.state.lock().await.uploads.remove(&upload.upload_id);
        Ok(())
    }
}
