//! Merging many objects into one
//!
//! Small inputs are downloaded and re-uploaded through an [`S3Writer`].
//! Larger ones are stitched together server-side with parallel
//! `UploadPartCopy` calls, after a premerge pass has folded every undersized
//! object (other than the last) into its successor.

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::{CopySource, ObjectInfo, ObjectStore, PartLimits, StorageError, UploadedPart};
use crate::streams::{pipe, S3Reader, S3Writer, S3WriterOptions, StreamError, Writer};

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("No objects found under s3://{bucket}/{prefix}")]
    NoSources { bucket: String, prefix: String },

    #[error("Cannot merge s3://{bucket}/{prefix} into one of its own inputs ({key})")]
    SelfMerge {
        bucket: String,
        prefix: String,
        key: String,
    },

    #[error("Merge needs {parts} parts, more than the limit of {limit}")]
    TooManyParts { parts: usize, limit: u32 },

    #[error("{failed} part copies failed; first error: {source}")]
    CopyFailed {
        failed: usize,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// The single source already is the destination.
    Unchanged,
    /// Sources were streamed through this process.
    Download,
    /// Sources were copied server-side.
    Multipart,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Unchanged => "unchanged",
            MergeStrategy::Download => "download",
            MergeStrategy::Multipart => "multipart",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    pub limits: PartLimits,
    /// Ranged GET size for the download path; 0 uses the reader default.
    pub read_block_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub strategy: MergeStrategy,
    pub bucket: String,
    pub key: String,
    pub sources: usize,
    pub size: u64,
    /// Parts of the destination upload (multipart only).
    pub parts: usize,
}

/// Merge every object under `src_bucket/src_prefix` into `dest_bucket/dest_key`.
#[instrument(skip(store, options))]
pub async fn merge_objects(
    store: Arc<dyn ObjectStore>,
    src_bucket: &str,
    src_prefix: &str,
    dest_bucket: &str,
    dest_key: &str,
    options: MergeOptions,
) -> Result<MergeOutcome, MergeError> {
    let sources = store.list(src_bucket, src_prefix).await?;
    if sources.is_empty() {
        return Err(MergeError::NoSources {
            bucket: src_bucket.to_string(),
            prefix: src_prefix.to_string(),
        });
    }

    let total: u64 = sources.iter().map(|o| o.size).sum();
    let outcome = |strategy, parts| MergeOutcome {
        strategy,
        bucket: dest_bucket.to_string(),
        key: dest_key.to_string(),
        sources: sources.len(),
        size: total,
        parts,
    };

    if src_bucket == dest_bucket {
        if sources.len() == 1 && sources[0].key == dest_key {
            return Ok(outcome(MergeStrategy::Unchanged, 0));
        }
        if sources.len() > 1 && (src_prefix == dest_key || sources.iter().any(|o| o.key == dest_key)) {
            return Err(MergeError::SelfMerge {
                bucket: src_bucket.to_string(),
                prefix: src_prefix.to_string(),
                key: dest_key.to_string(),
            });
        }
    }

    if total == 0 {
        store.put(dest_bucket, dest_key, bytes::Bytes::new()).await?;
        return Ok(outcome(MergeStrategy::Download, 0));
    }

    let bound = sources.len() as u64 * options.limits.min_part_size;
    info!(
        sources = sources.len(),
        total,
        bound,
        "Merging objects"
    );

    if total <= bound {
        download_merge(&store, src_bucket, &sources, dest_bucket, dest_key, &options).await?;
        return Ok(outcome(MergeStrategy::Download, 0));
    }

    let premerged = premerge(&store, src_bucket, sources.clone(), &options).await?;
    let parts = multipart_merge(&store, src_bucket, &premerged, dest_bucket, dest_key, &options).await?;
    Ok(outcome(MergeStrategy::Multipart, parts))
}

/// Stream `objects` through this process into one new object.
pub async fn download_merge(
    store: &Arc<dyn ObjectStore>,
    src_bucket: &str,
    objects: &[ObjectInfo],
    dest_bucket: &str,
    dest_key: &str,
    options: &MergeOptions,
) -> Result<(), MergeError> {
    let expected: u64 = objects.iter().map(|o| o.size).sum();
    let mut reader = S3Reader::for_objects(
        Arc::clone(store),
        src_bucket,
        objects.to_vec(),
        options.read_block_size,
    );
    let mut writer = S3Writer::create(
        Arc::clone(store),
        dest_bucket,
        dest_key,
        S3WriterOptions {
            expected_size: Some(expected),
            limits: options.limits,
        },
    )
    .await?;

    if let Err(e) = pipe(&mut reader, &mut writer).await {
        if let Err(abort) = writer.abort().await {
            warn!(key = dest_key, error = %abort, "Failed to abort merge upload");
        }
        return Err(e.into());
    }
    writer.close().await?;
    Ok(())
}

/// Fold every undersized object except the last into its successor.
/// Empty objects are dropped; every other byte is kept.
///
/// The merged object is written next to the successor as `<successor>_merged`
/// and both originals are deleted. The result is in source order and every
/// entry but the last is at least `min_part_size` bytes.
pub async fn premerge(
    store: &Arc<dyn ObjectStore>,
    bucket: &str,
    objects: Vec<ObjectInfo>,
    options: &MergeOptions,
) -> Result<Vec<ObjectInfo>, MergeError> {
    let mut queue: VecDeque<ObjectInfo> = objects.into_iter().filter(|o| o.size > 0).collect();
    let mut ready = Vec::with_capacity(queue.len());

    while let Some(object) = queue.pop_front() {
        if object.size >= options.limits.min_part_size || queue.is_empty() {
            ready.push(object);
            continue;
        }
        let Some(next) = queue.pop_front() else {
            break;
        };

        let merged = ObjectInfo {
            key: format!("{}_merged", next.key),
            size: object.size + next.size,
        };
        debug!(
            first = %object.key,
            second = %next.key,
            merged = %merged.key,
            "Premerging undersized object"
        );

        let pair = [object, next];
        download_merge(store, bucket, &pair, bucket, &merged.key, options).await?;
        for original in &pair {
            store.delete(bucket, &original.key).await?;
        }
        queue.push_front(merged);
    }

    Ok(ready)
}

/// Split an object of `size` bytes into inclusive copy ranges.
///
/// Ranges are at most `max_copy_part_size`. When the tail would fall below
/// `min_part_size`, the last full range and the tail are split into two
/// halves instead.
pub fn partition(size: u64, limits: &PartLimits) -> Vec<(u64, u64)> {
    let max = limits.max_copy_part_size;
    if size == 0 {
        return Vec::new();
    }
    if size <= max {
        return vec![(0, size - 1)];
    }

    let mut ranges = Vec::new();
    let mut pos = 0;
    while size - pos > max {
        ranges.push((pos, pos + max - 1));
        pos += max;
    }
    let tail = size - pos;

    if tail < limits.min_part_size {
        if let Some((start, _)) = ranges.pop() {
            let span = size - start;
            let half = span / 2;
            ranges.push((start, start + half - 1));
            ranges.push((start + half, size - 1));
            return ranges;
        }
    }
    ranges.push((pos, size - 1));
    ranges
}

async fn multipart_merge(
    store: &Arc<dyn ObjectStore>,
    src_bucket: &str,
    objects: &[ObjectInfo],
    dest_bucket: &str,
    dest_key: &str,
    options: &MergeOptions,
) -> Result<usize, MergeError> {
    let mut copies = Vec::new();
    for object in objects {
        for (start, end) in partition(object.size, &options.limits) {
            copies.push(CopySource {
                bucket: src_bucket.to_string(),
                key: object.key.clone(),
                start,
                end,
            });
        }
    }
    if copies.len() > options.limits.max_parts as usize {
        return Err(MergeError::TooManyParts {
            parts: copies.len(),
            limit: options.limits.max_parts,
        });
    }

    let upload = store.create_multipart(dest_bucket, dest_key).await?;
    let mut tasks = JoinSet::new();
    for (idx, source) in copies.into_iter().enumerate() {
        let store = Arc::clone(store);
        let upload = upload.clone();
        let part_number = idx as i32 + 1;
        tasks.spawn(async move { store.upload_part_copy(&upload, part_number, &source).await });
    }

    let mut parts: Vec<UploadedPart> = Vec::new();
    let mut errors: Vec<StorageError> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(part)) => parts.push(part),
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(StorageError::InvalidUpload(format!("copy task failed: {e}"))),
        }
    }

    if !errors.is_empty() {
        let failed = errors.len();
        warn!(failed, key = dest_key, "Part copies failed, aborting merge upload");
        if let Err(abort) = store.abort_multipart(&upload).await {
            warn!(key = dest_key, error = %abort, "Failed to abort merge upload");
        }
        let source = errors.swap_remove(0);
        return Err(MergeError::CopyFailed { failed, source });
    }

    parts.sort_by_key(|p| p.part_number);
    let count = parts.len();
    if let Err(e) = store.complete_multipart(&upload, parts).await {
        if let Err(abort) = store.abort_multipart(&upload).await {
            warn!(key = dest_key, error = %abort, "Failed to abort merge upload");
        }
        return Err(e.into());
    }
    Ok(count)
}
