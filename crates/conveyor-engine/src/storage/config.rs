use serde::{Deserialize, Serialize};
use std::env;

/// Smallest part S3 accepts, except for the last part of an upload.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Largest byte range a single `UploadPartCopy` may copy.
pub const MAX_COPY_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
/// Maximum number of parts in one multipart upload.
pub const MAX_PARTS: u32 = 10_000;
/// Size of one ranged GET issued by `S3Reader`.
pub const DEFAULT_READ_BLOCK_SIZE: u64 = 1024 * 1024;

/// Provider limits for multipart uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartLimits {
    pub min_part_size: u64,
    pub max_copy_part_size: u64,
    pub max_parts: u32,
}

impl Default for PartLimits {
    fn default() -> Self {
        Self {
            min_part_size: MIN_PART_SIZE,
            max_copy_part_size: MAX_COPY_PART_SIZE,
            max_parts: MAX_PARTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    /// Bucket used when a job does not name one.
    pub default_bucket: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
    pub limits: PartLimits,
    pub read_block_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            default_bucket: None,
            access_key: String::new(),
            secret_key: String::new(),
            path_style: false,
            limits: PartLimits::default(),
            read_block_size: DEFAULT_READ_BLOCK_SIZE,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl StorageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or(defaults.region),
            default_bucket: env::var("S3_BUCKET").ok(),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            path_style: env_parse("S3_PATH_STYLE").unwrap_or(false),
            limits: PartLimits {
                min_part_size: env_parse("S3_MIN_PART_SIZE").unwrap_or(MIN_PART_SIZE),
                max_copy_part_size: env_parse("S3_MAX_COPY_PART_SIZE")
                    .unwrap_or(MAX_COPY_PART_SIZE),
                max_parts: env_parse("S3_MAX_PARTS").unwrap_or(MAX_PARTS),
            },
            read_block_size: env_parse("S3_READ_BLOCK_SIZE").unwrap_or(DEFAULT_READ_BLOCK_SIZE),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.limits.min_part_size == 0 {
            anyhow::bail!("S3 minimum part size must be positive");
        }
        if self.limits.max_copy_part_size < 2 * self.limits.min_part_size {
            anyhow::bail!("S3 maximum copy part size must be at least twice the minimum part size");
        }
        if self.limits.max_parts == 0 {
            anyhow::bail!("S3 maximum part count must be positive");
        }
        if self.read_block_size == 0 {
            anyhow::bail!("S3 read block size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert!(config.path_style);
        assert_eq!(config.access_key, "minioadmin");
        assert_eq!(config.limits, PartLimits::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let mut config = StorageConfig::default();
        config.limits.max_copy_part_size = config.limits.min_part_size;
        assert!(config.validate().is_err());

        config.limits = PartLimits::default();
        config.read_block_size = 0;
        assert!(config.validate().is_err());
    }
}
