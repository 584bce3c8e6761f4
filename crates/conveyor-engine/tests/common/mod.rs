//! Common test utilities for Conveyor integration tests using testcontainers
//!
//! Spins up PostgreSQL (with the job-run migration applied) and MinIO so the
//! cursor reader, the built-in jobs and the run store can be exercised
//! against real services.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::TestEnvironment;
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn test_with_full_environment() {
//!     let env = TestEnvironment::start().await.expect("Failed to start environment");
//!     let pool = env.db_pool();
//!     let store = env.store();
//! }
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use conveyor_engine::storage::{S3Store, StorageConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

/// Default S3 bucket name for tests
pub const DEFAULT_TEST_BUCKET: &str = "conveyor-test-data";

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with migrations pre-applied
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        Self::start_with_options(PostgresOptions::default()).await
    }

    pub async fn start_with_options(options: PostgresOptions) -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag(&options.version)
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(Duration::from_secs(options.acquire_timeout_secs))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        if options.run_migrations {
            info!("Running database migrations...");
            conveyor_engine::db::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
        }

        Ok(Self {
            container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

/// Configuration options for the PostgreSQL test container
pub struct PostgresOptions {
    /// PostgreSQL version/tag (default: "16-alpine")
    pub version: String,
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub run_migrations: bool,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            version: "16-alpine".to_string(),
            // Listeners and cursors each hold a connection
            max_connections: 10,
            acquire_timeout_secs: 30,
            run_migrations: true,
        }
    }
}

// ============================================================================
// MinIO Test Container
// ============================================================================

/// MinIO (S3-compatible) container with the test bucket created
pub struct TestMinio {
    container: ContainerAsync<GenericImage>,
    store: Arc<S3Store>,
    config: StorageConfig,
}

impl TestMinio {
    pub async fn start() -> Result<Self> {
        info!("Starting MinIO test container...");

        let container = GenericImage::new("minio/minio", "latest")
            .with_exposed_port(9000.tcp())
            .with_wait_for(WaitFor::message_on_stdout("MinIO Object Storage Server"))
            .with_env_var("MINIO_ROOT_USER", "minioadmin")
            .with_env_var("MINIO_ROOT_PASSWORD", "minioadmin")
            .with_cmd(vec!["server", "/data"])
            .start()
            .await
            .context("Failed to start MinIO container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get MinIO host")?;
        let port = container
            .get_host_port_ipv4(9000.tcp())
            .await
            .context("Failed to get MinIO port")?;

        let endpoint = format!("http://{}:{}", host, port);
        debug!("MinIO endpoint: {}", endpoint);

        let mut config = StorageConfig::for_minio(&endpoint);
        config.default_bucket = Some(DEFAULT_TEST_BUCKET.to_string());
        let store = Arc::new(S3Store::new(&config));

        info!("Creating test bucket: {}", DEFAULT_TEST_BUCKET);
        store
            .client()
            .create_bucket()
            .bucket(DEFAULT_TEST_BUCKET)
            .send()
            .await
            .context("Failed to create S3 bucket")?;

        Ok(Self {
            container,
            store,
            config,
        })
    }

    pub fn store(&self) -> Arc<S3Store> {
        self.store.clone()
    }

    /// Storage settings pointing at this container
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn bucket(&self) -> &str {
        DEFAULT_TEST_BUCKET
    }
}

// ============================================================================
// Complete Test Environment
// ============================================================================

pub struct TestEnvironment {
    postgres: TestPostgres,
    minio: TestMinio,
}

impl TestEnvironment {
    pub async fn start() -> Result<Self> {
        info!("Starting complete test environment...");

        let (postgres, minio) = tokio::try_join!(TestPostgres::start(), TestMinio::start())?;

        info!("Test environment ready");
        Ok(Self { postgres, minio })
    }

    pub fn postgres(&self) -> &TestPostgres {
        &self.postgres
    }

    pub fn minio(&self) -> &TestMinio {
        &self.minio
    }

    pub fn db_pool(&self) -> &PgPool {
        self.postgres.pool()
    }

    pub fn store(&self) -> Arc<S3Store> {
        self.minio.store()
    }
}

// ============================================================================
// Test Utilities
// ============================================================================

/// Initialize tracing for tests
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,conveyor_engine=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
