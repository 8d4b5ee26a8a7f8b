use serde::Deserialize;

use crate::constants::{self, queue as queue_defaults};
use crate::services::queue::QueueOptions;
use crate::worker::PoolConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker binary.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Required for the postgres store.
    pub database_url: Option<String>,

    #[serde(default)]
    pub store_backend: StoreBackend,

    #[serde(default)]
    pub queue_backend: QueueBackend,

    #[serde(default)]
    pub storage_backend: StorageBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Run a worker pool inside the API process.
    #[serde(default)]
    pub embedded_worker: bool,

    pub s3_bucket: Option<String>,

    /// S3-compatible endpoint URL
    pub s3_endpoint: Option<String>,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    pub s3_access_key: Option<String>,

    pub s3_secret_key: Option<String>,

    /// Upload objects with a public-read ACL. Off for backends without ACLs.
    #[serde(default)]
    pub s3_public_acl: bool,

    /// Host prefix of public artifact URLs: `{storage_public_url}/{bucket}/{key}`
    #[serde(default = "default_storage_public_url")]
    pub storage_public_url: String,

    #[serde(default = "default_watermark_brand")]
    pub watermark_brand: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_queue_name() -> String {
    queue_defaults::DEFAULT_NAME.to_string()
}

fn default_worker_concurrency() -> usize {
    constants::DEFAULT_WORKER_CONCURRENCY
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_storage_public_url() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_watermark_brand() -> String {
    constants::image::DEFAULT_BRAND.to_string()
}

/// Connection settings for the S3 blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings<'a> {
    pub bucket: &'a str,
    pub endpoint: &'a str,
    pub region: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every setting the selected backends need is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_backend == StoreBackend::Postgres {
            self.database_url()?;
        }
        if self.storage_backend == StorageBackend::S3 {
            self.s3()?;
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "WORKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        required(&self.database_url, "DATABASE_URL")
    }

    pub fn s3(&self) -> Result<S3Settings<'_>, ConfigError> {
        Ok(S3Settings {
            bucket: required(&self.s3_bucket, "S3_BUCKET")?,
            endpoint: required(&self.s3_endpoint, "S3_ENDPOINT")?,
            region: &self.s3_region,
            access_key: required(&self.s3_access_key, "S3_ACCESS_KEY")?,
            secret_key: required(&self.s3_secret_key, "S3_SECRET_KEY")?,
        })
    }

    /// Bucket name used in public URLs, whichever storage backend is active.
    pub fn bucket_name(&self) -> &str {
        self.s3_bucket.as_deref().unwrap_or("local")
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions::named(self.queue_name.clone())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::with_concurrency(self.worker_concurrency)
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
