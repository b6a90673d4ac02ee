//! Configuration management for the Build Service
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Where build records and artifacts are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Redis record store + HTTP object storage
    Redis,
    /// In-process stores, lost on restart (local development)
    Memory,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Record/artifact backend
    pub storage_backend: StorageBackend,

    /// Redis connection URL
    pub redis_url: String,

    /// Build record table name, used as the Redis key namespace
    pub builds_table: String,

    /// Object storage endpoint receiving uploads
    pub artifact_bucket_url: Option<String>,

    /// Object key prefix inside the bucket
    pub artifact_prefix: String,

    /// Base URL clients download artifacts from
    pub artifact_public_url: Option<String>,

    /// Bearer token for artifact uploads
    pub artifact_upload_token: Option<String>,

    /// Local temp-data root
    pub data_dir: PathBuf,

    /// Repository to poll, as `owner/name`
    pub source_repo: String,

    /// Ref to poll; the default branch when unset
    pub source_branch: Option<String>,

    /// Source host API root
    pub source_api_url: String,

    /// Source host API token
    pub source_token: Option<String>,

    /// Base name of produced binaries and archives
    pub binary_name: String,

    pub install_command: String,
    pub build_command: String,

    /// Per-platform packager; `{platform}`, `{target}` and `{output}` are substituted
    pub package_command: String,

    /// Staleness check interval in seconds
    pub polling_interval_secs: u64,

    /// Bound on each external process, in seconds
    pub step_timeout_secs: u64,

    /// Bound on each outbound HTTP call, in seconds
    pub http_timeout_secs: u64,

    /// Bound on each record store call, in seconds
    pub store_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let opt = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let storage_backend = match var("STORAGE_BACKEND", "redis").as_str() {
            "redis" => StorageBackend::Redis,
            "memory" => StorageBackend::Memory,
            other => anyhow::bail!("Invalid STORAGE_BACKEND {:?} (expected redis/memory)", other),
        };

        let config = Config {
            api_host: var("API_HOST", "0.0.0.0"),

            api_port: var("API_PORT", "8080")
                .parse()
                .context("Invalid API_PORT")?,

            storage_backend,

            redis_url: var("REDIS_URL", "redis://127.0.0.1:6379"),
            builds_table: var("BUILDS_TABLE", "nightly-builds"),

            artifact_bucket_url: opt("ARTIFACT_BUCKET_URL"),
            artifact_prefix: var("ARTIFACT_PREFIX", "builds"),
            artifact_public_url: opt("ARTIFACT_PUBLIC_URL"),
            artifact_upload_token: opt("ARTIFACT_UPLOAD_TOKEN"),

            data_dir: PathBuf::from(var("DATA_DIR", "/tmp/nightly")),

            source_repo: var("SOURCE_REPO", ""),
            source_branch: opt("SOURCE_BRANCH"),
            source_api_url: var("SOURCE_API_URL", "https://api.github.com"),
            source_token: opt("SOURCE_TOKEN"),

            binary_name: var("BINARY_NAME", "app"),
            install_command: var("INSTALL_COMMAND", "npm install"),
            build_command: var("BUILD_COMMAND", "npm run build"),
            package_command: var(
                "PACKAGE_COMMAND",
                "npx pkg . --targets node18-{target}-x64 --output {output}",
            ),

            polling_interval_secs: var("POLLING_INTERVAL_SECS", "300")
                .parse()
                .context("Invalid POLLING_INTERVAL_SECS")?,

            step_timeout_secs: var("STEP_TIMEOUT_SECS", "1800")
                .parse()
                .context("Invalid STEP_TIMEOUT_SECS")?,

            http_timeout_secs: var("HTTP_TIMEOUT_SECS", "120")
                .parse()
                .context("Invalid HTTP_TIMEOUT_SECS")?,

            store_timeout_secs: var("STORE_TIMEOUT_SECS", "10")
                .parse()
                .context("Invalid STORE_TIMEOUT_SECS")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.polling_interval_secs == 0 {
            anyhow::bail!("POLLING_INTERVAL_SECS must be greater than 0");
        }

        if self.step_timeout_secs == 0 || self.http_timeout_secs == 0 {
            anyhow::bail!("STEP_TIMEOUT_SECS and HTTP_TIMEOUT_SECS must be greater than 0");
        }

        if self.store_timeout_secs == 0 {
            anyhow::bail!("STORE_TIMEOUT_SECS must be greater than 0");
        }

        let mut parts = self.source_repo.split('/');
        let well_formed = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
        );
        if !well_formed {
            anyhow::bail!("SOURCE_REPO must be set as owner/name");
        }

        if self.binary_name.is_empty() || self.binary_name.contains(['/', '\\']) {
            anyhow::bail!("BINARY_NAME must be a plain file name");
        }

        if self.storage_backend == StorageBackend::Redis && self.artifact_bucket_url.is_none() {
            anyhow::bail!("ARTIFACT_BUCKET_URL is required when STORAGE_BACKEND=redis");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Root of the per-commit archive cache
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Root of the per-run pipeline workspaces
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}
