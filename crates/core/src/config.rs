//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Public base URL used when building server-relative download links.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Hand out pre-signed storage URLs for merged entries instead of
    /// proxying bytes through the server. Only honored by backends that
    /// can sign URLs.
    #[serde(default)]
    pub enable_direct_downloads: bool,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_api_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_base_url: default_api_base_url(),
            enable_direct_downloads: false,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(format!(
                "server.api_base_url must be an http(s) URL, got '{}'",
                self.api_base_url
            ));
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Key prefix (default: "gh-actions-cache").
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the default credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the default credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
    /// Google Cloud Storage.
    Gcs {
        /// Bucket name.
        bucket: String,
        /// Path to a service account JSON key. Application default
        /// credentials are used when unset.
        service_account_key: Option<PathBuf>,
        /// Object prefix (default: "gh-actions-cache").
        prefix: Option<String>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from(".data/storage"),
        }
    }
}

impl StorageConfig {
    /// Registry name of the backend this configuration selects.
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::Filesystem { .. } => "filesystem",
            StorageConfig::S3 { .. } => "s3",
            StorageConfig::Gcs { .. } => "gcs",
        }
    }

    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Gcs { bucket, .. } if bucket.is_empty() => {
                Err("gcs config requires a non-empty bucket".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database. Suited to single-node deployments.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over the individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer HOARD_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from(".data/metadata.db"),
        }
    }
}

impl MetadataConfig {
    /// Registry name of the driver this configuration selects.
    pub fn driver_name(&self) -> &'static str {
        match self {
            MetadataConfig::Sqlite { .. } => "sqlite",
            MetadataConfig::Postgres { .. } => "postgres",
        }
    }

    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => Err(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ),
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Retention and cleanup scheduling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Run the cleanup jobs in the background (default: true).
    #[serde(default = "default_retention_enabled")]
    pub enabled: bool,
    /// Interval between runs of the fast jobs: orphaned locations, dangling
    /// uploads, stalled merges and leftover parts.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Interval between stale-entry pruning runs.
    #[serde(default = "default_stale_interval_secs")]
    pub stale_interval_secs: u64,
    /// Entries not accessed for this many days are pruned. `None` disables
    /// stale pruning entirely.
    #[serde(default = "default_max_unused_days")]
    pub max_unused_days: Option<u32>,
    /// Uploads without part activity for this long are discarded.
    #[serde(default = "default_upload_grace_secs")]
    pub upload_grace_secs: u64,
    /// Merges running longer than this are assumed dead and reset.
    #[serde(default = "default_merge_timeout_secs")]
    pub merge_timeout_secs: u64,
    /// Rows fetched per metadata page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_retention_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

fn default_stale_interval_secs() -> u64 {
    3600
}

fn default_max_unused_days() -> Option<u32> {
    Some(90)
}

fn default_upload_grace_secs() -> u64 {
    60
}

fn default_merge_timeout_secs() -> u64 {
    900 // 15 minutes
}

fn default_page_size() -> u32 {
    10
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_retention_enabled(),
            interval_secs: default_interval_secs(),
            stale_interval_secs: default_stale_interval_secs(),
            max_unused_days: default_max_unused_days(),
            upload_grace_secs: default_upload_grace_secs(),
            merge_timeout_secs: default_merge_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

impl RetentionConfig {
    pub fn upload_grace(&self) -> Duration {
        Duration::seconds(i64::try_from(self.upload_grace_secs).unwrap_or(i64::MAX))
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::seconds(i64::try_from(self.merge_timeout_secs).unwrap_or(i64::MAX))
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn stale_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stale_interval_secs)
    }

    /// Validate retention configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.page_size == 0 {
            return Err("retention.page_size must be at least 1".to_string());
        }
        if self.enabled && (self.interval_secs == 0 || self.stale_interval_secs == 0) {
            return Err(
                "retention.interval_secs and retention.stale_interval_secs must be non-zero"
                    .to_string(),
            );
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Default tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Create a test configuration with background retention disabled.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            retention: RetentionConfig {
                enabled: false,
                ..RetentionConfig::default()
            },
            log_level: default_log_level(),
            ..Self::default()
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.storage.validate()?;
        self.metadata.validate()?;
        self.retention.validate()
    }
}
