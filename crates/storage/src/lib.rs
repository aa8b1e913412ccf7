//! Object storage abstraction and backends for hoard.
//!
//! This crate provides:
//! - The [`StorageAdapter`] trait: streaming writes and reads of named
//!   objects plus prefix ("folder") delete and count
//! - Backends: local filesystem, S3-compatible, Google Cloud Storage
//! - A registry resolving a backend by name at startup

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{
    filesystem::FilesystemBackend,
    gcs::GcsBackend,
    s3::{S3Backend, S3Options},
};
pub use error::{StorageError, StorageErrorKind, StorageResult};
pub use traits::{ByteStream, StorageAdapter};

use futures::future::BoxFuture;
use hoard_core::config::StorageConfig;
use std::collections::HashMap;
use std::sync::Arc;

/// Constructs a backend from its configuration section.
pub type StorageFactory =
    fn(StorageConfig) -> BoxFuture<'static, StorageResult<Arc<dyn StorageAdapter>>>;

/// Backend constructors keyed by name.
pub struct StorageRegistry {
    factories: HashMap<&'static str, StorageFactory>,
}

impl StorageRegistry {
    /// Registry with no backends.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in backends.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("filesystem", |config| Box::pin(build_filesystem(config)));
        registry.register("s3", |config| Box::pin(build_s3(config)));
        registry.register("gcs", |config| Box::pin(build_gcs(config)));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: StorageFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Validate `config` and construct the backend it names.
    pub async fn create(&self, config: &StorageConfig) -> StorageResult<Arc<dyn StorageAdapter>> {
        config.validate().map_err(StorageError::Config)?;
        let name = config.backend_name();
        let factory = self.factories.get(name).ok_or_else(|| {
            StorageError::Config(format!(
                "unknown storage backend '{name}', available: {}",
                self.names().join(", ")
            ))
        })?;
        factory(config.clone()).await
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Create a storage adapter from configuration using the built-in registry.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageAdapter>> {
    StorageRegistry::with_builtin().create(config).await
}

fn mismatch(expected: &str) -> StorageError {
    StorageError::Config(format!("factory '{expected}' received a different storage config"))
}

async fn build_filesystem(config: StorageConfig) -> StorageResult<Arc<dyn StorageAdapter>> {
    let StorageConfig::Filesystem { path } = config else {
        return Err(mismatch("filesystem"));
    };
    Ok(Arc::new(FilesystemBackend::new(path).await?))
}

async fn build_s3(config: StorageConfig) -> StorageResult<Arc<dyn StorageAdapter>> {
    let StorageConfig::S3 {
        bucket,
        endpoint,
        region,
        prefix,
        access_key_id,
        secret_access_key,
        force_path_style,
    } = config
    else {
        return Err(mismatch("s3"));
    };
    let backend = S3Backend::new(S3Options {
        bucket,
        endpoint,
        region,
        prefix,
        access_key_id,
        secret_access_key,
        force_path_style,
    })
    .await?;
    Ok(Arc::new(backend))
}

async fn build_gcs(config: StorageConfig) -> StorageResult<Arc<dyn StorageAdapter>> {
    let StorageConfig::Gcs {
        bucket,
        service_account_key,
        prefix,
    } = config
    else {
        return Err(mismatch("gcs"));
    };
    Ok(Arc::new(GcsBackend::new(&bucket, service_account_key, prefix)?))
}
