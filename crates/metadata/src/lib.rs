//! Metadata store abstraction and implementations for hoard.
//!
//! This crate provides the cache's relational state:
//! - Cache entries keyed by `(key, version, scope)`
//! - Storage locations and their merge lifecycle
//! - In-flight uploads and part accounting

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{
    CacheEntryRow, CommitOutcome, LocationState, StorageLocationRow, UploadRow,
};
pub use postgres::PostgresStore;
pub use store::{MetadataStore, SqliteStore};

use futures::future::BoxFuture;
use hoard_core::config::MetadataConfig;
use std::collections::HashMap;
use std::sync::Arc;

/// Constructs a store from its configuration section.
pub type MetadataFactory =
    fn(MetadataConfig) -> BoxFuture<'static, MetadataResult<Arc<dyn MetadataStore>>>;

/// Metadata drivers keyed by name.
pub struct MetadataRegistry {
    factories: HashMap<&'static str, MetadataFactory>,
}

impl MetadataRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the SQLite and PostgreSQL drivers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("sqlite", |config| Box::pin(build_sqlite(config)));
        registry.register("postgres", |config| Box::pin(build_postgres(config)));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: MetadataFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Validate `config` and connect to the driver it names.
    pub async fn create(&self, config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
        config.validate().map_err(MetadataError::Config)?;
        let name = config.driver_name();
        let factory = self.factories.get(name).ok_or_else(|| {
            MetadataError::Config(format!(
                "unknown metadata driver '{name}', available: {}",
                self.names().join(", ")
            ))
        })?;
        factory(config.clone()).await
    }
}

impl Default for MetadataRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    MetadataRegistry::with_builtin().create(config).await
}

async fn build_sqlite(config: MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    let MetadataConfig::Sqlite { path } = config else {
        return Err(MetadataError::Config(
            "factory 'sqlite' received a different metadata config".to_string(),
        ));
    };
    Ok(Arc::new(SqliteStore::new(path).await?))
}

async fn build_postgres(config: MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    let MetadataConfig::Postgres {
        url,
        host,
        port,
        username,
        password,
        database,
        ssl_mode,
        max_connections,
        statement_timeout_ms,
    } = config
    else {
        return Err(MetadataError::Config(
            "factory 'postgres' received a different metadata config".to_string(),
        ));
    };

    let store = match (url, host, database) {
        // URL takes precedence over the individual fields.
        (Some(url), _, _) => {
            PostgresStore::from_url(&url, max_connections, statement_timeout_ms).await?
        }
        (None, Some(host), Some(database)) => {
            PostgresStore::from_params(
                &host,
                port.unwrap_or(5432),
                username.as_deref(),
                password.as_deref(),
                &database,
                ssl_mode,
                max_connections,
                statement_timeout_ms,
            )
            .await?
        }
        _ => {
            return Err(MetadataError::Config(
                "postgres config requires either 'url' or 'host' + 'database'".to_string(),
            ));
        }
    };
    Ok(Arc::new(store))
}
