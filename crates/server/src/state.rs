//! Application state shared across handlers.

use crate::engine::CacheEngine;
use hoard_core::config::AppConfig;
use hoard_metadata::MetadataStore;
use hoard_storage::StorageAdapter;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: CacheEngine,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn StorageAdapter>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let engine = CacheEngine::new(storage, metadata, &config);
        Self {
            config: Arc::new(config),
            engine,
        }
    }
}
