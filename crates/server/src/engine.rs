//! The cache storage engine.
//!
//! [`CacheEngine`] ties the object store and the metadata store together.
//! Its operations are split by concern:
//! - [`crate::resolver`]: key matching and download URLs
//! - [`crate::uploads`]: reserve, part upload and commit
//! - [`crate::merge`]: downloads and lazy consolidation of parts
//! - [`crate::retention`]: pruning and recovery jobs
//!
//! Every transition touching both stores commits metadata first and cleans
//! up objects afterwards, so a crash in between leaks objects (reclaimed by
//! retention) instead of losing referenced data.

use crate::error::EngineResult;
use hoard_core::config::{AppConfig, RetentionConfig, ServerConfig};
use hoard_metadata::{MetadataStore, StorageLocationRow};
use hoard_storage::StorageAdapter;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// Cache storage engine shared by request handlers and background jobs.
#[derive(Clone)]
pub struct CacheEngine {
    pub(crate) storage: Arc<dyn StorageAdapter>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) server: ServerConfig,
    pub(crate) retention: RetentionConfig,
}

impl CacheEngine {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        metadata: Arc<dyn MetadataStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            storage,
            metadata,
            server: config.server.clone(),
            retention: config.retention.clone(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn retention_config(&self) -> &RetentionConfig {
        &self.retention
    }

    /// Current time. Always UTC: SQLite stores timestamps as text.
    pub(crate) fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    /// Delete a location's objects, then its row.
    ///
    /// Only call this for replaced or orphaned locations. The row is kept if
    /// a cache entry still references it. Returns whether the row was deleted.
    pub(crate) async fn remove_location(&self, location: &StorageLocationRow) -> EngineResult<bool> {
        self.storage.delete_folder(&location.folder_name).await?;
        let deleted = self.metadata.delete_storage_location(location.id).await?;
        tracing::debug!(
            location_id = %location.id,
            folder = %location.folder_name,
            row_deleted = deleted,
            "Removed storage location"
        );
        Ok(deleted)
    }

    /// Like [`Self::remove_location`], starting from an id. Returns `false`
    /// if the location no longer exists.
    pub(crate) async fn remove_location_by_id(&self, location_id: Uuid) -> EngineResult<bool> {
        match self.metadata.get_location(location_id).await? {
            Some(location) => self.remove_location(&location).await,
            None => Ok(false),
        }
    }
}
