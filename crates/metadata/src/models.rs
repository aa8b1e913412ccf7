//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Cache entries
// =============================================================================

/// A resolvable cache entry. At most one row exists per `(key, version, scope)`.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct CacheEntryRow {
    pub id: Uuid,
    pub key: String,
    pub version: String,
    pub scope: String,
    /// Last time a commit wrote (or replaced) this entry.
    pub updated_at: OffsetDateTime,
    /// Last time a lookup matched this entry. Drives stale pruning.
    pub accessed_at: OffsetDateTime,
    pub location_id: Uuid,
}

// =============================================================================
// Storage locations
// =============================================================================

/// Physical backing of a cache entry: a storage folder with `parts/` and,
/// once consolidated, a `merged` object.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct StorageLocationRow {
    pub id: Uuid,
    pub folder_name: String,
    pub part_count: i64,
    pub merge_started_at: Option<OffsetDateTime>,
    pub merged_at: Option<OffsetDateTime>,
    pub parts_deleted_at: Option<OffsetDateTime>,
    pub last_downloaded_at: Option<OffsetDateTime>,
}

/// Where a storage location is in its consolidation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationState {
    /// Only parts exist.
    PartsOnly,
    /// A merge has claimed the location and has not finished.
    MergeInProgress,
    /// The merged object exists; parts may still exist.
    Merged,
    /// The merged object exists and the parts have been removed.
    PartsReclaimed,
    /// Parts were removed without a completed merge. Data is gone.
    Inconsistent,
}

impl StorageLocationRow {
    /// Fresh location for a just-committed upload folder.
    pub fn new(folder_name: impl Into<String>, part_count: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            folder_name: folder_name.into(),
            part_count,
            merge_started_at: None,
            merged_at: None,
            parts_deleted_at: None,
            last_downloaded_at: None,
        }
    }

    pub fn state(&self) -> LocationState {
        match (self.merge_started_at, self.merged_at, self.parts_deleted_at) {
            (_, None, Some(_)) => LocationState::Inconsistent,
            (_, Some(_), Some(_)) => LocationState::PartsReclaimed,
            (_, Some(_), None) => LocationState::Merged,
            (Some(_), None, None) => LocationState::MergeInProgress,
            (None, None, None) => LocationState::PartsOnly,
        }
    }
}

// =============================================================================
// Uploads
// =============================================================================

/// Staging record for an in-flight multi-part upload.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct UploadRow {
    pub id: i64,
    pub key: String,
    pub version: String,
    pub scope: String,
    pub created_at: OffsetDateTime,
    pub last_part_uploaded_at: Option<OffsetDateTime>,
    pub started_part_upload_count: i64,
    pub finished_part_upload_count: i64,
    pub folder_name: String,
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub entry_id: Uuid,
    pub location_id: Uuid,
    /// Location the entry pointed at before this commit. Its objects and row
    /// are now unowned and must be removed by the caller.
    pub replaced_location: Option<StorageLocationRow>,
}
