//! Upload repository.

use crate::error::MetadataResult;
use crate::models::UploadRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for in-flight uploads.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Insert the upload unless one already exists for its triple (or id).
    /// Returns `false` when the slot is already reserved.
    async fn reserve_upload(&self, upload: &UploadRow) -> MetadataResult<bool>;

    async fn get_upload(&self, id: i64) -> MetadataResult<Option<UploadRow>>;

    async fn find_upload(
        &self,
        key: &str,
        version: &str,
        scope: &str,
    ) -> MetadataResult<Option<UploadRow>>;

    /// Count a part upload as started. Returns the updated row, or `None`
    /// if the upload does not exist.
    async fn begin_part_upload(&self, id: i64) -> MetadataResult<Option<UploadRow>>;

    /// Count a part upload as finished and stamp `last_part_uploaded_at`.
    /// Returns `false` if the upload no longer exists.
    async fn finish_part_upload(&self, id: i64, at: OffsetDateTime) -> MetadataResult<bool>;

    /// Uploads with no part activity since `idle_before` (falling back to
    /// `created_at` when no part finished), ordered by id.
    async fn list_dangling_uploads(
        &self,
        idle_before: OffsetDateTime,
        after: Option<i64>,
        limit: u32,
    ) -> MetadataResult<Vec<UploadRow>>;

    /// Delete the upload if it is still idle since `idle_before`. Returns
    /// whether a row was deleted; a concurrent part upload keeps it alive.
    async fn delete_dangling_upload(
        &self,
        id: i64,
        idle_before: OffsetDateTime,
    ) -> MetadataResult<bool>;
}
