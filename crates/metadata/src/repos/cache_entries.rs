//! Cache entry repository.

use crate::error::MetadataResult;
use crate::models::{CacheEntryRow, CommitOutcome, StorageLocationRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for cache entry lookups and lifecycle.
#[async_trait]
pub trait CacheEntryRepo: Send + Sync {
    /// Entry with exactly this key.
    async fn find_exact(
        &self,
        key: &str,
        version: &str,
        scope: &str,
    ) -> MetadataResult<Option<CacheEntryRow>>;

    /// Most recently updated entry whose key starts with `prefix`.
    /// The prefix is matched literally (case-sensitive, no wildcards).
    async fn find_newest_with_prefix(
        &self,
        prefix: &str,
        version: &str,
        scope: &str,
    ) -> MetadataResult<Option<CacheEntryRow>>;

    async fn get_cache_entry(&self, id: Uuid) -> MetadataResult<Option<CacheEntryRow>>;

    /// Record a lookup hit. Does not change `updated_at`.
    async fn touch_cache_entry(&self, id: Uuid, accessed_at: OffsetDateTime)
    -> MetadataResult<()>;

    /// Atomically turn the upload for `(key, version, scope)` into a cache
    /// entry backed by `location`.
    ///
    /// In one transaction: the upload row is deleted (claiming it), the
    /// location is inserted, and the entry for the triple is either created
    /// or repointed at the new location. Returns `None` if no upload exists
    /// for the triple, in which case nothing is written.
    async fn commit_upload(
        &self,
        upload_id: i64,
        location: &StorageLocationRow,
        committed_at: OffsetDateTime,
    ) -> MetadataResult<Option<CommitOutcome>>;

    /// Entries last accessed before `accessed_before` (all entries when
    /// `None`), ordered by id, starting after the `after` cursor.
    async fn list_stale_cache_entries(
        &self,
        accessed_before: Option<OffsetDateTime>,
        after: Option<Uuid>,
        limit: u32,
    ) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Delete entries in one transaction. Returns the location ids that the
    /// deleted rows owned.
    async fn delete_cache_entries(&self, ids: &[Uuid]) -> MetadataResult<Vec<Uuid>>;

    /// Delete every entry in `scope` whose key starts with `prefix`. Returns
    /// the location ids that the deleted rows owned.
    async fn delete_cache_entries_by_key_prefix(
        &self,
        prefix: &str,
        scope: &str,
    ) -> MetadataResult<Vec<Uuid>>;
}
