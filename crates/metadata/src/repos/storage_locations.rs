//! Storage location repository.

use crate::error::MetadataResult;
use crate::models::StorageLocationRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for storage locations and their merge state.
#[async_trait]
pub trait StorageLocationRepo: Send + Sync {
    async fn get_location(&self, id: Uuid) -> MetadataResult<Option<StorageLocationRow>>;

    /// Location owned by the given cache entry.
    async fn get_location_for_entry(
        &self,
        entry_id: Uuid,
    ) -> MetadataResult<Option<StorageLocationRow>>;

    /// Whether any location row is backed by `folder_name`, referenced by a
    /// cache entry or not.
    async fn folder_in_use(&self, folder_name: &str) -> MetadataResult<bool>;

    async fn record_download(&self, id: Uuid, at: OffsetDateTime) -> MetadataResult<()>;

    /// Claim the merge lock. Sets `merge_started_at` only if neither
    /// `merge_started_at` nor `merged_at` is set; returns whether this
    /// caller won the claim. The winner keeps `at` as its claim token.
    async fn claim_merge(&self, id: Uuid, at: OffsetDateTime) -> MetadataResult<bool>;

    /// Set `merged_at`, but only while the merge claimed at `claimed_at`
    /// still holds the lock. Returns whether the row was updated.
    async fn complete_merge(
        &self,
        id: Uuid,
        claimed_at: OffsetDateTime,
        at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Revert to parts-only if the claim made at `claimed_at` still holds and
    /// the merge never completed. Returns whether the row was updated.
    async fn reset_merge(&self, id: Uuid, claimed_at: OffsetDateTime) -> MetadataResult<bool>;

    async fn mark_parts_deleted(&self, id: Uuid, at: OffsetDateTime) -> MetadataResult<()>;

    /// Reset every merge started before `started_before` that never
    /// finished. Returns the number of locations reset.
    async fn reset_stalled_merges(&self, started_before: OffsetDateTime) -> MetadataResult<u64>;

    /// Locations no cache entry points at, ordered by id.
    async fn list_orphaned_locations(
        &self,
        after: Option<Uuid>,
        limit: u32,
    ) -> MetadataResult<Vec<StorageLocationRow>>;

    /// Merged locations merged before `merged_before` whose parts were never
    /// reclaimed, ordered by id.
    async fn list_unreclaimed_locations(
        &self,
        merged_before: OffsetDateTime,
        after: Option<Uuid>,
        limit: u32,
    ) -> MetadataResult<Vec<StorageLocationRow>>;

    /// Delete a location row, but only if no cache entry references it.
    /// Returns whether a row was deleted.
    async fn delete_storage_location(&self, id: Uuid) -> MetadataResult<bool>;
}
