//! Retention jobs: reclaim stale, orphaned and abandoned data.
//!
//! Every job pages through metadata by id with a keyset cursor, so rows
//! deleted mid-scan never shift the next page. A failure on one item is
//! logged and counted; the job moves on to the next.

use crate::engine::CacheEngine;
use crate::error::{EngineError, EngineResult};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Outcome of one retention job run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionStats {
    /// Rows examined.
    pub scanned: u64,
    /// Rows removed (or reset, for stalled merges).
    pub deleted: u64,
    /// Items that failed and were skipped.
    pub errors: u64,
}

impl RetentionStats {
    fn log(&self, job: &'static str) {
        if self.deleted > 0 || self.errors > 0 {
            tracing::info!(
                job,
                scanned = self.scanned,
                deleted = self.deleted,
                errors = self.errors,
                "Retention job finished"
            );
        } else {
            tracing::debug!(job, scanned = self.scanned, "Retention job found nothing to do");
        }
    }
}

impl CacheEngine {
    /// Delete entries not accessed for `max_unused_days`, then their
    /// locations. With `None`, every entry is pruned.
    #[tracing::instrument(skip(self))]
    pub async fn prune_stale(
        &self,
        max_unused_days: Option<u32>,
        now: OffsetDateTime,
    ) -> EngineResult<RetentionStats> {
        let cutoff = max_unused_days.map(|days| now - Duration::days(i64::from(days)));
        let page_size = self.retention.page_size;
        let mut stats = RetentionStats::default();
        let mut cursor: Option<Uuid> = None;

        loop {
            let page = self
                .metadata
                .list_stale_cache_entries(cutoff, cursor, page_size)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.id);
            stats.scanned += page.len() as u64;

            let ids: Vec<Uuid> = page.iter().map(|entry| entry.id).collect();
            let location_ids = self.metadata.delete_cache_entries(&ids).await?;
            stats.deleted += location_ids.len() as u64;

            self.remove_locations(&location_ids, &mut stats).await;

            if page.len() < page_size as usize {
                break;
            }
        }

        stats.log("prune_stale");
        Ok(stats)
    }

    /// Delete locations no cache entry references.
    #[tracing::instrument(skip(self))]
    pub async fn prune_orphans(&self) -> EngineResult<RetentionStats> {
        let page_size = self.retention.page_size;
        let mut stats = RetentionStats::default();
        let mut cursor: Option<Uuid> = None;

        loop {
            let page = self
                .metadata
                .list_orphaned_locations(cursor, page_size)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.id);
            stats.scanned += page.len() as u64;

            for location in &page {
                match self.remove_location(location).await {
                    Ok(true) => stats.deleted += 1,
                    // Adopted by an entry since the scan.
                    Ok(false) => {}
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(
                            location_id = %location.id,
                            folder = %location.folder_name,
                            error = %e,
                            "Failed to prune orphaned location"
                        );
                    }
                }
            }

            if page.len() < page_size as usize {
                break;
            }
        }

        stats.log("prune_orphans");
        Ok(stats)
    }

    /// Delete uploads with no part activity within the upload grace window,
    /// then their staging folders.
    #[tracing::instrument(skip(self))]
    pub async fn prune_dangling_uploads(&self, now: OffsetDateTime) -> EngineResult<RetentionStats> {
        let idle_before = now - self.retention.upload_grace();
        let page_size = self.retention.page_size;
        let mut stats = RetentionStats::default();
        let mut cursor: Option<i64> = None;

        loop {
            let page = self
                .metadata
                .list_dangling_uploads(idle_before, cursor, page_size)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.id);
            stats.scanned += page.len() as u64;

            for upload in &page {
                match self.metadata.delete_dangling_upload(upload.id, idle_before).await {
                    Ok(true) => {}
                    // A part landed since the scan.
                    Ok(false) => continue,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(upload_id = upload.id, error = %e, "Failed to delete dangling upload");
                        continue;
                    }
                }
                stats.deleted += 1;
                match self.metadata.folder_in_use(&upload.folder_name).await {
                    Ok(false) => {}
                    Ok(true) => {
                        tracing::warn!(
                            upload_id = upload.id,
                            folder = %upload.folder_name,
                            "Dangling upload shares a live folder, keeping objects"
                        );
                        continue;
                    }
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(upload_id = upload.id, error = %e, "Failed to check upload folder");
                        continue;
                    }
                }
                if let Err(e) = self.storage.delete_folder(&upload.folder_name).await {
                    stats.errors += 1;
                    tracing::warn!(
                        upload_id = upload.id,
                        folder = %upload.folder_name,
                        error = %e,
                        "Failed to delete dangling upload folder"
                    );
                }
            }

            if page.len() < page_size as usize {
                break;
            }
        }

        stats.log("prune_dangling_uploads");
        Ok(stats)
    }

    /// Reset merges started longer than the merge timeout ago that never
    /// finished, so the next download retries them.
    #[tracing::instrument(skip(self))]
    pub async fn reset_stalled_merges(&self, now: OffsetDateTime) -> EngineResult<RetentionStats> {
        let reset = self
            .metadata
            .reset_stalled_merges(now - self.retention.merge_timeout())
            .await?;
        let stats = RetentionStats {
            scanned: reset,
            deleted: reset,
            errors: 0,
        };
        stats.log("reset_stalled_merges");
        Ok(stats)
    }

    /// Delete leftover parts of merged locations whose post-merge cleanup
    /// failed.
    #[tracing::instrument(skip(self))]
    pub async fn reclaim_merged_parts(&self, now: OffsetDateTime) -> EngineResult<RetentionStats> {
        let merged_before = now - self.retention.upload_grace();
        let page_size = self.retention.page_size;
        let mut stats = RetentionStats::default();
        let mut cursor: Option<Uuid> = None;

        loop {
            let page = self
                .metadata
                .list_unreclaimed_locations(merged_before, cursor, page_size)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.id);
            stats.scanned += page.len() as u64;

            for location in &page {
                match self.reclaim_parts(location).await {
                    Ok(()) => stats.deleted += 1,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(
                            location_id = %location.id,
                            folder = %location.folder_name,
                            error = %e,
                            "Failed to reclaim merged parts"
                        );
                    }
                }
            }

            if page.len() < page_size as usize {
                break;
            }
        }

        stats.log("reclaim_merged_parts");
        Ok(stats)
    }

    /// Delete every entry in `scope` whose key starts with `prefix`, then
    /// their locations.
    #[tracing::instrument(skip(self))]
    pub async fn clear_key_prefix(&self, prefix: &str, scope: &str) -> EngineResult<RetentionStats> {
        if prefix.is_empty() {
            return Err(EngineError::InvalidInput(
                "key prefix must not be empty".to_string(),
            ));
        }

        let location_ids = self
            .metadata
            .delete_cache_entries_by_key_prefix(prefix, scope)
            .await?;
        let mut stats = RetentionStats {
            scanned: location_ids.len() as u64,
            deleted: location_ids.len() as u64,
            errors: 0,
        };
        self.remove_locations(&location_ids, &mut stats).await;

        stats.log("clear_key_prefix");
        Ok(stats)
    }

    async fn remove_locations(&self, location_ids: &[Uuid], stats: &mut RetentionStats) {
        for &location_id in location_ids {
            if let Err(e) = self.remove_location_by_id(location_id).await {
                // Orphan pruning retries it.
                stats.errors += 1;
                tracing::warn!(%location_id, error = %e, "Failed to remove storage location");
            }
        }
    }
}
