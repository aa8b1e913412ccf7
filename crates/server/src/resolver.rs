//! Cache key resolution.
//!
//! Lookup order, first hit wins:
//! 1. exact primary key
//! 2. newest entry whose key starts with the primary key
//! 3. for each restore key in the order given: exact, then newest prefixed
//!
//! Exact beats prefix at every tier, and restore keys are tried in the
//! client's order, not by recency. All tiers are confined to one
//! `(version, scope)`.

use crate::engine::CacheEngine;
use crate::error::{EngineError, EngineResult};
use hoard_core::cache::validate_key;
use hoard_core::layout::merged_object;
use hoard_metadata::repos::CacheEntryRepo;
use hoard_metadata::{CacheEntryRow, MetadataResult};
use serde::Serialize;

/// Which tier of the lookup produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchKind {
    ExactPrimary,
    PrefixedPrimary,
    ExactRestore,
    PrefixedRestore,
}

impl MatchKind {
    pub fn is_exact(self) -> bool {
        matches!(self, MatchKind::ExactPrimary | MatchKind::ExactRestore)
    }
}

/// A resolved cache hit.
#[derive(Debug, Clone)]
pub struct CacheMatch {
    pub entry: CacheEntryRow,
    pub kind: MatchKind,
}

/// Run the lookup algorithm against `repo`. Read-only.
pub async fn resolve(
    repo: &dyn CacheEntryRepo,
    primary_key: &str,
    restore_keys: &[String],
    version: &str,
    scope: &str,
) -> MetadataResult<Option<CacheMatch>> {
    let hit = |entry, kind| Some(CacheMatch { entry, kind });

    if let Some(entry) = repo.find_exact(primary_key, version, scope).await? {
        return Ok(hit(entry, MatchKind::ExactPrimary));
    }
    if let Some(entry) = repo
        .find_newest_with_prefix(primary_key, version, scope)
        .await?
    {
        return Ok(hit(entry, MatchKind::PrefixedPrimary));
    }

    for restore_key in restore_keys {
        if let Some(entry) = repo.find_exact(restore_key, version, scope).await? {
            return Ok(hit(entry, MatchKind::ExactRestore));
        }
        if let Some(entry) = repo
            .find_newest_with_prefix(restore_key, version, scope)
            .await?
        {
            return Ok(hit(entry, MatchKind::PrefixedRestore));
        }
    }

    Ok(None)
}

impl CacheEngine {
    /// Find the entry a client should restore, and record the access.
    ///
    /// Returns `None` on a cache miss.
    #[tracing::instrument(skip(self, restore_keys), fields(restore_keys = restore_keys.len()))]
    pub async fn match_cache_entry(
        &self,
        primary_key: &str,
        restore_keys: &[String],
        version: &str,
        scope: &str,
    ) -> EngineResult<Option<CacheMatch>> {
        validate_key(primary_key)?;
        for key in restore_keys {
            validate_key(key)?;
        }
        if version.is_empty() {
            return Err(EngineError::InvalidInput("version must not be empty".to_string()));
        }

        let Some(mut found) =
            resolve(self.metadata.as_ref(), primary_key, restore_keys, version, scope).await?
        else {
            tracing::debug!("Cache miss");
            return Ok(None);
        };

        let now = Self::now();
        match self.metadata.touch_cache_entry(found.entry.id, now).await {
            Ok(()) => found.entry.accessed_at = now,
            Err(e) => {
                tracing::warn!(entry_id = %found.entry.id, error = %e, "Failed to record cache access");
            }
        }

        tracing::debug!(
            entry_id = %found.entry.id,
            key = %found.entry.key,
            kind = ?found.kind,
            "Cache hit"
        );
        Ok(Some(found))
    }

    /// URL a client should download `entry` from.
    ///
    /// With direct downloads enabled and a merged location, the adapter's
    /// pre-signed URL is returned when it can produce one. Otherwise the
    /// server's own download route is used.
    pub async fn resolve_download_url(&self, entry: &CacheEntryRow) -> EngineResult<String> {
        let default_url = format!(
            "{}/download/{}",
            self.server.api_base_url.trim_end_matches('/'),
            entry.id
        );
        if !self.server.enable_direct_downloads {
            return Ok(default_url);
        }

        let location = self
            .metadata
            .get_location(entry.location_id)
            .await?
            .ok_or_else(|| EngineError::Inconsistent {
                location_id: entry.location_id,
                detail: format!("cache entry {} references a missing location", entry.id),
            })?;
        if location.merged_at.is_none() {
            return Ok(default_url);
        }

        let signed = self
            .storage
            .create_download_url(&merged_object(&location.folder_name))
            .await?;
        Ok(signed.unwrap_or(default_url))
    }
}
