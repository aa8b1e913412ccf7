//! Upload sessions: reserve, upload parts, commit.

use crate::engine::CacheEngine;
use crate::error::{EngineError, EngineResult};
use hoard_core::layout::{part_object, parts_folder};
use hoard_core::{CacheTriple, UploadId};
use hoard_metadata::{MetadataError, StorageLocationRow, UploadRow};
use hoard_storage::ByteStream;
use uuid::Uuid;

/// Attempts at drawing an unused upload id before giving up.
const RESERVE_ATTEMPTS: usize = 3;

impl CacheEngine {
    /// Reserve the upload slot for `triple`.
    ///
    /// Returns `None` if an upload for the same triple is already in flight.
    #[tracing::instrument(skip(self), fields(key = %triple.key, version = %triple.version))]
    pub async fn reserve_upload(&self, triple: &CacheTriple) -> EngineResult<Option<UploadId>> {
        for _ in 0..RESERVE_ATTEMPTS {
            let id = UploadId::new();
            // Committed locations keep the folder of the upload they came from.
            if self.metadata.folder_in_use(&id.folder_name()).await? {
                tracing::debug!(upload_id = %id, "Upload id matches a live folder, redrawing");
                continue;
            }
            let row = UploadRow {
                id: id.as_i64(),
                key: triple.key.clone(),
                version: triple.version.clone(),
                scope: triple.scope.clone(),
                created_at: Self::now(),
                last_part_uploaded_at: None,
                started_part_upload_count: 0,
                finished_part_upload_count: 0,
                folder_name: id.folder_name(),
            };

            if self.metadata.reserve_upload(&row).await? {
                tracing::debug!(upload_id = %id, "Upload reserved");
                return Ok(Some(id));
            }

            // Either the triple is taken or the random id collided.
            if self
                .metadata
                .find_upload(&triple.key, &triple.version, &triple.scope)
                .await?
                .is_some()
            {
                tracing::debug!("Upload already reserved");
                return Ok(None);
            }
        }

        Err(MetadataError::Conflict(format!(
            "could not allocate an upload id after {RESERVE_ATTEMPTS} attempts"
        ))
        .into())
    }

    /// Stream one part of an upload to storage.
    ///
    /// Parts may arrive in any order; re-uploading an index replaces it.
    /// Returns `false` if the upload does not exist.
    #[tracing::instrument(skip(self, stream))]
    pub async fn upload_part(
        &self,
        upload_id: UploadId,
        part_index: u32,
        stream: ByteStream,
    ) -> EngineResult<bool> {
        let Some(upload) = self.metadata.begin_part_upload(upload_id.as_i64()).await? else {
            tracing::debug!("Unknown upload");
            return Ok(false);
        };

        let object = part_object(&upload.folder_name, part_index);
        self.storage.upload_stream(&object, stream).await?;

        if self
            .metadata
            .finish_part_upload(upload_id.as_i64(), Self::now())
            .await?
        {
            return Ok(true);
        }

        // The upload was pruned or committed while the part was streaming.
        tracing::warn!(object = %object, "Upload vanished during part upload");
        if !self.metadata.folder_in_use(&upload.folder_name).await?
            && let Err(e) = self.storage.delete_folder(&upload.folder_name).await
        {
            tracing::warn!(folder = %upload.folder_name, error = %e, "Failed to delete abandoned upload folder");
        }
        Ok(false)
    }

    /// Turn the in-flight upload for `triple` into a cache entry.
    ///
    /// Returns the entry id, or `None` if there is no upload to commit
    /// (already committed or never reserved).
    #[tracing::instrument(skip(self), fields(key = %triple.key, version = %triple.version))]
    pub async fn commit_upload(&self, triple: &CacheTriple) -> EngineResult<Option<Uuid>> {
        let Some(upload) = self
            .metadata
            .find_upload(&triple.key, &triple.version, &triple.scope)
            .await?
        else {
            tracing::debug!("Nothing to commit");
            return Ok(None);
        };
        let upload_id = UploadId::from_raw(upload.id);

        let part_count = self
            .storage
            .count_files_in_folder(&parts_folder(&upload.folder_name))
            .await?;
        if part_count == 0 {
            return Err(EngineError::NoPartsUploaded { upload_id });
        }
        let part_count = i64::try_from(part_count)
            .map_err(|_| EngineError::InvalidInput(format!("{part_count} parts is too many")))?;

        let location = StorageLocationRow::new(&upload.folder_name, part_count);
        let Some(outcome) = self
            .metadata
            .commit_upload(upload.id, &location, Self::now())
            .await?
        else {
            tracing::debug!(upload_id = %upload_id, "Upload committed concurrently");
            return Ok(None);
        };

        tracing::info!(
            upload_id = %upload_id,
            entry_id = %outcome.entry_id,
            location_id = %outcome.location_id,
            part_count,
            replaced = outcome.replaced_location.is_some(),
            "Upload committed"
        );

        if let Some(previous) = outcome.replaced_location
            && let Err(e) = self.remove_location(&previous).await
        {
            // Left for orphan pruning.
            tracing::warn!(
                location_id = %previous.id,
                folder = %previous.folder_name,
                error = %e,
                "Failed to remove replaced storage location"
            );
        }

        Ok(Some(outcome.entry_id))
    }
}
