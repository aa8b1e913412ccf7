//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{CacheEntryRepo, StorageLocationRepo, UploadRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: CacheEntryRepo + StorageLocationRepo + UploadRepo + Send + Sync {
    /// Create tables and indexes if they do not exist.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
///
/// Timestamps are stored as RFC 3339 text; every comparison goes through
/// `julianday()` so ordering does not depend on the textual form. Key
/// prefixes are compared with `substr()`, which is exact and case-sensitive
/// where SQLite's `LIKE` is not.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers and avoids "database is locked".
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "SQLite metadata store ready");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| MetadataError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl CacheEntryRepo for SqliteStore {
        async fn find_exact(
            &self,
            key: &str,
            version: &str,
            scope: &str,
        ) -> MetadataResult<Option<CacheEntryRow>> {
            let row = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries WHERE key = ? AND version = ? AND scope = ?",
            )
            .bind(key)
            .bind(version)
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_newest_with_prefix(
            &self,
            prefix: &str,
            version: &str,
            scope: &str,
        ) -> MetadataResult<Option<CacheEntryRow>> {
            let row = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries
                 WHERE substr(key, 1, length(?1)) = ?1 AND version = ?2 AND scope = ?3
                 ORDER BY julianday(updated_at) DESC, updated_at DESC
                 LIMIT 1",
            )
            .bind(prefix)
            .bind(version)
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_cache_entry(&self, id: Uuid) -> MetadataResult<Option<CacheEntryRow>> {
            let row = sqlx::query_as::<_, CacheEntryRow>("SELECT * FROM cache_entries WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn touch_cache_entry(
            &self,
            id: Uuid,
            accessed_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query("UPDATE cache_entries SET accessed_at = ? WHERE id = ?")
                .bind(accessed_at)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn commit_upload(
            &self,
            upload_id: i64,
            location: &StorageLocationRow,
            committed_at: OffsetDateTime,
        ) -> MetadataResult<Option<CommitOutcome>> {
            // The DELETE is the first statement, so the transaction takes
            // SQLite's write lock before reading anything.
            let mut tx = self.pool.begin().await?;

            let claimed: Option<(String, String, String)> = sqlx::query_as(
                "DELETE FROM uploads WHERE id = ? RETURNING key, version, scope",
            )
            .bind(upload_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some((key, version, scope)) = claimed else {
                tx.rollback().await?;
                return Ok(None);
            };

            sqlx::query(
                "INSERT INTO storage_locations (id, folder_name, part_count) VALUES (?, ?, ?)",
            )
            .bind(location.id)
            .bind(&location.folder_name)
            .bind(location.part_count)
            .execute(&mut *tx)
            .await
            .map_err(|e| MetadataError::from_write(e, "storage location"))?;

            let existing = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries WHERE key = ? AND version = ? AND scope = ?",
            )
            .bind(&key)
            .bind(&version)
            .bind(&scope)
            .fetch_optional(&mut *tx)
            .await?;

            let (entry_id, replaced_location) = match existing {
                Some(entry) => {
                    let previous = sqlx::query_as::<_, StorageLocationRow>(
                        "SELECT * FROM storage_locations WHERE id = ?",
                    )
                    .bind(entry.location_id)
                    .fetch_optional(&mut *tx)
                    .await?;

                    sqlx::query(
                        "UPDATE cache_entries SET location_id = ?, updated_at = ?, accessed_at = ? WHERE id = ?",
                    )
                    .bind(location.id)
                    .bind(committed_at)
                    .bind(committed_at)
                    .bind(entry.id)
                    .execute(&mut *tx)
                    .await?;
                    (entry.id, previous)
                }
                None => {
                    let id = Uuid::new_v4();
                    sqlx::query(
                        "INSERT INTO cache_entries (id, key, version, scope, updated_at, accessed_at, location_id)
                         VALUES (?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(&key)
                    .bind(&version)
                    .bind(&scope)
                    .bind(committed_at)
                    .bind(committed_at)
                    .bind(location.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| MetadataError::from_write(e, "cache entry"))?;
                    (id, None)
                }
            };

            tx.commit().await?;

            Ok(Some(CommitOutcome {
                entry_id,
                location_id: location.id,
                replaced_location,
            }))
        }

        async fn list_stale_cache_entries(
            &self,
            accessed_before: Option<OffsetDateTime>,
            after: Option<Uuid>,
            limit: u32,
        ) -> MetadataResult<Vec<CacheEntryRow>> {
            let rows = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries
                 WHERE (?1 IS NULL OR julianday(accessed_at) < julianday(?1))
                   AND (?2 IS NULL OR id > ?2)
                 ORDER BY id
                 LIMIT ?3",
            )
            .bind(accessed_before)
            .bind(after)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_cache_entries(&self, ids: &[Uuid]) -> MetadataResult<Vec<Uuid>> {
            let mut tx = self.pool.begin().await?;
            let mut locations = Vec::with_capacity(ids.len());
            for id in ids {
                let location: Option<Uuid> = sqlx::query_scalar(
                    "DELETE FROM cache_entries WHERE id = ? RETURNING location_id",
                )
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
                locations.extend(location);
            }
            tx.commit().await?;
            Ok(locations)
        }

        async fn delete_cache_entries_by_key_prefix(
            &self,
            prefix: &str,
            scope: &str,
        ) -> MetadataResult<Vec<Uuid>> {
            let locations: Vec<Uuid> = sqlx::query_scalar(
                "DELETE FROM cache_entries
                 WHERE scope = ?1 AND substr(key, 1, length(?2)) = ?2
                 RETURNING location_id",
            )
            .bind(scope)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;
            Ok(locations)
        }
    }

    #[async_trait]
    impl StorageLocationRepo for SqliteStore {
        async fn get_location(&self, id: Uuid) -> MetadataResult<Option<StorageLocationRow>> {
            let row = sqlx::query_as::<_, StorageLocationRow>(
                "SELECT * FROM storage_locations WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_location_for_entry(
            &self,
            entry_id: Uuid,
        ) -> MetadataResult<Option<StorageLocationRow>> {
            let row = sqlx::query_as::<_, StorageLocationRow>(
                "SELECT l.* FROM storage_locations l
                 JOIN cache_entries e ON e.location_id = l.id
                 WHERE e.id = ?",
            )
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn folder_in_use(&self, folder_name: &str) -> MetadataResult<bool> {
            let in_use: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM storage_locations WHERE folder_name = ?)",
            )
            .bind(folder_name)
            .fetch_one(&self.pool)
            .await?;
            Ok(in_use)
        }

        async fn record_download(&self, id: Uuid, at: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query("UPDATE storage_locations SET last_downloaded_at = ? WHERE id = ?")
                .bind(at)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn claim_merge(&self, id: Uuid, at: OffsetDateTime) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE storage_locations SET merge_started_at = ?
                 WHERE id = ? AND merge_started_at IS NULL AND merged_at IS NULL",
            )
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn complete_merge(
            &self,
            id: Uuid,
            claimed_at: OffsetDateTime,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE storage_locations SET merged_at = ?
                 WHERE id = ? AND merge_started_at = ? AND merged_at IS NULL",
            )
            .bind(at)
            .bind(id)
            .bind(claimed_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn reset_merge(&self, id: Uuid, claimed_at: OffsetDateTime) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE storage_locations SET merge_started_at = NULL, merged_at = NULL
                 WHERE id = ? AND merge_started_at = ? AND merged_at IS NULL",
            )
            .bind(id)
            .bind(claimed_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn mark_parts_deleted(&self, id: Uuid, at: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query("UPDATE storage_locations SET parts_deleted_at = ? WHERE id = ?")
                .bind(at)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn reset_stalled_merges(
            &self,
            started_before: OffsetDateTime,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                "UPDATE storage_locations SET merge_started_at = NULL, merged_at = NULL
                 WHERE merge_started_at IS NOT NULL
                   AND merged_at IS NULL
                   AND julianday(merge_started_at) < julianday(?)",
            )
            .bind(started_before)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }

        async fn list_orphaned_locations(
            &self,
            after: Option<Uuid>,
            limit: u32,
        ) -> MetadataResult<Vec<StorageLocationRow>> {
            let rows = sqlx::query_as::<_, StorageLocationRow>(
                "SELECT l.* FROM storage_locations l
                 WHERE NOT EXISTS (SELECT 1 FROM cache_entries e WHERE e.location_id = l.id)
                   AND (?1 IS NULL OR l.id > ?1)
                 ORDER BY l.id
                 LIMIT ?2",
            )
            .bind(after)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_unreclaimed_locations(
            &self,
            merged_before: OffsetDateTime,
            after: Option<Uuid>,
            limit: u32,
        ) -> MetadataResult<Vec<StorageLocationRow>> {
            let rows = sqlx::query_as::<_, StorageLocationRow>(
                "SELECT * FROM storage_locations
                 WHERE merged_at IS NOT NULL
                   AND parts_deleted_at IS NULL
                   AND julianday(merged_at) < julianday(?1)
                   AND (?2 IS NULL OR id > ?2)
                 ORDER BY id
                 LIMIT ?3",
            )
            .bind(merged_before)
            .bind(after)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_storage_location(&self, id: Uuid) -> MetadataResult<bool> {
            let result = sqlx::query(
                "DELETE FROM storage_locations
                 WHERE id = ?1
                   AND NOT EXISTS (SELECT 1 FROM cache_entries WHERE location_id = ?1)",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }
    }

    #[async_trait]
    impl UploadRepo for SqliteStore {
        async fn reserve_upload(&self, upload: &UploadRow) -> MetadataResult<bool> {
            let result = sqlx::query(
                "INSERT INTO uploads (id, key, version, scope, created_at, last_part_uploaded_at,
                                      started_part_upload_count, finished_part_upload_count, folder_name)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT DO NOTHING",
            )
            .bind(upload.id)
            .bind(&upload.key)
            .bind(&upload.version)
            .bind(&upload.scope)
            .bind(upload.created_at)
            .bind(upload.last_part_uploaded_at)
            .bind(upload.started_part_upload_count)
            .bind(upload.finished_part_upload_count)
            .bind(&upload.folder_name)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn get_upload(&self, id: i64) -> MetadataResult<Option<UploadRow>> {
            let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn find_upload(
            &self,
            key: &str,
            version: &str,
            scope: &str,
        ) -> MetadataResult<Option<UploadRow>> {
            let row = sqlx::query_as::<_, UploadRow>(
                "SELECT * FROM uploads WHERE key = ? AND version = ? AND scope = ?",
            )
            .bind(key)
            .bind(version)
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn begin_part_upload(&self, id: i64) -> MetadataResult<Option<UploadRow>> {
            let row = sqlx::query_as::<_, UploadRow>(
                "UPDATE uploads SET started_part_upload_count = started_part_upload_count + 1
                 WHERE id = ?
                 RETURNING *",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn finish_part_upload(&self, id: i64, at: OffsetDateTime) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE uploads
                 SET finished_part_upload_count = finished_part_upload_count + 1,
                     last_part_uploaded_at = ?
                 WHERE id = ?",
            )
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn list_dangling_uploads(
            &self,
            idle_before: OffsetDateTime,
            after: Option<i64>,
            limit: u32,
        ) -> MetadataResult<Vec<UploadRow>> {
            let rows = sqlx::query_as::<_, UploadRow>(
                "SELECT * FROM uploads
                 WHERE julianday(COALESCE(last_part_uploaded_at, created_at)) < julianday(?1)
                   AND (?2 IS NULL OR id > ?2)
                 ORDER BY id
                 LIMIT ?3",
            )
            .bind(idle_before)
            .bind(after)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_dangling_upload(
            &self,
            id: i64,
            idle_before: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "DELETE FROM uploads
                 WHERE id = ?
                   AND julianday(COALESCE(last_part_uploaded_at, created_at)) < julianday(?)",
            )
            .bind(id)
            .bind(idle_before)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS storage_locations (
    id BLOB PRIMARY KEY NOT NULL,
    folder_name TEXT NOT NULL,
    part_count INTEGER NOT NULL CHECK (part_count >= 1),
    merge_started_at TEXT,
    merged_at TEXT,
    parts_deleted_at TEXT,
    last_downloaded_at TEXT
);

CREATE TABLE IF NOT EXISTS cache_entries (
    id BLOB PRIMARY KEY NOT NULL,
    key TEXT NOT NULL,
    version TEXT NOT NULL,
    scope TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    accessed_at TEXT NOT NULL,
    location_id BLOB NOT NULL UNIQUE REFERENCES storage_locations(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_entries_triple
    ON cache_entries(key, version, scope);
CREATE INDEX IF NOT EXISTS idx_cache_entries_version_scope
    ON cache_entries(version, scope);

CREATE TABLE IF NOT EXISTS uploads (
    id INTEGER PRIMARY KEY NOT NULL,
    key TEXT NOT NULL,
    version TEXT NOT NULL,
    scope TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_part_uploaded_at TEXT,
    started_part_upload_count INTEGER NOT NULL DEFAULT 0,
    finished_part_upload_count INTEGER NOT NULL DEFAULT 0,
    folder_name TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_uploads_triple
    ON uploads(key, version, scope);
"#;
