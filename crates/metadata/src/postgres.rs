//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{CacheEntryRepo, StorageLocationRepo, UploadRepo, prefix_pattern};
use crate::store::MetadataStore;
use async_trait::async_trait;
use hoard_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect using a full connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        tracing::info!("Connecting to PostgreSQL using connection URL");
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Connect using individual parameters, so the password can come from
    /// its own environment variable.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }
        if let Some(pass) = password {
            opts = opts.password(pass);
        }
        if let Some(mode) = ssl_mode {
            opts = opts.ssl_mode(match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            });
        }

        tracing::info!(
            host,
            port,
            database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::debug!(timeout_ms, "PostgreSQL statement_timeout set");
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements cannot hold more than one command.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| MetadataError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheEntryRepo for PostgresStore {
    async fn find_exact(
        &self,
        key: &str,
        version: &str,
        scope: &str,
    ) -> MetadataResult<Option<CacheEntryRow>> {
        let row = sqlx::query_as::<_, CacheEntryRow>(
            "SELECT * FROM cache_entries WHERE key = $1 AND version = $2 AND scope = $3",
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
            r"SELECT * FROM cache_entries
              WHERE key LIKE $1 ESCAPE '\' AND version = $2 AND scope = $3
              ORDER BY updated_at DESC, id DESC
              LIMIT 1",
        )
        .bind(prefix_pattern(prefix))
        .bind(version)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_cache_entry(&self, id: Uuid) -> MetadataResult<Option<CacheEntryRow>> {
        let row = sqlx::query_as::<_, CacheEntryRow>("SELECT * FROM cache_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn touch_cache_entry(&self, id: Uuid, accessed_at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE cache_entries SET accessed_at = $1 WHERE id = $2")
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
        let mut tx = self.pool.begin().await?;

        let claimed: Option<(String, String, String)> =
            sqlx::query_as("DELETE FROM uploads WHERE id = $1 RETURNING key, version, scope")
                .bind(upload_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((key, version, scope)) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("INSERT INTO storage_locations (id, folder_name, part_count) VALUES ($1, $2, $3)")
            .bind(location.id)
            .bind(&location.folder_name)
            .bind(location.part_count)
            .execute(&mut *tx)
            .await
            .map_err(|e| MetadataError::from_write(e, "storage location"))?;

        let new_id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO cache_entries (id, key, version, scope, updated_at, accessed_at, location_id)
             VALUES ($1, $2, $3, $4, $5, $5, $6)
             ON CONFLICT (key, version, scope) DO NOTHING",
        )
        .bind(new_id)
        .bind(&key)
        .bind(&version)
        .bind(&scope)
        .bind(committed_at)
        .bind(location.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| MetadataError::from_write(e, "cache entry"))?;

        let (entry_id, replaced_location) = if inserted.rows_affected() == 1 {
            (new_id, None)
        } else {
            let entry = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries
                 WHERE key = $1 AND version = $2 AND scope = $3
                 FOR UPDATE",
            )
            .bind(&key)
            .bind(&version)
            .bind(&scope)
            .fetch_one(&mut *tx)
            .await?;

            let previous = sqlx::query_as::<_, StorageLocationRow>(
                "SELECT * FROM storage_locations WHERE id = $1",
            )
            .bind(entry.location_id)
            .fetch_optional(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE cache_entries SET location_id = $1, updated_at = $2, accessed_at = $2
                 WHERE id = $3",
            )
            .bind(location.id)
            .bind(committed_at)
            .bind(entry.id)
            .execute(&mut *tx)
            .await?;
            (entry.id, previous)
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
             WHERE ($1::timestamptz IS NULL OR accessed_at < $1)
               AND ($2::uuid IS NULL OR id > $2)
             ORDER BY id
             LIMIT $3",
        )
        .bind(accessed_before)
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_cache_entries(&self, ids: &[Uuid]) -> MetadataResult<Vec<Uuid>> {
        let locations: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM cache_entries WHERE id = ANY($1) RETURNING location_id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(locations)
    }

    async fn delete_cache_entries_by_key_prefix(
        &self,
        prefix: &str,
        scope: &str,
    ) -> MetadataResult<Vec<Uuid>> {
        let locations: Vec<Uuid> = sqlx::query_scalar(
            r"DELETE FROM cache_entries
              WHERE scope = $1 AND key LIKE $2 ESCAPE '\'
              RETURNING location_id",
        )
        .bind(scope)
        .bind(prefix_pattern(prefix))
        .fetch_all(&self.pool)
        .await?;
        Ok(locations)
    }
}

#[async_trait]
impl StorageLocationRepo for PostgresStore {
    async fn get_location(&self, id: Uuid) -> MetadataResult<Option<StorageLocationRow>> {
        let row =
            sqlx::query_as::<_, StorageLocationRow>("SELECT * FROM storage_locations WHERE id = $1")
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
             WHERE e.id = $1",
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn folder_in_use(&self, folder_name: &str) -> MetadataResult<bool> {
        let in_use: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM storage_locations WHERE folder_name = $1)",
        )
        .bind(folder_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(in_use)
    }

    async fn record_download(&self, id: Uuid, at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE storage_locations SET last_downloaded_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_merge(&self, id: Uuid, at: OffsetDateTime) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE storage_locations SET merge_started_at = $1
             WHERE id = $2 AND merge_started_at IS NULL AND merged_at IS NULL",
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
            "UPDATE storage_locations SET merged_at = $1
             WHERE id = $2 AND merge_started_at = $3 AND merged_at IS NULL",
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
             WHERE id = $1 AND merge_started_at = $2 AND merged_at IS NULL",
        )
        .bind(id)
        .bind(claimed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_parts_deleted(&self, id: Uuid, at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE storage_locations SET parts_deleted_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_stalled_merges(&self, started_before: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE storage_locations SET merge_started_at = NULL, merged_at = NULL
             WHERE merge_started_at < $1 AND merged_at IS NULL",
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
               AND ($1::uuid IS NULL OR l.id > $1)
             ORDER BY l.id
             LIMIT $2",
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
             WHERE merged_at < $1
               AND parts_deleted_at IS NULL
               AND ($2::uuid IS NULL OR id > $2)
             ORDER BY id
             LIMIT $3",
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
             WHERE id = $1
               AND NOT EXISTS (SELECT 1 FROM cache_entries WHERE location_id = $1)",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl UploadRepo for PostgresStore {
    async fn reserve_upload(&self, upload: &UploadRow) -> MetadataResult<bool> {
        let result = sqlx::query(
            "INSERT INTO uploads (id, key, version, scope, created_at, last_part_uploaded_at,
                                  started_part_upload_count, finished_part_upload_count, folder_name)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = $1")
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
            "SELECT * FROM uploads WHERE key = $1 AND version = $2 AND scope = $3",
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
             WHERE id = $1
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
                 last_part_uploaded_at = $1
             WHERE id = $2",
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
             WHERE COALESCE(last_part_uploaded_at, created_at) < $1
               AND ($2::bigint IS NULL OR id > $2)
             ORDER BY id
             LIMIT $3",
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
             WHERE id = $1 AND COALESCE(last_part_uploaded_at, created_at) < $2",
        )
        .bind(id)
        .bind(idle_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::{POSTGRES_SCHEMA, postgres_schema_statements};

    #[test]
    fn postgres_schema_statements_skips_empty_and_comment_only() {
        let schema = r#"
            -- comment only

            CREATE TABLE foo (id int);
            ;
            -- another comment
            CREATE TABLE bar (id int);
        "#;

        let statements = postgres_schema_statements(schema);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE foo"));
        assert!(statements[1].contains("CREATE TABLE bar"));
    }

    #[test]
    fn embedded_schema_creates_every_table() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        for table in ["storage_locations", "cache_entries", "uploads"] {
            assert!(
                statements
                    .iter()
                    .any(|s| s.contains(&format!("CREATE TABLE IF NOT EXISTS {table}"))),
                "missing {table}"
            );
        }
    }
}
