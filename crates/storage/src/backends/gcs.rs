//! Google Cloud Storage backend built on `object_store`.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, StorageAdapter};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::gcp::{GoogleCloudStorage, GoogleCloudStorageBuilder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{ObjectStore, WriteMultipart};
use std::path::PathBuf;
use std::time::Duration;
use tracing::instrument;

/// Prefix applied to every object when none is configured.
pub const DEFAULT_PREFIX: &str = "gh-actions-cache";

/// Parts in flight per multipart upload before writes apply backpressure.
const MAX_CONCURRENT_PARTS: usize = 8;

/// Lifetime of signed download URLs.
const SIGNED_URL_EXPIRY: Duration = Duration::from_secs(600);

/// Google Cloud Storage object store.
#[derive(Debug)]
pub struct GcsBackend {
    store: GoogleCloudStorage,
    prefix: String,
}

impl GcsBackend {
    /// Build a client for `bucket`. Credentials come from the service account
    /// key file when given, otherwise from the environment (`GOOGLE_*`
    /// variables or application default credentials).
    pub fn new(
        bucket: &str,
        service_account_key: Option<PathBuf>,
        prefix: Option<String>,
    ) -> StorageResult<Self> {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(key) = service_account_key {
            builder = builder.with_service_account_path(key.to_string_lossy());
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::Config(format!("gcs: {e}")))?;

        Ok(Self {
            store,
            prefix: prefix
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string())
                .trim_matches('/')
                .to_string(),
        })
    }

    fn object_path(&self, name: &str) -> StorageResult<ObjectPath> {
        let full = if self.prefix.is_empty() {
            name.trim_matches('/').to_string()
        } else {
            format!("{}/{}", self.prefix, name.trim_matches('/'))
        };
        ObjectPath::parse(&full).map_err(|e| StorageError::InvalidKey(format!("{name}: {e}")))
    }
}

fn map_gcs_error(err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
        object_store::Error::PermissionDenied { path, source }
        | object_store::Error::Unauthenticated { path, source } => {
            StorageError::PermissionDenied(format!("{path}: {source}"))
        }
        other => StorageError::Backend(Box::new(other)),
    }
}

#[async_trait]
impl StorageAdapter for GcsBackend {
    #[instrument(skip(self, stream), fields(backend = "gcs"))]
    async fn upload_stream(&self, name: &str, mut stream: ByteStream) -> StorageResult<()> {
        let path = self.object_path(name)?;
        let upload = self
            .store
            .put_multipart(&path)
            .await
            .map_err(map_gcs_error)?;
        let mut writer = WriteMultipart::new(upload);

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Err(abort_err) = writer.abort().await {
                        tracing::warn!(error = %abort_err, "failed to abort multipart upload");
                    }
                    return Err(e);
                }
            };
            if let Err(e) = writer.wait_for_capacity(MAX_CONCURRENT_PARTS).await {
                return Err(map_gcs_error(e));
            }
            writer.put(chunk);
        }

        writer.finish().await.map_err(map_gcs_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "gcs"))]
    async fn create_download_stream(&self, name: &str) -> StorageResult<ByteStream> {
        let path = self.object_path(name)?;
        let result = self.store.get(&path).await.map_err(map_gcs_error)?;
        Ok(Box::pin(result.into_stream().map_err(map_gcs_error)))
    }

    #[instrument(skip(self), fields(backend = "gcs"))]
    async fn delete_folder(&self, folder: &str) -> StorageResult<()> {
        let prefix = self.object_path(folder)?;
        let locations = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location)
            .boxed();

        let mut deleted = self.store.delete_stream(locations);
        while let Some(result) = deleted.next().await {
            match result {
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(map_gcs_error(e)),
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "gcs"))]
    async fn count_files_in_folder(&self, folder: &str) -> StorageResult<u64> {
        let prefix = self.object_path(folder)?;
        let listing = self
            .store
            .list_with_delimiter(Some(&prefix))
            .await
            .map_err(map_gcs_error)?;
        Ok(listing.objects.len() as u64)
    }

    #[instrument(skip(self), fields(backend = "gcs"))]
    async fn create_download_url(&self, name: &str) -> StorageResult<Option<String>> {
        let path = self.object_path(name)?;
        let url = self
            .store
            .signed_url(http::Method::GET, &path, SIGNED_URL_EXPIRY)
            .await
            .map_err(map_gcs_error)?;
        Ok(Some(url.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "gcs"
    }
}
