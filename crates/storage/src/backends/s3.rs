//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, StorageAdapter, StreamingUpload, drain_into};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Prefix applied to every object when none is configured.
pub const DEFAULT_PREFIX: &str = "gh-actions-cache";

/// S3 requires all multipart parts except the last to be at least 5 MiB.
const PART_SIZE: usize = 5 * 1024 * 1024;

/// `DeleteObjects` accepts at most 1000 keys per request.
const DELETE_BATCH: usize = 1000;

/// Lifetime of pre-signed download URLs.
const PRESIGN_EXPIRY: Duration = Duration::from_secs(600);

/// Markers in lazy-credentials errors so they surface as configuration
/// problems rather than transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "hoard-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "hoard-s3-lazy-credentials-resolve";

/// Builds the AWS default credentials chain on the first signed request
/// instead of at construction time.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn chain(
        &self,
    ) -> Result<&aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        self.chain
            .get_or_try_init(|| async {
                let region = aws_config::Region::new(self.region.clone());
                tokio::task::spawn(async move {
                    aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                        .region(region)
                        .build()
                        .await
                })
                .await
                .map_err(|join_err| {
                    CredentialsError::provider_error(format!(
                        "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
                    ))
                })
            })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

/// Map an SDK error, classifying 404/403 and credential bootstrap failures.
fn map_sdk_error<E>(err: SdkError<E>, name: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(ref service_err) = err {
        match service_err.raw().status().as_u16() {
            404 => return StorageError::NotFound(name.to_string()),
            403 => return StorageError::PermissionDenied(format!("{name}: {err}")),
            _ => {}
        }
    }

    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure credentials explicitly or make ambient AWS credentials available."
                .to_string(),
        );
    }

    StorageError::Backend(Box::new(err))
}

/// Connection settings for [`S3Backend`].
#[derive(Clone, Debug, Default)]
pub struct S3Options {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

/// S3-compatible object store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Build a client. No network traffic happens here; use
    /// [`StorageAdapter::health_check`] to verify connectivity.
    pub async fn new(options: S3Options) -> StorageResult<Self> {
        let S3Options {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } = options;

        if access_key_id.is_some() != secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        builder = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => builder.credentials_provider(
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "hoard-config"),
            ),
            _ => builder.credentials_provider(LazyDefaultCredentialsProvider::new(region)),
        };

        if let Some(endpoint) = endpoint.as_deref().map(normalize_endpoint) {
            // Plain-http endpoints (local MinIO) get a client without native TLS roots.
            if endpoint.starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
            builder = builder.endpoint_url(endpoint);
        }

        if force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket,
            prefix: normalize_prefix(prefix),
        })
    }

    /// Full object key with the configured prefix applied.
    fn object_key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Listing prefix for a folder. Always ends in `/` so `12` does not match `123`.
    fn folder_prefix(&self, folder: &str) -> String {
        format!("{}/", self.object_key(folder.trim_end_matches('/')))
    }

    /// Every key under `folder`, one listing page at a time.
    fn list_folder<'a>(
        &'a self,
        folder: &str,
    ) -> impl futures::Stream<Item = StorageResult<Vec<String>>> + Send + 'a {
        let prefix = self.folder_prefix(folder);
        async_stream::try_stream! {
            let mut continuation: Option<String> = None;
            loop {
                let output = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&prefix)
                    .set_continuation_token(continuation.take())
                    .send()
                    .await
                    .map_err(|e| map_sdk_error(e, &prefix))?;

                let keys: Vec<String> = output
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string))
                    .collect();
                yield keys;

                match output.next_continuation_token() {
                    Some(token) if output.is_truncated() == Some(true) => {
                        continuation = Some(token.to_string());
                    }
                    _ => break,
                }
            }
        }
    }

    async fn delete_keys(&self, keys: Vec<String>) -> StorageResult<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::Backend(Box::new(e)))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StorageError::Backend(Box::new(e)))?;

            let output = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &batch[0]))?;

            if let Some(failed) = output.errors().first() {
                return Err(StorageError::Backend(
                    format!(
                        "failed to delete {} of {} objects, first: {} ({})",
                        output.errors().len(),
                        batch.len(),
                        failed.key().unwrap_or("<unknown>"),
                        failed.message().unwrap_or("no message"),
                    )
                    .into(),
                ));
            }
        }
        Ok(())
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

fn normalize_prefix(prefix: Option<String>) -> String {
    prefix
        .unwrap_or_else(|| DEFAULT_PREFIX.to_string())
        .trim_matches('/')
        .to_string()
}

#[async_trait]
impl StorageAdapter for S3Backend {
    #[instrument(skip(self, stream), fields(backend = "s3"))]
    async fn upload_stream(&self, name: &str, stream: ByteStream) -> StorageResult<()> {
        let key = self.object_key(name);
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, name))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Backend("S3 did not return an upload id".into()))?
            .to_string();

        let upload = Box::new(S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            upload_id,
            parts: Vec::new(),
            buffer: BytesMut::with_capacity(PART_SIZE),
            bytes_written: 0,
        });
        let written = drain_into(upload, stream).await?;
        tracing::debug!(bytes = written, "object written");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_download_stream(&self, name: &str) -> StorageResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(name))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, name))?;

        let stream = ReaderStream::new(output.body.into_async_read()).map_err(StorageError::Io);
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete_folder(&self, folder: &str) -> StorageResult<()> {
        // Collect first: deleting while paginating can shift continuation tokens.
        let keys: Vec<String> = self
            .list_folder(folder)
            .try_fold(Vec::new(), |mut acc, page| async move {
                acc.extend(page);
                Ok(acc)
            })
            .await?;

        if keys.is_empty() {
            return Ok(());
        }
        tracing::debug!(objects = keys.len(), "deleting folder");
        self.delete_keys(keys).await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn count_files_in_folder(&self, folder: &str) -> StorageResult<u64> {
        let prefix = self.folder_prefix(folder);
        let prefix = prefix.as_str();
        self.list_folder(folder)
            .try_fold(0u64, |count, page| async move {
                let direct = page.iter().filter(|key| is_direct_child(prefix, key)).count();
                Ok(count + direct as u64)
            })
            .await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_download_url(&self, name: &str) -> StorageResult<Option<String>> {
        let config = PresigningConfig::expires_in(PRESIGN_EXPIRY)
            .map_err(|e| StorageError::Config(format!("invalid presign expiry: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(name))
            .presigned(config)
            .await
            .map_err(|e| map_sdk_error(e, name))?;
        Ok(Some(request.uri().to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
        let marker = self.object_key(".hoard-health-check");

        let probe = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &marker))?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => match map_sdk_error(e, &marker) {
                    StorageError::NotFound(_) => Ok(()),
                    other => Err(other),
                },
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}

/// Multipart upload that buffers writes into 5 MiB parts.
struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    buffer: BytesMut,
    bytes_written: u64,
}

impl S3Upload {
    async fn send_part(&mut self, data: Bytes) -> StorageResult<()> {
        let part_number = self.parts.len() as i32 + 1;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.key))?;

        self.parts.push(
            CompletedPart::builder()
                .e_tag(output.e_tag().unwrap_or_default())
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }
}

#[async_trait]
impl StreamingUpload for S3Upload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.bytes_written += data.len() as u64;
        self.buffer.extend_from_slice(&data);

        while self.buffer.len() >= PART_SIZE {
            let part = self.buffer.split_to(PART_SIZE).freeze();
            self.send_part(part).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        if !self.buffer.is_empty() {
            let last = self.buffer.split().freeze();
            self.send_part(last).await?;
        }

        // Multipart uploads need at least one non-empty part; fall back to
        // PutObject for empty objects.
        if self.parts.is_empty() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&self.upload_id)
                .send()
                .await
            {
                tracing::warn!(key = %self.key, error = %e, "failed to abort empty multipart upload");
            }

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &self.key))?;
            return Ok(0);
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.key))?;

        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.key))?;
        Ok(())
    }
}

/// Whether `key` sits directly under `prefix` rather than in a nested folder.
fn is_direct_child(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}
