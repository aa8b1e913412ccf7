//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, StorageAdapter, StreamingUpload, drain_into};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Marker embedded in in-progress file names. Such files are never counted.
const TEMP_MARKER: &str = ".tmp.";

/// Object storage rooted at a local directory.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create the backend, creating `root` if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `name` under the root, rejecting anything that would escape it.
    async fn resolve(&self, name: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || resolve_sync(&root, &name))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }
}

/// Lexical checks first, then symlink checks against the canonical root.
fn resolve_sync(root: &Path, name: &str) -> StorageResult<PathBuf> {
    if name.is_empty() || name.starts_with('/') || name.starts_with('\\') {
        return Err(StorageError::InvalidKey(format!(
            "object name must be relative: {name:?}"
        )));
    }
    if Path::new(name)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {name}"
        )));
    }

    let path = root.join(name);
    let root_canonical = root.canonicalize()?;

    // Nearest existing ancestor (or the path itself) must stay inside the root,
    // otherwise a symlink could redirect reads or writes outside it.
    let mut probe = Some(path.as_path());
    while let Some(candidate) = probe {
        match std::fs::symlink_metadata(candidate) {
            Ok(meta) => {
                let canonical = candidate.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!("dangling symlink in path: {name}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {name}"
                    )));
                }
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                probe = candidate.parent();
            }
            Err(e) => return Err(StorageError::Io(e)),
        }
    }

    Ok(path)
}

fn not_found_or_io(name: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(name.to_string())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl StorageAdapter for FilesystemBackend {
    #[instrument(skip(self, stream), fields(backend = "filesystem"))]
    async fn upload_stream(&self, name: &str, stream: ByteStream) -> StorageResult<()> {
        let path = self.resolve(name).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Unique temp name so concurrent writers to the same object never share a file.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!("{file_name}{TEMP_MARKER}{}", Uuid::new_v4()));
        let file = fs::File::create(&temp_path).await?;

        let upload = Box::new(FilesystemUpload {
            file,
            temp_path,
            final_path: path,
            bytes_written: 0,
        });
        let written = drain_into(upload, stream).await?;
        tracing::debug!(bytes = written, "object written");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn create_download_stream(&self, name: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.resolve(name).await?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(name, e))?;

        let stream = async_stream::try_stream! {
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_folder(&self, folder: &str) -> StorageResult<()> {
        let path = self.resolve(folder).await?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn count_files_in_folder(&self, folder: &str) -> StorageResult<u64> {
        let path = self.resolve(folder).await?;
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            // file_type() does not follow symlinks
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().contains(TEMP_MARKER) {
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Config(format!(
                "storage root is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

/// In-progress write to a temp file, renamed into place on finish.
struct FilesystemUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{StreamExt, TryStreamExt, stream};

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        let items: Vec<StorageResult<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        Box::pin(stream::iter(items))
    }

    async fn read_all(backend: &FilesystemBackend, name: &str) -> Vec<u8> {
        let stream = backend.create_download_stream(name).await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend
            .upload_stream("1234/parts/0", chunks(&[b"hello ", b"world"]))
            .await
            .unwrap();

        assert_eq!(read_all(&backend, "1234/parts/0").await, b"hello world");
    }

    #[tokio::test]
    async fn test_upload_replaces_existing_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend.upload_stream("a/b", chunks(&[b"first"])).await.unwrap();
        backend.upload_stream("a/b", chunks(&[b"second"])).await.unwrap();

        assert_eq!(read_all(&backend, "a/b").await, b"second");
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let failing: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(StorageError::Aborted("client went away".into())),
        ]));
        let result = backend.upload_stream("f/parts/0", failing).await;
        assert!(matches!(result, Err(StorageError::Aborted(_))));

        assert_eq!(backend.count_files_in_folder("f/parts").await.unwrap(), 0);
        assert!(matches!(
            backend.create_download_stream("f/parts/0").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        match backend.create_download_stream("nope/merged").await {
            Err(e) => assert!(e.is_not_found()),
            Ok(_) => panic!("expected NotFound"),
        }
    }

    #[tokio::test]
    async fn test_delete_folder_is_recursive_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend.upload_stream("x/parts/0", chunks(&[b"0"])).await.unwrap();
        backend.upload_stream("x/parts/1", chunks(&[b"1"])).await.unwrap();
        backend.upload_stream("x/merged", chunks(&[b"01"])).await.unwrap();

        backend.delete_folder("x").await.unwrap();
        assert!(!dir.path().join("x").exists());

        backend.delete_folder("x").await.unwrap();
        backend.delete_folder("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_count_ignores_temp_files_and_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend.upload_stream("c/parts/0", chunks(&[b"a"])).await.unwrap();
        backend.upload_stream("c/parts/1", chunks(&[b"b"])).await.unwrap();
        std::fs::write(dir.path().join("c/parts/2.tmp.abandoned"), b"z").unwrap();
        std::fs::create_dir_all(dir.path().join("c/parts/nested")).unwrap();

        assert_eq!(backend.count_files_in_folder("c/parts").await.unwrap(), 2);
        assert_eq!(backend.count_files_in_folder("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_into_same_folder() {
        let dir = tempfile::tempdir().unwrap();
        let backend = std::sync::Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());

        let tasks: Vec<_> = (0..8u32)
            .map(|i| {
                let backend = backend.clone();
                tokio::spawn(async move {
                    let body = Bytes::from(vec![i as u8; 100_000]);
                    let s: ByteStream = Box::pin(stream::once(async move { Ok(body) }));
                    backend
                        .upload_stream(&format!("p/parts/{i}"), s)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(backend.count_files_in_folder("p/parts").await.unwrap(), 8);
        for i in 0..8u32 {
            let data = read_all(&backend, &format!("p/parts/{i}")).await;
            assert_eq!(data.len(), 100_000);
            assert!(data.iter().all(|b| *b == i as u8));
        }
    }

    #[tokio::test]
    async fn test_large_object_streams_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let body = Bytes::from(vec![7u8; STREAM_CHUNK_SIZE * 3 + 10]);
        let s: ByteStream = Box::pin(stream::once({
            let body = body.clone();
            async move { Ok(body) }
        }));
        backend.upload_stream("big/merged", s).await.unwrap();

        let stream = backend.create_download_stream("big/merged").await.unwrap();
        let sizes: Vec<usize> = stream.map(|c| c.unwrap().len()).collect().await;
        assert_eq!(sizes.len(), 4);
        assert_eq!(sizes.iter().sum::<usize>(), body.len());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        for name in ["../escape", "/absolute/path", "foo/../bar", "./x", ""] {
            assert!(
                matches!(
                    backend.count_files_in_folder(name).await,
                    Err(StorageError::InvalidKey(_))
                ),
                "{name:?} should be rejected"
            );
        }
        assert!(backend.count_files_in_folder("valid/nested").await.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlinked_folder_rejected() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        symlink(outside.path(), dir.path().join("escape")).unwrap();

        let result = backend
            .upload_stream("escape/nested/parts/0", chunks(&[b"data"]))
            .await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
        assert!(!outside.path().join("nested").exists());

        let result = backend.delete_folder("escape").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }
}
