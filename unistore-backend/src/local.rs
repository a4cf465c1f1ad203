//! Local directory backend.
//!
//! Stores each object as a file under a root directory. Uses atomic write
//! (temp file → fsync → rename) so a reader never observes a partial object
//! and a failed put leaves the previous content in place.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

use unistore_common::{
    validate_key, Content, ObjectStream, PutOptions, PutReceipt, StorageBackend, StorageError,
    StorageResult,
};

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Bind to `root`. The directory is not checked here; a bad root only
    /// shows up when an operation touches it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root: normalize(&root) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys are trusted: `..` is resolved, not rejected, and an absolute key
    /// replaces the root.
    fn resolve(&self, key: &str) -> PathBuf {
        normalize(&self.root.join(key))
    }

    fn full_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        let path = self.resolve(key);
        if path == self.root || path.file_name().is_none() {
            return Err(StorageError::Validation(format!(
                "key does not name a file: {:?}",
                key
            )));
        }
        Ok(path)
    }
}

/// Lexically collapse `.` and `..` components without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

fn not_found_or_io(key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

/// Write `content` to `tmp_path`, fsync it, and rename it onto `dest`.
/// Returns the number of bytes written.
async fn write_atomic(tmp_path: &Path, dest: &Path, content: Content) -> StorageResult<u64> {
    let mut file = fs::File::create(tmp_path)
        .await
        .map_err(StorageError::Io)?;

    let size = match content {
        Content::Bytes(data) => {
            file.write_all(&data).await.map_err(StorageError::Io)?;
            data.len() as u64
        }
        Content::Reader(mut reader) => tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(StorageError::Io)?,
        Content::Sequence(mut chunks) => {
            let mut written = 0u64;
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(StorageError::Io)?;
                file.write_all(&chunk).await.map_err(StorageError::Io)?;
                written += chunk.len() as u64;
            }
            written
        }
    };

    file.flush().await.map_err(StorageError::Io)?;
    file.sync_all().await.map_err(StorageError::Io)?;
    drop(file);

    fs::rename(tmp_path, dest).await.map_err(StorageError::Io)?;
    Ok(size)
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn get(&self, key: &str) -> StorageResult<bytes::Bytes> {
        let path = self.full_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        Ok(bytes::Bytes::from(data))
    }

    fn get_stream(&self, key: &str) -> ObjectStream {
        let key = key.to_string();
        let path = self.full_path(&key);
        stream::once(async move {
            let path = path?;
            let file = fs::File::open(&path)
                .await
                .map_err(|e| not_found_or_io(&key, e))?;
            Ok::<_, StorageError>(ReaderStream::new(file).map_err(StorageError::Io))
        })
        .try_flatten()
        .boxed()
    }

    async fn put(
        &self,
        key: &str,
        content: Content,
        _options: &PutOptions,
    ) -> StorageResult<PutReceipt> {
        let dest = self.full_path(key)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(StorageError::Io)?;
        }

        let tmp_path = temp_path(&dest);
        let kind = content.kind();
        let size = match write_atomic(&tmp_path, &dest, content).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&tmp_path).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            path = %tmp_path.display(),
                            error = %cleanup,
                            "Failed to remove temp file"
                        );
                    }
                }
                return Err(e);
            }
        };

        debug!(key = %key, content = kind, size, "Local put complete");
        Ok(PutReceipt {
            key: key.to_string(),
            location: self.get_location(key),
            etag: None,
            size,
        })
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.full_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "Local remove complete");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.full_path(key)?;
        // Anything that would stop a read, permission included, reads as absent.
        let readable = match fs::File::open(&path).await {
            Ok(file) => file.metadata().await.map(|m| m.is_file()).unwrap_or(false),
            Err(_) => false,
        };
        Ok(readable)
    }

    fn get_location(&self, key: &str) -> String {
        format!("file://{}", self.resolve(key).display())
    }
}
