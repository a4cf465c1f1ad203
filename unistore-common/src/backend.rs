use std::collections::BTreeMap;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::content::Content;
use crate::error::StorageResult;

/// Lazily-consumed object body. Nothing is opened or requested until the
/// stream is first polled; failures, not-found included, arrive as items.
pub type ObjectStream = BoxStream<'static, StorageResult<Bytes>>;

/// Trait implemented by all storage backends.
///
/// A handle is bound to one root (a directory or a bucket) for its whole
/// lifetime and holds only configuration, so it may serve any number of
/// concurrent calls. Concurrent writes to the same key race; the last one
/// to finish wins.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the whole object into memory.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Read the whole object and decode it as UTF-8 text.
    async fn get_string(&self, key: &str) -> StorageResult<String> {
        let data = self.get(key).await?;
        Ok(String::from_utf8(data.to_vec())?)
    }

    /// Stream the object from its first byte.
    fn get_stream(&self, key: &str) -> ObjectStream;

    /// Write `content` at `key`, replacing whatever was there.
    async fn put(
        &self,
        key: &str,
        content: Content,
        options: &PutOptions,
    ) -> StorageResult<PutReceipt>;

    /// Delete the object. Deleting an absent key succeeds.
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// Whether a `get` issued now would succeed. Absence is `Ok(false)`,
    /// never an error.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// URI for `key`. Pure: performs no I/O and does not imply existence.
    fn get_location(&self, key: &str) -> String;
}

/// Per-upload settings. Only the remote backend reads them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Wins over the type guessed from the key's extension.
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub storage_class: Option<String>,
    /// User metadata, sent as `x-amz-meta-<name>` headers.
    pub metadata: BTreeMap<String, String>,
}

impl PutOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }

    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }
}

/// Acknowledgement of a completed `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub key: String,
    pub location: String,
    /// Entity tag reported by the object store, without quotes.
    pub etag: Option<String>,
    pub size: u64,
}
