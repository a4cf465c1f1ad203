//! One storage interface, two interchangeable backends.
//!
//! ```no_run
//! use unistore::{Content, LocalStorage, PutOptions, StorageBackend};
//!
//! # async fn demo() -> unistore::StorageResult<()> {
//! let storage: Box<dyn StorageBackend> = Box::new(LocalStorage::new("/var/lib/app"));
//! storage.put("notes/today.txt", Content::from("hello"), &PutOptions::default()).await?;
//! assert!(storage.exists("notes/today.txt").await?);
//! # Ok(())
//! # }
//! ```

pub use unistore_backend::{
    Credentials, LocalConfig, LocalStorage, S3Config, S3Options, S3Storage, StorageConfig,
};
pub use unistore_common::{
    ChunkSender, ChunkStream, Content, ObjectStream, PutOptions, PutReceipt, SequenceClosed,
    StorageBackend, StorageError, StorageResult,
};
