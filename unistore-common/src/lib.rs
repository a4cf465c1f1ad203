pub mod backend;
pub mod content;
pub mod error;

pub use backend::{ObjectStream, PutOptions, PutReceipt, StorageBackend};
pub use content::{ChunkSender, ChunkStream, Content, SequenceClosed};
pub use error::{validate_key, StorageError, StorageResult};
