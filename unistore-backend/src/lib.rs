//! Concrete storage backends: a local directory tree and an S3-compatible
//! bucket, plus the TOML configuration that picks between them.

pub mod config;
pub mod local;
pub mod s3;

pub use config::{LocalConfig, S3Config, StorageConfig};
pub use local::LocalStorage;
pub use s3::{content_type_for, Credentials, S3Options, S3Storage};
