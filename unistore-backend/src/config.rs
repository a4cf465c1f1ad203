use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use unistore_common::StorageBackend;

use crate::local::LocalStorage;
use crate::s3::{Credentials, S3Options, S3Storage};

/// Storage handle description, as read from a TOML file.
///
/// ```toml
/// backend = "s3"
/// bucket = "media"
/// region = "eu-west-1"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    Local(LocalConfig),
    S3(S3Config),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StorageConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: StorageConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        match self {
            StorageConfig::Local(local) => {
                if local.root.as_os_str().is_empty() {
                    anyhow::bail!("root must not be empty");
                }
            }
            StorageConfig::S3(s3) => {
                if s3.bucket.is_empty() {
                    anyhow::bail!("bucket must not be empty");
                }
                if let Some(ep) = &s3.endpoint {
                    if !ep.starts_with("http://") && !ep.starts_with("https://") {
                        anyhow::bail!("endpoint must be an http(s) URL: {}", ep);
                    }
                }
                if let Some(cred) = &s3.credentials {
                    if cred.access_key_id.is_empty() || cred.secret_access_key.is_empty() {
                        anyhow::bail!(
                            "credentials must set both access_key_id and secret_access_key"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Construct the backend this config describes.
    pub fn open(self) -> anyhow::Result<Box<dyn StorageBackend>> {
        match self {
            StorageConfig::Local(local) => {
                let storage = LocalStorage::new(local.root);
                info!(backend = "local", root = %storage.root().display(), "Storage backend ready");
                Ok(Box::new(storage))
            }
            StorageConfig::S3(s3) => {
                let options = S3Options {
                    region: s3.region,
                    endpoint: s3.endpoint,
                    credentials: s3.credentials,
                    timeout_secs: s3.timeout_secs,
                };
                let storage = S3Storage::new(s3.bucket, options)?;
                info!(
                    backend = "s3",
                    bucket = %storage.bucket(),
                    region = %storage.region(),
                    "Storage backend ready"
                );
                Ok(Box::new(storage))
            }
        }
    }
}
