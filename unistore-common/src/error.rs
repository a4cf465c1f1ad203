use std::string::FromUtf8Error;

/// Errors surfaced by every storage backend.
///
/// `NotFound` is the one condition that looks the same regardless of which
/// backend produced it. `Transport` and `Remote` are both faults on the way
/// to or from an object store; the former never got an HTTP answer, the
/// latter got a non-success one.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Object store returned HTTP {status} ({code}): {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Content is not valid UTF-8: {0}")]
    Encoding(#[from] FromUtf8Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn transport(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        StorageError::Transport(err.into())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(e.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

/// Reject keys that cannot address anything.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::Validation("key must not be empty".to_string()));
    }
    if key.contains('\0') {
        return Err(StorageError::Validation(format!(
            "key must not contain NUL bytes: {:?}",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: StorageError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_not_found());

        let err: StorageError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("a/b.txt").is_ok());
        assert!(matches!(validate_key(""), Err(StorageError::Validation(_))));
        assert!(matches!(validate_key("a\0b"), Err(StorageError::Validation(_))));
    }

    #[test]
    fn test_remote_error_display() {
        let err = StorageError::Remote {
            status: 403,
            code: "AccessDenied".to_string(),
            message: "Access Denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Object store returned HTTP 403 (AccessDenied): Access Denied"
        );
    }
}
