//! Defines the object storage surface consumed by the pipeline.

use async_trait::async_trait;
use thiserror::Error;

/// Error codes that storage services use to signal rate limiting.
const THROTTLING_CODES: [&str; 5] = [
    "SlowDown",
    "TooManyRequests",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
];

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {}", s))
        .unwrap_or_default()
}

/// A failed storage operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested object doesn't exist.
    #[error("The specified object {key:?} does not exist in container {container:?}")]
    NotFound { container: String, key: String },

    /// The storage service rejected or failed the operation.
    #[error("{operation} failed{}: {message}", status_suffix(.status))]
    Service {
        operation: String,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },
}

impl StorageError {
    /// The HTTP status reported by the storage service, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::NotFound { .. } => Some(404),
            StorageError::Service { status, .. } => *status,
        }
    }

    /// Whether the storage service is rate-limiting the caller.
    pub fn is_throttled(&self) -> bool {
        match self {
            StorageError::NotFound { .. } => false,
            StorageError::Service { status, code, .. } => {
                *status == Some(429)
                    || code
                        .as_deref()
                        .map(|c| THROTTLING_CODES.contains(&c))
                        .unwrap_or(false)
            }
        }
    }
}

/// A key/blob store partitioned into named containers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether the container exists.
    async fn exists(&self, container: &str) -> Result<bool, StorageError>;

    /// Creates the container.
    async fn create(&self, container: &str) -> Result<(), StorageError>;

    /// Reads a whole object, accumulating every chunk of its body.
    async fn download(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Writes an object, replacing any existing one under the same key.
    async fn upload(
        &self,
        container: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;
}
