//! Defines the failures a pipeline invocation may end with.

use crate::storage::StorageError;
use crate::transform::TransformError;
use thiserror::Error;

/// Every failure is terminal for its invocation and is converted into
/// an error response at the handler boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request is missing a required field or carries an invalid
    /// one. Raised before any collaborator is called.
    #[error("{0}")]
    ClientInput(String),

    /// The environment lacks required configuration. Raised before any
    /// I/O.
    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Failed to serialize status record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PipelineError {
    /// The HTTP status of the error response.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::ClientInput(_) => 400,
            _ => 500,
        }
    }

    /// Whether the failure came from storage rate-limiting.
    pub fn is_throttled(&self) -> bool {
        match self {
            PipelineError::Storage(e) => e.is_throttled(),
            _ => false,
        }
    }
}
