//! Error types for collective operations.

use thiserror::Error;
use vlpo_core::VlpoError;

/// Errors that can occur during distributed operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer is not a whole number of `f32` values.
    #[error("Buffer size error: expected multiple of {expected}, got {actual}")]
    BufferSize {
        /// Required byte multiple.
        expected: usize,
        /// Actual byte length.
        actual: usize,
    },

    /// Ranks contributed buffers of different lengths.
    #[error("All-reduce parameters mismatch: local has {local} elements, expected {expected}")]
    AllReduceParamsMismatch {
        /// Elements contributed by this rank.
        local: usize,
        /// Elements contributed by the first rank.
        expected: usize,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for distributed operations.
pub type DistributedResult<T> = std::result::Result<T, DistributedError>;

impl From<DistributedError> for VlpoError {
    fn from(err: DistributedError) -> Self {
        match err {
            DistributedError::Io(e) => VlpoError::Io(e),
            DistributedError::Config(msg) => VlpoError::Config(msg),
            other => VlpoError::Distributed(other.to_string()),
        }
    }
}
