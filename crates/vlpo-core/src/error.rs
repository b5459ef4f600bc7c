//! Error and warning types for vlpo.

use std::fmt;

use thiserror::Error;

/// Result type alias for vlpo operations.
pub type Result<T> = std::result::Result<T, VlpoError>;

/// Main error type for vlpo operations.
#[derive(Error, Debug)]
pub enum VlpoError {
    /// Missing files or directories, malformed annotations, unresolvable images.
    #[error("Data error: {0}")]
    Data(String),

    /// Tensor or candidate layout does not match what the pipeline requires.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    Shape {
        /// Where the mismatch was detected.
        context: String,
        /// Expected shape or count.
        expected: Vec<usize>,
        /// Actual shape or count.
        actual: Vec<usize>,
    },

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Training errors.
    #[error("Training error: {0}")]
    Training(String),

    /// Checkpoint read or write failures.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Tokenizer errors.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Collective communication failures.
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MLX backend errors.
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),
}

impl VlpoError {
    /// Build a shape error.
    pub fn shape(context: impl Into<String>, expected: Vec<usize>, actual: Vec<usize>) -> Self {
        Self::Shape {
            context: context.into(),
            expected,
            actual,
        }
    }
}

/// Non-fatal conditions that are logged and training continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NumericWarning {
    /// A merged sample contained no image placeholder.
    ZeroImageSample {
        /// Dataset index of the sample.
        index: usize,
    },
    /// No candidate in a collated batch carried an image.
    ZeroImageBatch {
        /// Number of rows in the batch.
        rows: usize,
    },
    /// A ranked group had too few valid candidates to form a pair.
    DegeneratePairGroup {
        /// Group position inside the batch.
        group: usize,
        /// Valid candidates left in the group.
        valid: usize,
    },
}

impl NumericWarning {
    /// Emit the warning through `tracing`.
    pub fn log(&self) {
        tracing::warn!("{}", self);
    }
}

impl fmt::Display for NumericWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroImageSample { index } => {
                write!(f, "sample {index} is an input without image")
            }
            Self::ZeroImageBatch { rows } => {
                write!(f, "batch of {rows} rows has no image")
            }
            Self::DegeneratePairGroup { group, valid } => write!(
                f,
                "ranked group {group} has {valid} valid candidates, dropping it"
            ),
        }
    }
}
