//! Error types for the regular-sparse library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum RscError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Matrix type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Sparsity pattern violation: {0}")]
    Pattern(#[from] PatternViolation),

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Ways the stored pattern of `A` can disagree with what an accumulation needs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternViolation {
    /// A random-effect column does not end in its own diagonal, so it cannot
    /// carry the identity seed.
    #[error("column {column} cannot hold the identity seed (last stored row: {last_row:?})")]
    IdentitySeed {
        column: usize,
        last_row: Option<usize>,
    },

    /// A column touched by an observation does not end in its diagonal.
    #[error("column {column} is not stored as the upper triangle (last stored row: {last_row:?})")]
    MissingDiagonal {
        column: usize,
        last_row: Option<usize>,
    },

    /// An off-diagonal needed by an observation is absent from the pattern.
    #[error("row {row} not found in column {column} while scanning observation {observation}")]
    PatternMismatch {
        column: usize,
        row: usize,
        observation: usize,
    },
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, RscError>;
