//! Error type shared by all gammafit crates

use thiserror::Error;

/// Errors raised while building or evaluating a likelihood
#[derive(Error, Debug)]
pub enum Error {
    /// Reading an input file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON input
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad input: malformed table, unknown pixel or bin, mismatched nside
    #[error("invalid input: {0}")]
    Validation(String),

    /// Value outside the domain of a formula, such as a zero expectation for observed counts
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Minimizer or transform failure
    #[error("computation failed: {0}")]
    Computation(String),
}

/// `Result` with [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
