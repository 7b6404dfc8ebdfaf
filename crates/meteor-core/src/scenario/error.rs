//! Errors raised while decoding a scenario file.

use std::io;

/// Result type for scenario decoding.
pub type Result<T> = std::result::Result<T, ScenarioError>;

/// Errors that can occur while reading a binary scenario file.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// Underlying file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read returned fewer bytes than the fixed-size record requires.
    #[error("truncated scenario file: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected byte count for the record being decoded.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// The header failed a structural invariant (e.g. bad signature).
    #[error("invalid scenario header: {0}")]
    InvalidHeader(String),

    /// A count field violated its documented invariant.
    #[error("invalid {field}: {value}")]
    InvalidCount {
        /// Name of the offending field.
        field: &'static str,
        /// The out-of-range value encountered.
        value: i64,
    },
}
