//! Conversion error types
//!
//! Errors raised by the planner, the resamplers and the reconciler. All of
//! them describe caller or configuration mistakes and are never retried.

use thiserror::Error;

/// Errors that can occur while converting archive data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// A resolution, retention or method argument is unusable
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ConversionError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ConversionError::InvalidInput(msg.into())
    }
}

/// Result type alias for conversion operations
pub type ConversionResult<T> = Result<T, ConversionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConversionError::invalid("resolutions must differ");
        assert_eq!(err.to_string(), "Invalid input: resolutions must differ");
    }
}
