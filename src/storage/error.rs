//! Storage error types
//!
//! Defines all errors that can occur while encoding chunks, writing or
//! reading segment files and reading legacy whisper files.

use crate::conversion::ConversionError;
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Segment file format error
    #[error("Invalid segment format: {0}")]
    InvalidSegment(String),

    /// Malformed legacy whisper file
    #[error("Invalid whisper file: {0}")]
    Whisper(String),

    /// Chunking parameters are unusable
    #[error("Invalid chunk parameters: {0}")]
    InvalidChunk(String),

    /// Planning or resampling rejected its input
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// A worker task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::Whisper("archive 2 exceeds file size".to_string());
        assert_eq!(err.to_string(), "Invalid whisper file: archive 2 exceeds file size");

        let err: StorageError = ConversionError::InvalidInput("no source archives".into()).into();
        assert_eq!(err.to_string(), "Invalid input: no source archives");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }
}
