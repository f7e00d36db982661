//! Error types for tabular conversion

use arrow::record_batch::RecordBatch;
use std::path::PathBuf;

/// Result type alias for conversion operations
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Error type for all conversion operations
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// Format identifier or file extension not recognised, or no codec for it
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Source file could not be decoded
    ///
    /// `partial` holds the rows decoded before the failure, when the reader
    /// had any, so the caller can show where the data went wrong.
    #[error("Read error: {message}")]
    Read {
        message: String,
        partial: Option<Box<RecordBatch>>,
    },

    /// Target file could not be encoded or written
    #[error("Write error: {0}")]
    Write(String),

    /// Declared schema does not fit the data's columns
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Column values could not be converted to the declared type
    #[error(
        "Cannot convert column '{column}' to {target}: {failed} value(s) failed, e.g. {samples:?}"
    )]
    TypeCoercion {
        column: String,
        target: String,
        failed: usize,
        samples: Vec<String>,
    },

    /// Compression kind is not accepted by the output format
    #[error("Compression '{compression}' is not supported for {format} output")]
    UnsupportedCompression { compression: String, format: String },

    /// Malformed row range, chunk size, level or other argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Input or schema file does not exist
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConvertError {
    /// Read error without partial rows
    pub fn read(message: impl Into<String>) -> Self {
        ConvertError::Read {
            message: message.into(),
            partial: None,
        }
    }

    /// Read error carrying the rows decoded before the failure
    pub fn read_with_partial(message: impl Into<String>, partial: RecordBatch) -> Self {
        ConvertError::Read {
            message: message.into(),
            partial: Some(Box::new(partial)),
        }
    }

    /// Rows attached to a read error, if any
    pub fn partial_rows(&self) -> Option<&RecordBatch> {
        match self {
            ConvertError::Read {
                partial: Some(batch),
                ..
            } => Some(batch),
            _ => None,
        }
    }

    /// Process exit status for this error
    ///
    /// - 2: invalid arguments (including unsupported compression)
    /// - 3: file not found
    /// - 4: unsupported format
    /// - 1: everything else
    pub fn exit_code(&self) -> i32 {
        match self {
            ConvertError::InvalidArgument(_) | ConvertError::UnsupportedCompression { .. } => 2,
            ConvertError::FileNotFound(_) => 3,
            ConvertError::UnsupportedFormat(_) => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ConvertError::UnsupportedFormat("xyz".into()).exit_code(), 4);
        assert_eq!(ConvertError::FileNotFound("a.csv".into()).exit_code(), 3);
        assert_eq!(ConvertError::InvalidArgument("rows".into()).exit_code(), 2);
        assert_eq!(
            ConvertError::UnsupportedCompression {
                compression: "snappy".into(),
                format: "csv".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(ConvertError::read("bad").exit_code(), 1);
        assert_eq!(ConvertError::Write("disk".into()).exit_code(), 1);
    }

    #[test]
    fn test_coercion_message_lists_samples() {
        let err = ConvertError::TypeCoercion {
            column: "age".into(),
            target: "int64".into(),
            failed: 2,
            samples: vec!["abc".into(), "x".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("'age'"));
        assert!(msg.contains("int64"));
        assert!(msg.contains("abc"));
    }
}
