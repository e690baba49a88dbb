//! Error types for uamatch format operations

use std::fmt;

/// Errors that can occur while building, reading or validating a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Missing or malformed header
    InvalidHeader(String),
    /// Header version this reader does not understand
    UnsupportedVersion(u32),
    /// An offset, index or length points outside the buffer or section
    OutOfBounds(String),
    /// Record contents are inconsistent
    Corrupt(String),
    /// Builder input rejected
    InvalidInput(String),
    /// I/O error
    Io(String),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::InvalidHeader(msg) => write!(f, "Invalid header: {}", msg),
            FormatError::UnsupportedVersion(v) => write!(f, "Unsupported format version: {}", v),
            FormatError::OutOfBounds(msg) => write!(f, "Out of bounds: {}", msg),
            FormatError::Corrupt(msg) => write!(f, "Corrupt dataset: {}", msg),
            FormatError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            FormatError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for FormatError {}

impl From<std::io::Error> for FormatError {
    fn from(err: std::io::Error) -> Self {
        FormatError::Io(err.to_string())
    }
}
