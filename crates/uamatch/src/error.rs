//! Error types for the uamatch library
//!
//! Not finding a device is never an error: it resolves to the default
//! profiles with method `None`. Errors mean the dataset itself is unusable
//! or the caller asked for something the dataset does not define.

use thiserror::Error;

/// Main error type for uamatch operations
#[derive(Error, Debug)]
pub enum UamatchError {
    /// The dataset has been disposed and can no longer be read
    #[error("dataset has been disposed")]
    Disposed,

    /// A property name the dataset does not define
    #[error("property '{property}' is not present in dataset '{dataset}'")]
    UnknownProperty {
        /// Requested property name
        property: String,
        /// Name of the dataset that was searched
        dataset: String,
    },

    /// Error from dataset format operations (corrupt or out-of-range data)
    #[error(transparent)]
    Format(#[from] uamatch_format::FormatError),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for uamatch operations
pub type Result<T> = std::result::Result<T, UamatchError>;

// Re-export component error types for users who need them
pub use uamatch_format::FormatError;
