//! uamatch dataset file format
//!
//! This crate provides the binary layout of a device detection dataset:
//! - Fixed header and offset-indexed entity sections (strings, components,
//!   properties, values, profiles, signatures, nodes)
//! - A builder that derives the node trie and indexes from example user agents
//! - Structural validation for untrusted buffers
//!
//! Readers fetch single records by index, so the same layout serves
//! memory-resident datasets and datasets read lazily from a stream.

// Public modules
pub mod builder;
pub mod error;
pub mod offset_format;
mod validation;

pub use validation::{validate_dataset, FormatStats, FormatValidationResult};

// Re-exports for convenience
pub use builder::{ComponentRef, DatasetBuilder, PropertyRef};
pub use error::FormatError;
pub use offset_format::*;
