//! Uamatch - Device Detection from User-Agent Strings
//!
//! Uamatch identifies the hardware, operating system and browser behind an
//! HTTP User-Agent by matching it against a precompiled dataset of
//! signatures. Each signature is a set of substrings (nodes) at fixed
//! character positions; a match finds the nodes present in the target and
//! the signature they identify, tolerating numeric version differences and
//! small character differences when no signature fits exactly.
//!
//! # Quick Start
//!
//! ```rust
//! use uamatch::{Dataset, DatasetBuilder, MatchMethod, Provider, ValueType};
//!
//! let mut builder = DatasetBuilder::new("quickstart").min_user_agent_length(8);
//! let browser = builder.add_component("Browser", &["User-Agent"]);
//! let name = builder.add_property(browser, "BrowserName", ValueType::String, Some("Unknown"))?;
//! builder.add_profile(browser, 10, &[])?;
//! builder.add_profile(browser, 11, &[(name, "Chrome")])?;
//! builder.set_default_profile(browser, 10)?;
//! builder.add_signature("Mozilla/5.0 Chrome/120", &["Chrome/120"], &[11])?;
//! let bytes = builder.build()?;
//!
//! let provider = Provider::new(Dataset::from_bytes(bytes)?);
//!
//! let result = provider.match_user_agent("Mozilla/5.0 Chrome/120")?;
//! assert_eq!(result.method(), MatchMethod::Exact);
//! assert_eq!(result.values("BrowserName")?.to_string(), "Chrome");
//!
//! // Too short to match: every component takes its default profile
//! let result = provider.match_user_agent("")?;
//! assert_eq!(result.method(), MatchMethod::None);
//! assert_eq!(result.values("BrowserName")?.to_string(), "Unknown");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Match methods
//!
//! Stages run in order until one finds a signature:
//!
//! ```text
//! Exact    nodes found in the target identify a signature
//! Numeric  digit runs may differ, scored by numeric distance
//! Nearest  every node of a candidate occurs somewhere in the target
//! Closest  fewest character differences among popular candidates
//! None     default profile for every component
//! ```
//!
//! # Loading
//!
//! [`LoadMode::Memory`] memory-maps the dataset and decodes every entity up
//! front. [`LoadMode::Stream`] decodes entities on demand through a pool of
//! file readers with per-kind LRU caches.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod controller;
/// Dataset loading and entity access
pub mod dataset;
/// Decoded dataset entities
pub mod entities;
/// Error types
pub mod error;
mod handle;
mod match_result;
mod match_state;
mod pool;
mod provider;
mod search;

pub use crate::dataset::{
    Dataset, DatasetCacheStats, DatasetOpener, DatasetOptions, LoadMode, DEFAULT_CACHE_CAPACITY,
};
pub use crate::entities::{AsciiString, Component, Node, NodeChild, NumericChild, Profile, Property, Signature, Value};
pub use crate::error::{Result, UamatchError};
pub use crate::handle::ProviderHandle;
pub use crate::match_result::{Match, MatchResult, Values};
pub use crate::match_state::MatchState;
pub use crate::provider::{
    Provider, ProviderBuilder, ProviderOptions, ProviderStats, ProviderStatsSnapshot,
    DEFAULT_USER_AGENT_CACHE_CAPACITY,
};

/// Cache counters
pub use uamatch_cache::CacheStats;
/// Match method tiers
pub use uamatch_method::MatchMethod;

/// Dataset builder and validation
pub use uamatch_format::{
    validate_dataset, ComponentRef, DatasetBuilder, FormatError, FormatStats,
    FormatValidationResult, PropertyRef, ValueType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
