//! Match method tiers for device detection.
//!
//! This crate provides the `MatchMethod` enum which records how confidently
//! a signature was chosen across the uamatch ecosystem.

use std::fmt;

/// How a match was achieved, in increasing order of uncertainty.
///
/// The discriminants are stable and ordered: comparing two methods with `>`
/// answers "which one is worse". Merging results across several HTTP headers
/// keeps the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum MatchMethod {
    /// No signature was found; every component uses its default profile
    #[default]
    None = 0,
    /// The matched nodes identify a signature exactly
    Exact = 1,
    /// A signature was found after tolerating numeric differences
    Numeric = 2,
    /// Every node of the signature appears somewhere in the target
    Nearest = 3,
    /// Lowest character-difference signature among the candidates
    Closest = 4,
}

impl MatchMethod {
    /// All methods in discriminant order
    pub const ALL: [MatchMethod; 5] = [
        MatchMethod::None,
        MatchMethod::Exact,
        MatchMethod::Numeric,
        MatchMethod::Nearest,
        MatchMethod::Closest,
    ];

    /// Number of distinct methods
    pub const COUNT: usize = 5;

    /// Position of this method in [`MatchMethod::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Method name as used in logs and reports
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::None => "None",
            MatchMethod::Exact => "Exact",
            MatchMethod::Numeric => "Numeric",
            MatchMethod::Nearest => "Nearest",
            MatchMethod::Closest => "Closest",
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
