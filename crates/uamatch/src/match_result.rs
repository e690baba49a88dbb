//! Detection results
//!
//! [`MatchResult`] is the immutable snapshot of one detection, safe to cache
//! and share between threads. [`Match`] pairs a result with the dataset it
//! came from and answers property questions about it.

use crate::dataset::Dataset;
use crate::entities::{Node, Profile, Property, Signature, Value};
use crate::error::{Result, UamatchError};
use crate::match_state::MatchState;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uamatch_method::MatchMethod;

/// Outcome of one detection
#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    pub(crate) elapsed: Duration,
    pub(crate) method: MatchMethod,
    pub(crate) difference: i32,
    pub(crate) signature: Option<Arc<Signature>>,
    pub(crate) profiles: Vec<Arc<Profile>>,
    pub(crate) nodes: Vec<Arc<Node>>,
    pub(crate) target_user_agent: Option<String>,
    pub(crate) root_nodes_evaluated: u32,
    pub(crate) nodes_evaluated: u32,
    pub(crate) numeric_nodes_evaluated: u32,
    pub(crate) signatures_compared: u32,
    pub(crate) signatures_read: u32,
    pub(crate) closest_signatures: u32,
}

impl MatchResult {
    /// Copy the outcome out of a finished working state
    pub(crate) fn from_state(state: &MatchState, elapsed: Duration) -> Self {
        Self {
            elapsed,
            method: state.method,
            difference: state.lowest_score.unwrap_or(0),
            signature: state.signature.clone(),
            profiles: state.profiles.clone(),
            nodes: state.nodes.clone(),
            target_user_agent: Some(String::from_utf8_lossy(&state.target).into_owned()),
            root_nodes_evaluated: state.root_nodes_evaluated,
            nodes_evaluated: state.nodes_evaluated,
            numeric_nodes_evaluated: state.numeric_nodes_evaluated,
            signatures_compared: state.signatures_compared,
            signatures_read: state.signatures_read,
            closest_signatures: state.closest_signatures,
        }
    }

    /// Add another result's counters and time to this one
    pub(crate) fn accumulate(&mut self, other: &MatchResult) {
        self.elapsed += other.elapsed;
        self.difference = self.difference.saturating_add(other.difference);
        self.method = self.method.max(other.method);
        self.root_nodes_evaluated += other.root_nodes_evaluated;
        self.nodes_evaluated += other.nodes_evaluated;
        self.numeric_nodes_evaluated += other.numeric_nodes_evaluated;
        self.signatures_compared += other.signatures_compared;
        self.signatures_read += other.signatures_read;
        self.closest_signatures += other.closest_signatures;
    }

    /// Time spent matching
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// How the signature was found
    pub fn method(&self) -> MatchMethod {
        self.method
    }

    /// Dissimilarity between target and signature; 0 is a perfect match
    pub fn difference(&self) -> i32 {
        self.difference
    }

    /// Matched signature, if any
    pub fn signature(&self) -> Option<&Arc<Signature>> {
        self.signature.as_ref()
    }

    /// Profiles the match resolved to, in component order
    ///
    /// Empty after a device id lookup that resolved nothing.
    pub fn profiles(&self) -> &[Arc<Profile>] {
        &self.profiles
    }

    /// Nodes found in the target, ascending by offset
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// User agent that was matched; `None` for header and device id matches
    pub fn target_user_agent(&self) -> Option<&str> {
        self.target_user_agent.as_deref()
    }

    /// Root nodes probed
    pub fn root_nodes_evaluated(&self) -> u32 {
        self.root_nodes_evaluated
    }

    /// Child lookups performed while walking the trie
    pub fn nodes_evaluated(&self) -> u32 {
        self.nodes_evaluated
    }

    /// Numeric substitutions tried
    pub fn numeric_nodes_evaluated(&self) -> u32 {
        self.numeric_nodes_evaluated
    }

    /// Candidate signatures scored
    pub fn signatures_compared(&self) -> u32 {
        self.signatures_compared
    }

    /// Signatures read from the dataset
    pub fn signatures_read(&self) -> u32 {
        self.signatures_read
    }

    /// Candidate signatures considered by the Nearest and Closest stages
    pub fn closest_signatures(&self) -> u32 {
        self.closest_signatures
    }
}

/// A detection bound to its dataset
///
/// A `Match` owns a working [`MatchState`] so it can be handed back to
/// [`crate::Provider::match_user_agent_into`] and reuse its buffers. It is
/// not meant to be shared between threads while being reused.
pub struct Match {
    dataset: Arc<Dataset>,
    state: MatchState,
    result: Arc<MatchResult>,
}

impl Match {
    pub(crate) fn new(dataset: Arc<Dataset>) -> Self {
        Self {
            dataset,
            state: MatchState::new(),
            result: Arc::new(MatchResult::default()),
        }
    }

    pub(crate) fn with_result(dataset: Arc<Dataset>, result: Arc<MatchResult>) -> Self {
        Self {
            dataset,
            state: MatchState::new(),
            result,
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut MatchState {
        &mut self.state
    }

    pub(crate) fn set_result(&mut self, dataset: Arc<Dataset>, result: Arc<MatchResult>) {
        self.dataset = dataset;
        self.result = result;
    }

    /// Dataset the match was made against
    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Underlying result snapshot
    pub fn result(&self) -> &Arc<MatchResult> {
        &self.result
    }

    /// How the signature was found
    pub fn method(&self) -> MatchMethod {
        self.result.method
    }

    /// Dissimilarity between target and signature
    pub fn difference(&self) -> i32 {
        self.result.difference
    }

    /// Time spent matching
    pub fn elapsed(&self) -> Duration {
        self.result.elapsed
    }

    /// Matched signature, if any
    pub fn signature(&self) -> Option<&Arc<Signature>> {
        self.result.signature()
    }

    /// User agent that was matched
    pub fn target_user_agent(&self) -> Option<&str> {
        self.result.target_user_agent()
    }

    /// Nodes found in the target
    pub fn nodes(&self) -> &[Arc<Node>] {
        self.result.nodes()
    }

    /// One profile per component, in component order
    ///
    /// Components the match did not resolve take their default profile.
    pub fn profiles(&self) -> Result<Vec<Arc<Profile>>> {
        self.dataset
            .components()
            .iter()
            .map(|component| {
                match self
                    .result
                    .profiles
                    .iter()
                    .find(|p| p.component() == component.index())
                {
                    Some(profile) => Ok(Arc::clone(profile)),
                    None => self.dataset.profile(component.default_profile()),
                }
            })
            .collect()
    }

    /// Profile id per component id
    pub fn profile_ids(&self) -> Result<BTreeMap<u32, u32>> {
        let components = self.dataset.components();
        Ok(self
            .profiles()?
            .iter()
            .filter_map(|p| {
                components
                    .get(p.component() as usize)
                    .map(|c| (c.component_id(), p.profile_id()))
            })
            .collect())
    }

    /// Profile ids joined with `-`, in component order
    pub fn device_id(&self) -> Result<String> {
        Ok(self
            .profiles()?
            .iter()
            .map(|p| p.profile_id().to_string())
            .collect::<Vec<_>>()
            .join("-"))
    }

    /// Profile ids as consecutive little-endian `u32`s, in component order
    pub fn device_id_as_bytes(&self) -> Result<Vec<u8>> {
        Ok(self
            .profiles()?
            .iter()
            .flat_map(|p| p.profile_id().to_le_bytes())
            .collect())
    }

    /// Values of the named property
    ///
    /// Falls back to the property's default value when the profile holds
    /// none. Fails with [`UamatchError::UnknownProperty`] for names the
    /// dataset does not define.
    pub fn values(&self, property: &str) -> Result<Values> {
        let Some(property) = self.dataset.find_property(property) else {
            return Err(UamatchError::UnknownProperty {
                property: property.to_string(),
                dataset: self.dataset.name().to_string(),
            });
        };
        let profiles = self.profiles()?;
        let mut values = match profiles.iter().find(|p| p.component() == property.component()) {
            Some(profile) => self.dataset.profile_values(profile, property)?,
            None => Vec::new(),
        };
        if values.is_empty() {
            if let Some(default) = property.default_value() {
                values.push(self.dataset.value(default)?);
            }
        }
        Ok(Values {
            property: Arc::clone(property),
            values,
        })
    }
}

impl fmt::Debug for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Match")
            .field("dataset", &self.dataset.name())
            .field("method", &self.result.method)
            .field("difference", &self.result.difference)
            .field("signature", &self.result.signature.as_ref().map(|s| s.index()))
            .finish()
    }
}

/// Values of one property for a match
#[derive(Debug, Clone)]
pub struct Values {
    property: Arc<Property>,
    values: Vec<Arc<Value>>,
}

impl Values {
    /// Property the values belong to
    pub fn property(&self) -> &Arc<Property> {
        &self.property
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no values
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate the values
    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Value>> {
        self.values.iter()
    }

    /// First value as a boolean (`true`/`false`, any case)
    pub fn to_bool(&self) -> Option<bool> {
        let first = self.values.first()?.name();
        if first.eq_ignore_ascii_case("true") {
            Some(true)
        } else if first.eq_ignore_ascii_case("false") {
            Some(false)
        } else {
            None
        }
    }

    /// First value as an integer
    pub fn to_i64(&self) -> Option<i64> {
        self.values.first()?.name().trim().parse().ok()
    }

    /// First value as a float
    pub fn to_f64(&self) -> Option<f64> {
        self.values.first()?.name().trim().parse().ok()
    }
}

impl fmt::Display for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(value.name())?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Values {
    type Item = &'a Arc<Value>;
    type IntoIter = std::slice::Iter<'a, Arc<Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
