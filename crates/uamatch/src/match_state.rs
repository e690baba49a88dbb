//! Mutable working state of a single detection
//!
//! The matcher writes into a [`MatchState`] while it runs; the caller turns
//! the finished state into an immutable [`crate::MatchResult`]. A state is
//! reset and reused between detections so its buffers are allocated once.
//! It is not meant to be shared between threads.

use crate::entities::{Node, Profile, Signature};
use std::sync::Arc;
use uamatch_method::MatchMethod;

/// Working data of one detection
#[derive(Debug, Default)]
pub struct MatchState {
    /// Target User-Agent bytes
    pub(crate) target: Vec<u8>,
    /// Matched nodes, ascending by node offset
    pub(crate) nodes: Vec<Arc<Node>>,
    /// Character position the matcher examines next
    pub(crate) next_character_position_index: i32,

    pub(crate) root_nodes_evaluated: u32,
    pub(crate) nodes_evaluated: u32,
    pub(crate) numeric_nodes_evaluated: u32,
    pub(crate) signatures_compared: u32,
    pub(crate) signatures_read: u32,
    pub(crate) closest_signatures: u32,

    /// Running score; `None` until a stage assigns one
    pub(crate) lowest_score: Option<i32>,
    pub(crate) signature: Option<Arc<Signature>>,
    pub(crate) profiles: Vec<Arc<Profile>>,
    pub(crate) method: MatchMethod,
}

impl MatchState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear everything and load a new target
    pub fn reset(&mut self, user_agent: &str) {
        self.target.clear();
        self.target.extend_from_slice(user_agent.as_bytes());
        self.nodes.clear();
        self.next_character_position_index = 0;
        self.root_nodes_evaluated = 0;
        self.nodes_evaluated = 0;
        self.numeric_nodes_evaluated = 0;
        self.signatures_compared = 0;
        self.signatures_read = 0;
        self.closest_signatures = 0;
        self.lowest_score = None;
        self.signature = None;
        self.profiles.clear();
        self.method = MatchMethod::None;
    }

    /// Start the right-to-left scan at the last usable character
    pub(crate) fn reset_next_character_position_index(&mut self, root_node_count: usize) {
        let last = self.target.len().min(root_node_count) as i64 - 1;
        self.next_character_position_index = last as i32;
    }

    /// Insert `node` keeping offsets ascending; returns its position
    ///
    /// A node already present is not inserted twice.
    pub(crate) fn insert_node(&mut self, node: Arc<Node>) -> usize {
        let index = match self
            .nodes
            .binary_search_by_key(&node.index(), |n| n.index())
        {
            Ok(existing) => existing,
            Err(insert_at) => {
                self.nodes.insert(insert_at, node);
                insert_at
            }
        };
        debug_assert!(self.nodes.windows(2).all(|w| w[0].index() < w[1].index()));
        index
    }

    /// Offsets of the matched nodes, ascending
    pub(crate) fn node_offsets(&self) -> Vec<u32> {
        self.nodes.iter().map(|n| n.index()).collect()
    }

    /// Target bytes
    pub fn target(&self) -> &[u8] {
        &self.target
    }

    /// Matched nodes, ascending by offset
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Method decided so far
    pub fn method(&self) -> MatchMethod {
        self.method
    }
}
