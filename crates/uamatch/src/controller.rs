//! Signature matching
//!
//! The controller runs one detection against a [`Dataset`], writing into a
//! [`MatchState`]. Stages run in order until one resolves a signature:
//!
//! 1. Evaluate: scan the target right to left, taking the deepest complete
//!    node at each root position and skipping the characters it covers.
//! 2. Exact: binary search the signatures for the matched node offsets.
//! 3. Numeric: rescan the gaps between matched nodes, letting digit runs
//!    differ in value, then search again.
//! 4. Nearest: among candidate signatures in rank order, find one whose
//!    unmatched nodes all occur somewhere in the target.
//! 5. Closest: score candidates by character differences.
//!
//! When none applies every component takes its default profile.

use crate::dataset::Dataset;
use crate::entities::{Node, NumericChild, Signature};
use crate::error::{Result, UamatchError};
use crate::match_result::MatchResult;
use crate::match_state::MatchState;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;
use uamatch_format::{numeric_value, FormatError, MAX_NUMERIC_VALUE};
use uamatch_method::MatchMethod;

/// Run a detection for `user_agent` and snapshot the outcome
pub(crate) fn detect(dataset: &Dataset, state: &mut MatchState, user_agent: &str) -> Result<MatchResult> {
    let start = Instant::now();
    state.reset(user_agent);
    run(dataset, state)?;
    let result = MatchResult::from_state(state, start.elapsed());
    trace!(
        method = %result.method(),
        difference = result.difference(),
        nodes = state.nodes.len(),
        root_nodes_evaluated = state.root_nodes_evaluated,
        "user agent matched"
    );
    Ok(result)
}

/// Run every stage against the target already loaded into `state`
pub(crate) fn run(dataset: &Dataset, state: &mut MatchState) -> Result<()> {
    dataset.check_disposed()?;

    let length = state.target.len();
    if length == 0 || length < dataset.min_user_agent_length() {
        return match_default(dataset, state);
    }

    evaluate(dataset, state)?;
    if let Some(signature) = exact(dataset, state)? {
        state.lowest_score = Some(0);
        return resolve(dataset, state, signature, MatchMethod::Exact);
    }

    evaluate_numeric(dataset, state)?;
    if let Some(signature) = exact(dataset, state)? {
        return resolve(dataset, state, signature, MatchMethod::Numeric);
    }

    if !state.nodes.is_empty() {
        let candidates = closest_signatures(dataset, state)?;
        state.closest_signatures = candidates.len() as u32;

        if let Some(signature) = evaluate_signatures(dataset, state, &candidates, &NearestScore)? {
            return resolve(dataset, state, signature, MatchMethod::Nearest);
        }
        let limit = candidates.len().min(dataset.max_signatures_closest());
        if let Some(signature) =
            evaluate_signatures(dataset, state, &candidates[..limit], &ClosestScore)?
        {
            return resolve(dataset, state, signature, MatchMethod::Closest);
        }
    }

    match_default(dataset, state)
}

fn resolve(dataset: &Dataset, state: &mut MatchState, signature: Arc<Signature>, method: MatchMethod) -> Result<()> {
    state.profiles = signature
        .profiles()
        .iter()
        .map(|&p| dataset.profile(p))
        .collect::<Result<Vec<_>>>()?;
    state.signature = Some(signature);
    state.method = method;
    Ok(())
}

fn match_default(dataset: &Dataset, state: &mut MatchState) -> Result<()> {
    state.profiles = dataset.default_profiles()?;
    state.signature = None;
    state.lowest_score = None;
    state.method = MatchMethod::None;
    Ok(())
}

/// Right-to-left scan for complete nodes
fn evaluate(dataset: &Dataset, state: &mut MatchState) -> Result<()> {
    state.reset_next_character_position_index(dataset.root_node_count());
    while state.next_character_position_index >= 0 {
        state.root_nodes_evaluated += 1;
        let found = match dataset.root_node(state.next_character_position_index as usize)? {
            Some(root) => complete_node(dataset, state, &root)?,
            None => None,
        };
        match found {
            Some(node) => {
                let next = node.next_character_position().unwrap_or(node.position());
                state.next_character_position_index =
                    next.min(state.next_character_position_index - 1);
                state.insert_node(node);
            }
            None => state.next_character_position_index -= 1,
        }
    }
    Ok(())
}

fn exact(dataset: &Dataset, state: &mut MatchState) -> Result<Option<Arc<Signature>>> {
    let offsets = state.node_offsets();
    dataset.find_signature_counted(&offsets, &mut state.signatures_read)
}

/// Child of `node` matching the target characters left of its position
fn next_node(dataset: &Dataset, state: &mut MatchState, node: &Node) -> Result<Option<Arc<Node>>> {
    let children = node.children();
    let Some(first) = children.first() else {
        return Ok(None);
    };
    // Every child of a node consumes the same number of characters
    let length = first.value.len();
    let start = node.position() - length as i32 + 1;
    if start < 0 {
        return Ok(None);
    }
    let start = start as usize;
    let Some(window) = state.target.get(start..start + length) else {
        return Ok(None);
    };

    let mut compared = 0;
    let found = children.binary_search_by(|child| {
        compared += 1;
        child.value.as_ref().cmp(window)
    });
    state.nodes_evaluated += compared;
    match found {
        Ok(i) => dataset.node(children[i].related).map(Some),
        Err(_) => Ok(None),
    }
}

/// Deepest complete node reachable from `node` along the target
fn complete_node(dataset: &Dataset, state: &mut MatchState, node: &Arc<Node>) -> Result<Option<Arc<Node>>> {
    let mut deepest = node.is_complete().then(|| Arc::clone(node));
    let mut current = Arc::clone(node);
    while let Some(next) = next_node(dataset, state, &current)? {
        if next.is_complete() {
            deepest = Some(Arc::clone(&next));
        }
        current = next;
    }
    Ok(deepest)
}

/// Like [`complete_node`], but a digit run in the target may stand in for a
/// different number the dataset knows. Each substitution adds the numeric
/// difference to the running score.
fn complete_numeric_node(
    dataset: &Dataset,
    state: &mut MatchState,
    node: &Arc<Node>,
) -> Result<Option<Arc<Node>>> {
    let mut found = None;
    if let Some(next) = next_node(dataset, state, node)? {
        found = complete_numeric_node(dataset, state, &next)?;
    }

    if found.is_none() && !node.numeric_children().is_empty() {
        if let Some(target) = current_position_as_numeric(&state.target, node.position()) {
            for child in NumericCandidates::new(node.numeric_children(), target) {
                state.numeric_nodes_evaluated += 1;
                let related = dataset.node(child.related)?;
                if let Some(complete) = complete_numeric_node(dataset, state, &related)? {
                    let difference = (target - child.value).abs();
                    state.lowest_score = Some(state.lowest_score.unwrap_or(0) + difference);
                    found = Some(complete);
                    break;
                }
            }
        }
    }

    if found.is_none() && node.is_complete() {
        found = Some(Arc::clone(node));
    }
    Ok(found)
}

/// Number formed by the digit run ending at `position`
fn current_position_as_numeric(target: &[u8], position: i32) -> Option<i32> {
    if position < 0 || position as usize >= target.len() {
        return None;
    }
    let mut index = position;
    while index >= 0 && target[index as usize].is_ascii_digit() {
        index -= 1;
    }
    (index < position).then(|| numeric_value(&target[(index + 1) as usize..=position as usize]))
}

/// Value bands a numeric substitution must stay within
const NUMERIC_RANGES: [(i32, i32); 5] = [
    (0, 10),
    (10, 100),
    (100, 1_000),
    (1_000, 10_000),
    (10_000, MAX_NUMERIC_VALUE + 1),
];

/// Numeric children in order of increasing distance from a target value,
/// restricted to the target's band; the lower value wins a tie
struct NumericCandidates<'a> {
    children: &'a [NumericChild],
    target: i32,
    range: (i32, i32),
    exact: Option<usize>,
    low: isize,
    high: usize,
}

impl<'a> NumericCandidates<'a> {
    fn new(children: &'a [NumericChild], target: i32) -> Self {
        let Some(range) = NUMERIC_RANGES
            .iter()
            .copied()
            .find(|&(lower, upper)| target >= lower && target < upper)
        else {
            return Self {
                children,
                target,
                range: (0, 0),
                exact: None,
                low: -1,
                high: children.len(),
            };
        };
        let (exact, low, high) = match children.binary_search_by_key(&target, |c| c.value) {
            Ok(i) => (Some(i), i as isize - 1, i + 1),
            Err(i) => (None, i as isize - 1, i),
        };
        Self {
            children,
            target,
            range,
            exact,
            low,
            high,
        }
    }

    fn in_range(&self, value: i32) -> bool {
        value >= self.range.0 && value < self.range.1
    }
}

impl Iterator for NumericCandidates<'_> {
    type Item = NumericChild;

    fn next(&mut self) -> Option<NumericChild> {
        if let Some(i) = self.exact.take() {
            return Some(self.children[i]);
        }
        let low = (self.low >= 0)
            .then(|| self.children[self.low as usize])
            .filter(|c| self.in_range(c.value));
        let high = self
            .children
            .get(self.high)
            .copied()
            .filter(|c| self.in_range(c.value));

        let take_low = match (low, high) {
            (Some(l), Some(h)) => self.target - l.value <= h.value - self.target,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };
        if take_low {
            self.low -= 1;
            low
        } else {
            self.high += 1;
            high
        }
    }
}

/// Whether `node` shares characters with an already matched node
fn is_overlap(node: &Node, matched: &[Arc<Node>]) -> bool {
    matched.iter().any(|other| {
        let (lower, higher) = if other.position() < node.position() {
            (other.as_ref(), node)
        } else {
            (node, other.as_ref())
        };
        lower.position() == higher.position() || lower.root_position() > higher.position()
    })
}

/// Rescan the target for numeric nodes in the gaps between matched nodes
fn evaluate_numeric(dataset: &Dataset, state: &mut MatchState) -> Result<()> {
    state.reset_next_character_position_index(dataset.root_node_count());
    let mut existing = state.nodes.len() as isize - 1;
    while state.next_character_position_index > 0 {
        let position = state.next_character_position_index;
        if existing < 0 || state.nodes[existing as usize].root_position() < position {
            state.root_nodes_evaluated += 1;
            let found = match dataset.root_node(position as usize)? {
                Some(root) => complete_numeric_node(dataset, state, &root)?,
                None => None,
            };
            match found {
                Some(node) if !is_overlap(&node, &state.nodes) => {
                    let next = node.position().min(position - 1);
                    existing = state.insert_node(node) as isize - 1;
                    state.next_character_position_index = next;
                }
                _ => state.next_character_position_index -= 1,
            }
        } else {
            // Continue left of the node already covering this position
            state.next_character_position_index =
                state.nodes[existing as usize].position().min(position - 1);
            existing -= 1;
        }
    }
    Ok(())
}

/// Signatures containing any matched node: most popular first, at most
/// `max_signatures` of them
fn closest_signatures(dataset: &Dataset, state: &MatchState) -> Result<Vec<u32>> {
    let mut ranks: Vec<u32> = state
        .nodes
        .iter()
        .flat_map(|n| n.ranked_signature_indexes().iter().copied())
        .collect();
    ranks.sort_unstable();
    ranks.dedup();
    ranks.truncate(dataset.max_signatures());
    ranks
        .into_iter()
        .map(|rank| {
            dataset.ranked_signature_index(rank).ok_or_else(|| {
                UamatchError::from(FormatError::Corrupt(format!(
                    "signature rank {} has no index",
                    rank
                )))
            })
        })
        .collect()
}

/// Scoring rule for a candidate signature's unmatched nodes
trait SignatureScore {
    /// Score before any node is considered
    fn initial_score(&self, signature: &Signature, last_node_character: i32) -> i32;

    /// Score of one unmatched node, `None` disqualifies the signature
    fn node_score(&self, target: &[u8], node: &Node, lowest: i32) -> Option<i32>;
}

/// Every unmatched node must occur somewhere in the target; the score is
/// how far each one moved
struct NearestScore;

impl SignatureScore for NearestScore {
    fn initial_score(&self, _signature: &Signature, _last_node_character: i32) -> i32 {
        0
    }

    fn node_score(&self, target: &[u8], node: &Node, _lowest: i32) -> Option<i32> {
        let characters = node.characters().filter(|c| !c.is_empty())?;
        let index = target
            .windows(characters.len())
            .position(|w| w == characters)?;
        Some((node.position() + 1 - index as i32).abs())
    }
}

/// Character-by-character distance between each unmatched node and the
/// target at the node's position
struct ClosestScore;

impl SignatureScore for ClosestScore {
    fn initial_score(&self, signature: &Signature, last_node_character: i32) -> i32 {
        (last_node_character + 1 - signature.length() as i32).abs()
    }

    fn node_score(&self, target: &[u8], node: &Node, lowest: i32) -> Option<i32> {
        let Some(characters) = node.characters() else {
            return Some(0);
        };
        let target_length = target.len() as i32;
        let digit = |bytes: &[u8], i: i32| bytes[i as usize].is_ascii_digit();

        let mut score = 0;
        let mut node_index = characters.len() as i32 - 1;
        let mut target_index = node.root_position();

        // A node reaching past the end of the target is aligned to its end
        if target_index >= target_length {
            score = target_index - target_length;
            node_index -= score;
            target_index = target_length - 1;
        }

        while node_index >= 0 && target_index >= 0 && score < lowest {
            let difference =
                (i32::from(target[target_index as usize]) - i32::from(characters[node_index as usize])).abs();
            if difference != 0 {
                // Extend right so the whole number is compared
                let mut new_node_index = node_index + 1;
                let mut new_target_index = target_index + 1;
                while (new_node_index as usize) < characters.len()
                    && new_target_index < target_length
                    && digit(target, new_target_index)
                    && digit(characters, new_node_index)
                {
                    new_node_index += 1;
                    new_target_index += 1;
                }
                node_index = new_node_index - 1;
                target_index = new_target_index - 1;

                let mut digits = 0;
                while node_index >= 0
                    && target_index >= 0
                    && digit(target, target_index)
                    && digit(characters, node_index)
                {
                    node_index -= 1;
                    target_index -= 1;
                    digits += 1;
                }

                let mut numeric_difference = 0;
                if digits > 1 {
                    let t = (target_index + 1) as usize;
                    let c = (node_index + 1) as usize;
                    let n = digits as usize;
                    numeric_difference =
                        (numeric_value(&target[t..t + n]) - numeric_value(&characters[c..c + n])).abs();
                }
                if numeric_difference != 0 {
                    score += numeric_difference;
                } else {
                    score += difference * 10;
                }
            }
            node_index -= 1;
            target_index -= 1;
        }
        Some(score)
    }
}

/// Score candidates in rank order; strictly lower scores replace the best
fn evaluate_signatures(
    dataset: &Dataset,
    state: &mut MatchState,
    candidates: &[u32],
    scorer: &dyn SignatureScore,
) -> Result<Option<Arc<Signature>>> {
    let mut lowest = i32::MAX;
    let mut best = None;
    let last_node_character = state.nodes.last().map_or(0, |n| n.root_position());

    for &index in candidates {
        let signature = dataset.signature(index)?;
        state.signatures_read += 1;
        state.signatures_compared += 1;
        let score = score_signature(dataset, state, &signature, last_node_character, lowest, scorer)?;
        if score < lowest {
            lowest = score;
            best = Some(signature);
        }
    }

    state.lowest_score = Some(lowest);
    Ok(best)
}

/// Walk the signature's nodes alongside the matched nodes, scoring only
/// the ones that were not matched, until the score can no longer win
fn score_signature(
    dataset: &Dataset,
    state: &MatchState,
    signature: &Signature,
    last_node_character: i32,
    lowest: i32,
    scorer: &dyn SignatureScore,
) -> Result<i32> {
    let mut running = scorer.initial_score(signature, last_node_character);
    let offsets = signature.node_offsets();
    let mut matched = 0;
    let mut candidate = 0;

    while candidate < offsets.len() && running < lowest {
        let matched_offset = state.nodes.get(matched).map_or(u32::MAX, |n| n.index());
        let signature_offset = offsets[candidate];
        match matched_offset.cmp(&signature_offset) {
            Ordering::Greater => {
                let node = dataset.node(signature_offset)?;
                match scorer.node_score(&state.target, &node, lowest) {
                    Some(score) => running = running.saturating_add(score),
                    None => return Ok(i32::MAX),
                }
                candidate += 1;
            }
            Ordering::Equal => {
                matched += 1;
                candidate += 1;
            }
            Ordering::Less => matched += 1,
        }
    }
    Ok(running)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AsciiString, Decode};
    use uamatch_format::NodeRecord;
    use zerocopy::IntoBytes;

    fn children(values: &[i32]) -> Vec<NumericChild> {
        values
            .iter()
            .map(|&value| NumericChild { value, related: 0 })
            .collect()
    }

    fn order(values: &[i32], target: i32) -> Vec<i32> {
        let children = children(values);
        NumericCandidates::new(&children, target)
            .map(|c| c.value)
            .collect()
    }

    #[test]
    fn test_numeric_candidates_expand_by_distance() {
        assert_eq!(order(&[20, 32, 45, 60], 40), vec![45, 32, 20, 60]);
        // Ties go to the lower value
        assert_eq!(order(&[35, 45], 40), vec![35, 45]);
        // Exact value first
        assert_eq!(order(&[30, 40, 50], 40), vec![40, 30, 50]);
    }

    #[test]
    fn test_numeric_candidates_stay_in_band() {
        assert_eq!(order(&[5, 9, 10, 99, 100], 40), vec![10, 99]);
        assert_eq!(order(&[3, 12], 7), vec![3]);
        assert!(order(&[1, 2], 40_000).is_empty());
    }

    #[test]
    fn test_current_position_as_numeric() {
        let target = b"Chrome/40.1";
        assert_eq!(current_position_as_numeric(target, 8), Some(40));
        assert_eq!(current_position_as_numeric(target, 7), Some(4));
        assert_eq!(current_position_as_numeric(target, 10), Some(1));
        assert_eq!(current_position_as_numeric(target, 6), None);
        assert_eq!(current_position_as_numeric(target, 11), None);
        assert_eq!(current_position_as_numeric(target, -1), None);
    }

    fn complete_node(position: i32, characters: &[u8]) -> Node {
        let record = NodeRecord {
            position,
            next_character_position: position,
            parent: -1,
            length: characters.len() as u32,
            characters_length: characters.len() as u32,
            child_count: 0,
            numeric_child_count: 0,
            ranked_signature_count: 0,
        };
        let mut bytes = record.as_bytes().to_vec();
        bytes.extend_from_slice(characters);
        let mut strings = |_: u32| -> Result<Arc<AsciiString>> { Err(UamatchError::Disposed) };
        Node::decode(0, &bytes, &mut strings).unwrap()
    }

    #[test]
    fn test_closest_score_uses_numeric_distance() {
        let node = complete_node(-1, b"Chrome/32");
        assert_eq!(node.root_position(), 8);
        assert_eq!(ClosestScore.node_score(b"Chrome/40", &node, i32::MAX), Some(8));
        assert_eq!(ClosestScore.node_score(b"Chrome/32", &node, i32::MAX), Some(0));
        // Single characters cost ten times their code difference
        assert_eq!(ClosestScore.node_score(b"Chrome/3a", &node, i32::MAX), Some(470));
    }

    #[test]
    fn test_closest_score_stops_at_lowest() {
        let node = complete_node(-1, b"abcdef");
        let score = ClosestScore.node_score(b"zzzzzz", &node, 50).unwrap();
        assert!(score >= 50);
        assert!(score < 250 * 10);
    }

    #[test]
    fn test_nearest_score_is_displacement() {
        let node = complete_node(-1, b"Chrome/32");
        assert_eq!(NearestScore.node_score(b"Mozilla Chrome/32", &node, i32::MAX), Some(8));
        assert_eq!(NearestScore.node_score(b"Chrome/32 extra", &node, i32::MAX), Some(0));
        assert_eq!(NearestScore.node_score(b"Mozilla Chrome/40", &node, i32::MAX), None);
    }

    #[test]
    fn test_overlap() {
        let matched = vec![Arc::new(complete_node(3, b"abcd"))];
        // Covers positions 4..=7
        assert!(is_overlap(&complete_node(5, b"xy"), &matched));
        assert!(is_overlap(&complete_node(3, b"x"), &matched));
        assert!(is_overlap(&complete_node(1, b"xyz"), &matched));
        assert!(!is_overlap(&complete_node(1, b"xy"), &matched));
        assert!(!is_overlap(&complete_node(7, b"xy"), &matched));
    }
}
