//! Immutable dataset entities
//!
//! Every entity is decoded from one record of the dataset by the same
//! [`Decode`] implementation whether the dataset is memory resident or read
//! through the reader pool. Entities are shared as `Arc`s and never mutated
//! after decoding.

use crate::error::Result;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use uamatch_format::{
    parse_component, parse_node, parse_profile, parse_property, parse_signature, parse_string,
    parse_value, EntityKind, FormatError, ValueType, NONE, NO_NEXT_CHARACTER, PROPERTY_FLAG_LIST,
};

/// Resolves a string index while decoding another entity
pub(crate) type StringLookup<'a> = dyn FnMut(u32) -> Result<Arc<AsciiString>> + 'a;

/// Decode one entity from its raw record bytes
pub(crate) trait Decode: Sized + Send + Sync + 'static {
    /// Section the entity lives in
    const KIND: EntityKind;

    /// Build the entity at `index` from `bytes`
    fn decode(index: u32, bytes: &[u8], strings: &mut StringLookup<'_>) -> Result<Self>;
}

/// Immutable string stored once in the dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiString {
    index: u32,
    value: String,
}

impl AsciiString {
    /// Index of the string record
    pub fn index(&self) -> u32 {
        self.index
    }

    /// String contents
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.value.as_bytes()
    }
}

impl fmt::Display for AsciiString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl Decode for AsciiString {
    const KIND: EntityKind = EntityKind::String;

    fn decode(index: u32, bytes: &[u8], _strings: &mut StringLookup<'_>) -> Result<Self> {
        let raw = parse_string(bytes)?;
        Ok(AsciiString {
            index,
            value: String::from_utf8_lossy(raw).into_owned(),
        })
    }
}

/// Transition from a node to a child consuming a fixed run of characters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChild {
    /// Characters consumed, in target order
    pub value: Box<[u8]>,
    /// Index of the child node
    pub related: u32,
}

/// Transition taken when the target holds a number at the node's position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericChild {
    /// Number the dataset expects
    pub value: i32,
    /// Node reached after the digit run
    pub related: u32,
}

/// A distinguishing substring of a User-Agent at a known position
///
/// Nodes form a right-to-left trie per character position. A root node sits
/// at the character where matching starts; each child consumes characters
/// to its left. Complete nodes carry the characters they stand for.
#[derive(Debug, Clone)]
pub struct Node {
    index: u32,
    position: i32,
    next_character_position: i32,
    parent: Option<u32>,
    length: u32,
    characters: Option<Box<[u8]>>,
    children: Vec<NodeChild>,
    numeric_children: Vec<NumericChild>,
    ranked_signature_indexes: Vec<u32>,
}

impl Node {
    /// Node offset; matched node lists are ordered by it
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Position of the character immediately left of the node
    pub fn position(&self) -> i32 {
        self.position
    }

    /// Where evaluation continues once this node matched
    pub fn next_character_position(&self) -> Option<i32> {
        (self.next_character_position != NO_NEXT_CHARACTER).then_some(self.next_character_position)
    }

    /// Parent node index, `None` for root nodes
    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    /// Characters between the node and its root
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Position of the root node this node descends from
    pub fn root_position(&self) -> i32 {
        self.position + self.length as i32
    }

    /// Characters of a complete node
    pub fn characters(&self) -> Option<&[u8]> {
        self.characters.as_deref()
    }

    /// Whether the node identifies a whole substring
    pub fn is_complete(&self) -> bool {
        self.characters.is_some()
    }

    /// Child transitions, sorted by value
    pub fn children(&self) -> &[NodeChild] {
        &self.children
    }

    /// Numeric transitions, sorted by value
    pub fn numeric_children(&self) -> &[NumericChild] {
        &self.numeric_children
    }

    /// Ranks of the signatures containing this node, most popular first
    pub fn ranked_signature_indexes(&self) -> &[u32] {
        &self.ranked_signature_indexes
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl Decode for Node {
    const KIND: EntityKind = EntityKind::Node;

    fn decode(index: u32, bytes: &[u8], _strings: &mut StringLookup<'_>) -> Result<Self> {
        let view = parse_node(bytes)?;
        let record = view.record;
        let parent = match record.parent {
            -1 => None,
            p if p >= 0 => Some(p as u32),
            p => {
                return Err(FormatError::Corrupt(format!("node {} has parent {}", index, p)).into())
            }
        };
        Ok(Node {
            index,
            position: record.position,
            next_character_position: record.next_character_position,
            parent,
            length: record.length,
            characters: (!view.characters.is_empty()).then(|| view.characters.into()),
            children: view
                .children
                .iter()
                .map(|(child, value)| NodeChild {
                    value: (*value).into(),
                    related: child.related,
                })
                .collect(),
            numeric_children: view
                .numeric_children
                .iter()
                .map(|c| NumericChild {
                    value: c.value,
                    related: c.related,
                })
                .collect(),
            ranked_signature_indexes: view.ranked_signatures,
        })
    }
}

/// An ordered set of nodes identifying one device combination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    index: u32,
    rank: u32,
    length: u32,
    node_offsets: Vec<u32>,
    profiles: Vec<u32>,
}

impl Signature {
    /// Position in the sorted signature list
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Popularity rank, 0 being the most popular
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Character length covered by the signature
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Node offsets, ascending
    pub fn node_offsets(&self) -> &[u32] {
        &self.node_offsets
    }

    /// Profile indexes, in component order
    pub fn profiles(&self) -> &[u32] {
        &self.profiles
    }
}

impl Decode for Signature {
    const KIND: EntityKind = EntityKind::Signature;

    fn decode(index: u32, bytes: &[u8], _strings: &mut StringLookup<'_>) -> Result<Self> {
        let view = parse_signature(bytes)?;
        Ok(Signature {
            index,
            rank: view.record.rank,
            length: view.record.length,
            node_offsets: view.nodes,
            profiles: view.profiles,
        })
    }
}

/// Property values for one component, identified by a profile id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    index: u32,
    profile_id: u32,
    component: u32,
    values: Vec<u32>,
    signatures: Vec<u32>,
}

impl Profile {
    /// Position in the profile list (sorted by id)
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Unique profile id
    pub fn profile_id(&self) -> u32 {
        self.profile_id
    }

    /// Index of the owning component
    pub fn component(&self) -> u32 {
        self.component
    }

    /// Value indexes, ascending
    pub fn values(&self) -> &[u32] {
        &self.values
    }

    /// Indexes of signatures that resolve to this profile
    pub fn signatures(&self) -> &[u32] {
        &self.signatures
    }

    /// Value indexes belonging to `property`
    ///
    /// Values are grouped by property, so this is a range of the sorted list.
    pub fn values_for(&self, property: &Property) -> &[u32] {
        let range = property.value_range();
        let start = self.values.partition_point(|&v| v < range.start);
        let end = self.values.partition_point(|&v| v < range.end);
        &self.values[start..end]
    }
}

impl Decode for Profile {
    const KIND: EntityKind = EntityKind::Profile;

    fn decode(index: u32, bytes: &[u8], _strings: &mut StringLookup<'_>) -> Result<Self> {
        let view = parse_profile(bytes)?;
        Ok(Profile {
            index,
            profile_id: view.record.profile_id,
            component: view.record.component,
            values: view.values,
            signatures: view.signatures,
        })
    }
}

/// A detection category such as hardware, software or browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    index: u32,
    component_id: u32,
    name: String,
    default_profile: u32,
    http_headers: Vec<String>,
}

impl Component {
    /// Position in the component list
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Stable component id
    pub fn component_id(&self) -> u32 {
        self.component_id
    }

    /// Component name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Profile index used when nothing matched
    pub fn default_profile(&self) -> u32 {
        self.default_profile
    }

    /// Relevant HTTP headers, most preferred first
    pub fn http_headers(&self) -> &[String] {
        &self.http_headers
    }
}

impl Decode for Component {
    const KIND: EntityKind = EntityKind::Component;

    fn decode(index: u32, bytes: &[u8], strings: &mut StringLookup<'_>) -> Result<Self> {
        let view = parse_component(bytes)?;
        let http_headers = view
            .headers
            .iter()
            .map(|&h| strings(h).map(|s| s.as_str().to_string()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Component {
            index,
            component_id: view.record.component_id,
            name: strings(view.record.name)?.as_str().to_string(),
            default_profile: view.record.default_profile,
            http_headers,
        })
    }
}

/// A typed, named attribute of a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    index: u32,
    component: u32,
    name: String,
    value_type: ValueType,
    list: bool,
    first_value: u32,
    value_count: u32,
    default_value: Option<u32>,
    description: Option<String>,
}

impl Property {
    /// Position in the property list
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Index of the owning component
    pub fn component(&self) -> u32 {
        self.component
    }

    /// Property name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type of the property's values
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Whether a profile may hold several values
    pub fn is_list(&self) -> bool {
        self.list
    }

    /// Value indexes belonging to the property
    pub fn value_range(&self) -> std::ops::Range<u32> {
        self.first_value..self.first_value + self.value_count
    }

    /// Value index used when a profile has no value
    pub fn default_value(&self) -> Option<u32> {
        self.default_value
    }

    /// Human readable description
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl Decode for Property {
    const KIND: EntityKind = EntityKind::Property;

    fn decode(index: u32, bytes: &[u8], strings: &mut StringLookup<'_>) -> Result<Self> {
        let record = parse_property(bytes)?;
        let description = match record.description {
            NONE => None,
            d => Some(strings(d)?.as_str().to_string()),
        };
        Ok(Property {
            index,
            component: record.component,
            name: strings(record.name)?.as_str().to_string(),
            value_type: ValueType::from_u32(record.value_type)?,
            list: record.flags & PROPERTY_FLAG_LIST != 0,
            first_value: record.first_value,
            value_count: record.value_count,
            default_value: (record.default_value != NONE).then_some(record.default_value),
            description,
        })
    }
}

/// One value of a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    index: u32,
    property: u32,
    name: Arc<AsciiString>,
}

impl Value {
    /// Position in the value list
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Index of the owning property
    pub fn property(&self) -> u32 {
        self.property
    }

    /// Value text
    pub fn name(&self) -> &str {
        self.name.as_str()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Decode for Value {
    const KIND: EntityKind = EntityKind::Value;

    fn decode(index: u32, bytes: &[u8], strings: &mut StringLookup<'_>) -> Result<Self> {
        let record = parse_value(bytes)?;
        Ok(Value {
            index,
            property: record.property,
            name: strings(record.name)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UamatchError;
    use uamatch_format::{NodeRecord, SignatureRecord};
    use zerocopy::IntoBytes;

    fn no_strings() -> impl FnMut(u32) -> Result<Arc<AsciiString>> {
        |i| Err(UamatchError::Format(FormatError::Corrupt(format!("unexpected string lookup {}", i))))
    }

    #[test]
    fn test_node_root_position_and_completeness() {
        let record = NodeRecord {
            position: 3,
            next_character_position: 3,
            parent: 7,
            length: 4,
            characters_length: 4,
            child_count: 0,
            numeric_child_count: 0,
            ranked_signature_count: 0,
        };
        let mut bytes = record.as_bytes().to_vec();
        bytes.extend_from_slice(b"Palm");
        let node = Node::decode(12, &bytes, &mut no_strings()).unwrap();
        assert_eq!(node.index(), 12);
        assert_eq!(node.root_position(), 7);
        assert_eq!(node.parent(), Some(7));
        assert_eq!(node.characters(), Some(&b"Palm"[..]));
        assert_eq!(node.next_character_position(), Some(3));
    }

    #[test]
    fn test_incomplete_root_node() {
        let record = NodeRecord {
            position: 9,
            next_character_position: NO_NEXT_CHARACTER,
            parent: -1,
            length: 0,
            characters_length: 0,
            child_count: 0,
            numeric_child_count: 0,
            ranked_signature_count: 0,
        };
        let node = Node::decode(0, record.as_bytes(), &mut no_strings()).unwrap();
        assert!(!node.is_complete());
        assert_eq!(node.parent(), None);
        assert_eq!(node.next_character_position(), None);
        assert_eq!(node.root_position(), 9);
    }

    #[test]
    fn test_signature_decode() {
        let record = SignatureRecord {
            rank: 2,
            length: 30,
            node_count: 2,
            profile_count: 1,
        };
        let mut bytes = record.as_bytes().to_vec();
        for v in [4u32, 9, 1] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let signature = Signature::decode(5, &bytes, &mut no_strings()).unwrap();
        assert_eq!(signature.node_offsets(), &[4, 9]);
        assert_eq!(signature.profiles(), &[1]);
        assert_eq!(signature.rank(), 2);
    }

    #[test]
    fn test_nodes_order_by_offset() {
        let mut a = Node::decode(
            3,
            NodeRecord {
                position: 0,
                next_character_position: NO_NEXT_CHARACTER,
                parent: -1,
                length: 0,
                characters_length: 0,
                child_count: 0,
                numeric_child_count: 0,
                ranked_signature_count: 0,
            }
            .as_bytes(),
            &mut no_strings(),
        )
        .unwrap();
        let b = a.clone();
        a.index = 1;
        assert!(a < b);
    }
}
