//! Offset-based binary layout for device detection datasets
//!
//! A dataset is a single little-endian buffer. The fixed-size
//! [`DatasetHeader`] at offset 0 points at every section:
//!
//! ```text
//! [DatasetHeader (112 bytes)]
//! [Entity sections]   strings, components, properties, values,
//!                     profiles, signatures, nodes
//! [Array sections]    ranked signature indexes, root nodes,
//!                     profile offsets (sorted by profile id)
//! ```
//!
//! Each entity section starts with an index table of `count + 1` absolute
//! u32 offsets; record `i` spans `table[i]..table[i + 1]`. That lets a reader
//! fetch one record with two small reads (index pair, then body) whether
//! the buffer is memory resident or behind a seekable stream.
//!
//! Records are a fixed-size header struct followed by variable-length u32
//! arrays and finally raw bytes. All multi-byte values are little-endian.

use crate::error::FormatError;
use std::mem;
use std::ops::Range;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Magic bytes identifying a dataset buffer
pub const MAGIC: &[u8; 8] = b"UAMATCH\0";

/// Current format version
pub const UAMATCH_FORMAT_VERSION: u32 = 3;

/// Sentinel for "no reference" in u32 fields
pub const NONE: u32 = u32::MAX;

/// Sentinel next-character position for nodes that never complete a match
pub const NO_NEXT_CHARACTER: i32 = i32::MIN;

/// Count and offset of one section
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SectionHeader {
    /// Number of entries
    pub count: u32,
    /// Absolute offset of the index table (entity sections) or array
    pub offset: u32,
}

/// Dataset header (112 bytes, 4-byte aligned)
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DatasetHeader {
    /// Magic bytes: "UAMATCH\0"
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// String index of the dataset name
    pub name: u32,
    /// Targets shorter than this go straight to the default profiles
    pub min_user_agent_length: u32,
    /// Upper bound on candidate signatures scored per match
    pub max_signatures: u32,
    /// Upper bound on signatures considered by the closest pass
    pub max_signatures_closest: u32,
    /// Reserved for future use
    pub reserved: u32,

    /// ASCII strings (names, header names, value names)
    pub strings: SectionHeader,
    /// Components (hardware, software, browser, crawler, ...)
    pub components: SectionHeader,
    /// Properties
    pub properties: SectionHeader,
    /// Values, grouped by property
    pub values: SectionHeader,
    /// Profiles, sorted by profile id
    pub profiles: SectionHeader,
    /// Signatures, sorted by node offsets
    pub signatures: SectionHeader,
    /// Nodes, sorted by root position
    pub nodes: SectionHeader,

    /// Rank to signature index (u32 array)
    pub ranked_signature_indexes: SectionHeader,
    /// Character position to root node index (u32 array)
    pub root_nodes: SectionHeader,
    /// Profile id to profile index ([`ProfileOffset`] array)
    pub profile_offsets: SectionHeader,
}

/// String record header, followed by `length` bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct StringRecord {
    /// Byte length of the string
    pub length: u32,
}

/// Component record header, followed by `header_count` string indexes
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ComponentRecord {
    /// Stable component id
    pub component_id: u32,
    /// String index of the component name
    pub name: u32,
    /// Profile index used when nothing matched
    pub default_profile: u32,
    /// Number of preferred HTTP headers
    pub header_count: u32,
}

/// Property record (no variable part)
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PropertyRecord {
    /// Component index owning the property
    pub component: u32,
    /// String index of the property name
    pub name: u32,
    /// Value type discriminant, see [`ValueType`]
    pub value_type: u32,
    /// Bit 0: property may hold several values
    pub flags: u32,
    /// Index of the first value belonging to the property
    pub first_value: u32,
    /// Number of consecutive values belonging to the property
    pub value_count: u32,
    /// Value index of the default value, or [`NONE`]
    pub default_value: u32,
    /// String index of the description, or [`NONE`]
    pub description: u32,
}

/// Property flag: several values allowed
pub const PROPERTY_FLAG_LIST: u32 = 1;

/// Value record (no variable part)
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ValueRecord {
    /// Property index
    pub property: u32,
    /// String index of the value text
    pub name: u32,
}

/// Profile record header, followed by `value_count` value indexes then
/// `signature_count` signature indexes
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ProfileRecord {
    /// Unique profile id
    pub profile_id: u32,
    /// Component index
    pub component: u32,
    /// Number of value indexes (ascending)
    pub value_count: u32,
    /// Number of signature indexes referencing this profile
    pub signature_count: u32,
}

/// Signature record header, followed by `node_count` node offsets
/// (ascending) then `profile_count` profile indexes
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SignatureRecord {
    /// Popularity rank (0 = most popular)
    pub rank: u32,
    /// Character length covered by the signature's nodes
    pub length: u32,
    /// Number of node offsets
    pub node_count: u32,
    /// Number of profile indexes
    pub profile_count: u32,
}

/// Node record header
///
/// Followed by, in order: `child_count` [`ChildRecord`]s,
/// `numeric_child_count` [`NumericChildRecord`]s, `ranked_signature_count`
/// u32 ranks, `characters_length` character bytes, then the concatenated
/// child values.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NodeRecord {
    /// Character position immediately left of the node's characters
    pub position: i32,
    /// Where evaluation continues after this node matched, or
    /// [`NO_NEXT_CHARACTER`]
    pub next_character_position: i32,
    /// Parent node index, or -1 for root nodes
    pub parent: i32,
    /// Characters between this node and its root
    pub length: u32,
    /// Length of the complete node's characters (0 when incomplete)
    pub characters_length: u32,
    /// Number of child transitions
    pub child_count: u32,
    /// Number of numeric child transitions
    pub numeric_child_count: u32,
    /// Number of ranked signature indexes
    pub ranked_signature_count: u32,
}

/// Child transition: consuming `value_length` characters leads to `related`
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ChildRecord {
    /// Node index reached by the transition
    pub related: u32,
    /// Length of the transition value in the trailing value bytes
    pub value_length: u32,
}

/// Numeric transition: a run of digits equal to `value` leads to `related`
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NumericChildRecord {
    /// Numeric value of the digit run
    pub value: i32,
    /// Node index reached after the digit run
    pub related: u32,
}

/// Profile id lookup entry
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ProfileOffset {
    /// Profile id
    pub profile_id: u32,
    /// Profile index in the profiles section
    pub profile_index: u32,
}

const _: () = assert!(mem::size_of::<DatasetHeader>() == 112);
const _: () = assert!(mem::size_of::<ComponentRecord>() == 16);
const _: () = assert!(mem::size_of::<PropertyRecord>() == 32);
const _: () = assert!(mem::size_of::<ProfileRecord>() == 16);
const _: () = assert!(mem::size_of::<SignatureRecord>() == 16);
const _: () = assert!(mem::size_of::<NodeRecord>() == 32);
const _: () = assert!(mem::size_of::<ChildRecord>() == 8);
const _: () = assert!(mem::size_of::<NumericChildRecord>() == 8);
const _: () = assert!(mem::size_of::<ProfileOffset>() == 8);

/// Largest value a numeric child transition can carry
pub const MAX_NUMERIC_VALUE: i32 = i16::MAX as i32;

/// Place values used when reading a digit run; only the last five digits count
const POWERS: [i32; 5] = [1, 10, 100, 1000, 10000];

/// Numeric value of an ASCII digit run, reading at most the last five digits
pub fn numeric_value(digits: &[u8]) -> i32 {
    digits
        .iter()
        .rev()
        .zip(POWERS)
        .map(|(&b, power)| power * i32::from(b.wrapping_sub(b'0')))
        .sum()
}

/// Typed property values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ValueType {
    /// "True" / "False"
    Bool = 0,
    /// Integer text
    Int = 1,
    /// Floating point text
    Double = 2,
    /// Free text
    String = 3,
    /// JavaScript snippet
    JavaScript = 4,
}

impl ValueType {
    /// Decode the on-disk discriminant
    pub fn from_u32(value: u32) -> Result<Self, FormatError> {
        match value {
            0 => Ok(ValueType::Bool),
            1 => Ok(ValueType::Int),
            2 => Ok(ValueType::Double),
            3 => Ok(ValueType::String),
            4 => Ok(ValueType::JavaScript),
            other => Err(FormatError::Corrupt(format!("unknown value type {}", other))),
        }
    }
}

/// Entity sections of the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// ASCII strings
    String,
    /// Components
    Component,
    /// Properties
    Property,
    /// Values
    Value,
    /// Profiles
    Profile,
    /// Signatures
    Signature,
    /// Nodes
    Node,
}

impl EntityKind {
    /// Lowercase name for messages
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::String => "string",
            EntityKind::Component => "component",
            EntityKind::Property => "property",
            EntityKind::Value => "value",
            EntityKind::Profile => "profile",
            EntityKind::Signature => "signature",
            EntityKind::Node => "node",
        }
    }
}

impl DatasetHeader {
    /// Header with magic and version set and every section empty
    pub fn new() -> Self {
        Self {
            magic: *MAGIC,
            version: UAMATCH_FORMAT_VERSION,
            name: NONE,
            min_user_agent_length: 0,
            max_signatures: 0,
            max_signatures_closest: 0,
            reserved: 0,
            strings: SectionHeader::default(),
            components: SectionHeader::default(),
            properties: SectionHeader::default(),
            values: SectionHeader::default(),
            profiles: SectionHeader::default(),
            signatures: SectionHeader::default(),
            nodes: SectionHeader::default(),
            ranked_signature_indexes: SectionHeader::default(),
            root_nodes: SectionHeader::default(),
            profile_offsets: SectionHeader::default(),
        }
    }

    /// Parse and check the header at the start of `data`
    pub fn read(data: &[u8]) -> Result<Self, FormatError> {
        let (header, _) = DatasetHeader::read_from_prefix(data).map_err(|_| {
            FormatError::InvalidHeader(format!(
                "buffer of {} bytes is shorter than the {} byte header",
                data.len(),
                mem::size_of::<DatasetHeader>()
            ))
        })?;
        header.check()?;
        Ok(header)
    }

    /// Check magic and version
    pub fn check(&self) -> Result<(), FormatError> {
        if &self.magic != MAGIC {
            return Err(FormatError::InvalidHeader("bad magic bytes".to_string()));
        }
        if self.version != UAMATCH_FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    /// Section header for an entity kind
    pub fn section(&self, kind: EntityKind) -> SectionHeader {
        match kind {
            EntityKind::String => self.strings,
            EntityKind::Component => self.components,
            EntityKind::Property => self.properties,
            EntityKind::Value => self.values,
            EntityKind::Profile => self.profiles,
            EntityKind::Signature => self.signatures,
            EntityKind::Node => self.nodes,
        }
    }
}

impl Default for DatasetHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionHeader {
    /// Absolute offset of the index table entry for record `index`
    pub fn index_entry(&self, index: u32) -> u64 {
        u64::from(self.offset) + u64::from(index) * 4
    }
}

/// Read a fixed-size record header from the front of `bytes`
pub fn read_record<'a, T: FromBytes>(
    bytes: &'a [u8],
    what: &str,
) -> Result<(T, &'a [u8]), FormatError> {
    T::read_from_prefix(bytes).map_err(|_| {
        FormatError::OutOfBounds(format!(
            "{} record truncated ({} bytes, need {})",
            what,
            bytes.len(),
            mem::size_of::<T>()
        ))
    })
}

/// Read `count` little-endian u32 values from the front of `bytes`
pub fn read_u32s<'a>(
    bytes: &'a [u8],
    count: usize,
    what: &str,
) -> Result<(Vec<u32>, &'a [u8]), FormatError> {
    let needed = count
        .checked_mul(4)
        .ok_or_else(|| FormatError::OutOfBounds(format!("{} count {} overflows", what, count)))?;
    if bytes.len() < needed {
        return Err(FormatError::OutOfBounds(format!(
            "{} array truncated ({} bytes, need {})",
            what,
            bytes.len(),
            needed
        )));
    }
    let (head, tail) = bytes.split_at(needed);
    let values = head
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((values, tail))
}

/// Read a fixed-size record array from the front of `bytes`
pub fn read_records<'a, T: FromBytes>(
    bytes: &'a [u8],
    count: usize,
    what: &str,
) -> Result<(Vec<T>, &'a [u8]), FormatError> {
    let mut out = Vec::with_capacity(count);
    let mut rest = bytes;
    for _ in 0..count {
        let (item, tail) = read_record::<T>(rest, what)?;
        out.push(item);
        rest = tail;
    }
    Ok((out, rest))
}

/// Split `len` raw bytes from the front of `bytes`
pub fn read_bytes<'a>(bytes: &'a [u8], len: usize, what: &str) -> Result<(&'a [u8], &'a [u8]), FormatError> {
    if bytes.len() < len {
        return Err(FormatError::OutOfBounds(format!(
            "{} bytes truncated ({} available, need {})",
            what,
            bytes.len(),
            len
        )));
    }
    Ok(bytes.split_at(len))
}

/// Byte range of record `index` within a memory-resident buffer
pub fn record_range(data: &[u8], section: SectionHeader, index: u32, kind: EntityKind) -> Result<Range<usize>, FormatError> {
    if index >= section.count {
        return Err(FormatError::OutOfBounds(format!(
            "{} index {} (count {})",
            kind.as_str(),
            index,
            section.count
        )));
    }
    let entry = section.index_entry(index) as usize;
    let (pair, _) = read_u32s(data.get(entry..).unwrap_or(&[]), 2, kind.as_str())?;
    record_span(pair[0], pair[1], data.len() as u64, kind, index)
}

/// Validate a record's `start..end` pair against the buffer length
pub fn record_span(start: u32, end: u32, buffer_len: u64, kind: EntityKind, index: u32) -> Result<Range<usize>, FormatError> {
    if start > end || u64::from(end) > buffer_len {
        return Err(FormatError::OutOfBounds(format!(
            "{} record {} spans {}..{} in a buffer of {} bytes",
            kind.as_str(),
            index,
            start,
            end,
            buffer_len
        )));
    }
    Ok(start as usize..end as usize)
}

/// Read an array section of u32 values from a memory-resident buffer
pub fn read_u32_section(data: &[u8], section: SectionHeader, what: &str) -> Result<Vec<u32>, FormatError> {
    let start = section.offset as usize;
    let bytes = data
        .get(start..)
        .ok_or_else(|| FormatError::OutOfBounds(format!("{} section offset {}", what, start)))?;
    Ok(read_u32s(bytes, section.count as usize, what)?.0)
}

/// Read the profile offset section from a memory-resident buffer
pub fn read_profile_offsets(data: &[u8], section: SectionHeader) -> Result<Vec<ProfileOffset>, FormatError> {
    let start = section.offset as usize;
    let bytes = data
        .get(start..)
        .ok_or_else(|| FormatError::OutOfBounds(format!("profile offsets offset {}", start)))?;
    Ok(read_records::<ProfileOffset>(bytes, section.count as usize, "profile offset")?.0)
}

/// Parsed component record
#[derive(Debug, Clone)]
pub struct ComponentView {
    /// Fixed part
    pub record: ComponentRecord,
    /// String indexes of the preferred HTTP headers, in preference order
    pub headers: Vec<u32>,
}

/// Parsed profile record
#[derive(Debug, Clone)]
pub struct ProfileView {
    /// Fixed part
    pub record: ProfileRecord,
    /// Value indexes, ascending
    pub values: Vec<u32>,
    /// Signature indexes referencing the profile
    pub signatures: Vec<u32>,
}

/// Parsed signature record
#[derive(Debug, Clone)]
pub struct SignatureView {
    /// Fixed part
    pub record: SignatureRecord,
    /// Node offsets, ascending
    pub nodes: Vec<u32>,
    /// Profile indexes, one per component
    pub profiles: Vec<u32>,
}

/// Parsed node record borrowing its byte payloads
#[derive(Debug, Clone)]
pub struct NodeView<'a> {
    /// Fixed part
    pub record: NodeRecord,
    /// Child transitions with their value bytes, in stored order
    pub children: Vec<(ChildRecord, &'a [u8])>,
    /// Numeric transitions, ascending by value
    pub numeric_children: Vec<NumericChildRecord>,
    /// Ranks of signatures containing the node, ascending
    pub ranked_signatures: Vec<u32>,
    /// Characters of a complete node, empty otherwise
    pub characters: &'a [u8],
}

/// Parse a string record
pub fn parse_string(bytes: &[u8]) -> Result<&[u8], FormatError> {
    let (record, rest) = read_record::<StringRecord>(bytes, "string")?;
    Ok(read_bytes(rest, record.length as usize, "string")?.0)
}

/// Parse a component record
pub fn parse_component(bytes: &[u8]) -> Result<ComponentView, FormatError> {
    let (record, rest) = read_record::<ComponentRecord>(bytes, "component")?;
    let (headers, _) = read_u32s(rest, record.header_count as usize, "component headers")?;
    Ok(ComponentView { record, headers })
}

/// Parse a property record
pub fn parse_property(bytes: &[u8]) -> Result<PropertyRecord, FormatError> {
    Ok(read_record::<PropertyRecord>(bytes, "property")?.0)
}

/// Parse a value record
pub fn parse_value(bytes: &[u8]) -> Result<ValueRecord, FormatError> {
    Ok(read_record::<ValueRecord>(bytes, "value")?.0)
}

/// Parse a profile record
pub fn parse_profile(bytes: &[u8]) -> Result<ProfileView, FormatError> {
    let (record, rest) = read_record::<ProfileRecord>(bytes, "profile")?;
    let (values, rest) = read_u32s(rest, record.value_count as usize, "profile values")?;
    let (signatures, _) = read_u32s(rest, record.signature_count as usize, "profile signatures")?;
    Ok(ProfileView {
        record,
        values,
        signatures,
    })
}

/// Parse a signature record
pub fn parse_signature(bytes: &[u8]) -> Result<SignatureView, FormatError> {
    let (record, rest) = read_record::<SignatureRecord>(bytes, "signature")?;
    let (nodes, rest) = read_u32s(rest, record.node_count as usize, "signature nodes")?;
    let (profiles, _) = read_u32s(rest, record.profile_count as usize, "signature profiles")?;
    Ok(SignatureView {
        record,
        nodes,
        profiles,
    })
}

/// Parse a node record
pub fn parse_node(bytes: &[u8]) -> Result<NodeView<'_>, FormatError> {
    let (record, rest) = read_record::<NodeRecord>(bytes, "node")?;
    let (child_records, rest) =
        read_records::<ChildRecord>(rest, record.child_count as usize, "node child")?;
    let (numeric_children, rest) = read_records::<NumericChildRecord>(
        rest,
        record.numeric_child_count as usize,
        "node numeric child",
    )?;
    let (ranked_signatures, rest) = read_u32s(
        rest,
        record.ranked_signature_count as usize,
        "node ranked signatures",
    )?;
    let (characters, mut rest) =
        read_bytes(rest, record.characters_length as usize, "node characters")?;

    let mut children = Vec::with_capacity(child_records.len());
    for child in child_records {
        let (value, tail) = read_bytes(rest, child.value_length as usize, "node child value")?;
        children.push((child, value));
        rest = tail;
    }

    Ok(NodeView {
        record,
        children,
        numeric_children,
        ranked_signatures,
        characters,
    })
}
