//! Dataset builder
//!
//! Produces dataset bytes in the layout described in [`crate::offset_format`]
//! from components, properties, profiles and signatures. A signature is given
//! as an example user agent plus the substrings of it that identify the
//! device; the builder derives the right-to-left node trie, the root node
//! catalog, numeric transitions for digit runs and the per-node ranked
//! signature lists from those.
//!
//! # Example
//!
//! ```
//! use uamatch_format::{DatasetBuilder, ValueType};
//!
//! let mut builder = DatasetBuilder::new("example");
//! let hardware = builder.add_component("HardwarePlatform", &["User-Agent"]);
//! let model = builder.add_property(hardware, "HardwareModel", ValueType::String, Some("Unknown")).unwrap();
//! builder.add_profile(hardware, 1, &[(model, "Desktop")]).unwrap();
//! builder.add_profile(hardware, 2, &[(model, "Phone")]).unwrap();
//! builder.set_default_profile(hardware, 1).unwrap();
//! builder.add_signature("Mozilla/5.0 (Phone) Mobile", &["Phone", "Mobile"], &[2]).unwrap();
//!
//! let bytes = builder.build().unwrap();
//! assert!(uamatch_format::validate_dataset(&bytes).is_valid());
//! ```

use crate::error::FormatError;
use crate::offset_format::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use zerocopy::IntoBytes;

/// Handle to a component added to a [`DatasetBuilder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentRef(u32);

/// Handle to a property added to a [`DatasetBuilder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyRef(u32);

struct ComponentDef {
    component_id: u32,
    name: String,
    headers: Vec<String>,
    default_profile: Option<u32>,
}

struct PropertyDef {
    component: u32,
    name: String,
    value_type: ValueType,
    list: bool,
    default: Option<String>,
    description: Option<String>,
}

struct ProfileDef {
    profile_id: u32,
    component: u32,
    values: Vec<(u32, String)>,
}

struct SignatureDef {
    user_agent: Vec<u8>,
    spans: Vec<Range<usize>>,
    profile_ids: Vec<u32>,
}

/// Builder for dataset bytes
pub struct DatasetBuilder {
    name: String,
    min_user_agent_length: u32,
    max_signatures: u32,
    max_signatures_closest: u32,
    components: Vec<ComponentDef>,
    properties: Vec<PropertyDef>,
    profiles: Vec<ProfileDef>,
    profile_ids: HashMap<u32, usize>,
    signatures: Vec<SignatureDef>,
}

impl DatasetBuilder {
    /// Create an empty builder for a dataset called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_user_agent_length: 0,
            max_signatures: 100,
            max_signatures_closest: 100,
            components: Vec::new(),
            properties: Vec::new(),
            profiles: Vec::new(),
            profile_ids: HashMap::new(),
            signatures: Vec::new(),
        }
    }

    /// Targets shorter than this resolve to default profiles (default 0)
    pub fn min_user_agent_length(mut self, length: u32) -> Self {
        self.min_user_agent_length = length;
        self
    }

    /// Maximum candidate signatures scored per match (default 100)
    pub fn max_signatures(mut self, count: u32) -> Self {
        self.max_signatures = count;
        self
    }

    /// Maximum candidates scored by the closest pass (default 100)
    pub fn max_signatures_closest(mut self, count: u32) -> Self {
        self.max_signatures_closest = count;
        self
    }

    /// Add a component with its preferred HTTP headers, most preferred first
    ///
    /// Component ids are assigned in insertion order starting at 1.
    pub fn add_component(&mut self, name: &str, headers: &[&str]) -> ComponentRef {
        let index = self.components.len() as u32;
        self.components.push(ComponentDef {
            component_id: index + 1,
            name: name.to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            default_profile: None,
        });
        ComponentRef(index)
    }

    /// Add a single-valued property to a component
    pub fn add_property(
        &mut self,
        component: ComponentRef,
        name: &str,
        value_type: ValueType,
        default: Option<&str>,
    ) -> Result<PropertyRef, FormatError> {
        self.add_property_with(component, name, value_type, false, default, None)
    }

    /// Add a property with every attribute spelled out
    pub fn add_property_with(
        &mut self,
        component: ComponentRef,
        name: &str,
        value_type: ValueType,
        list: bool,
        default: Option<&str>,
        description: Option<&str>,
    ) -> Result<PropertyRef, FormatError> {
        self.check_component(component)?;
        if self.properties.iter().any(|p| p.name == name) {
            return Err(FormatError::InvalidInput(format!(
                "duplicate property '{}'",
                name
            )));
        }
        let index = self.properties.len() as u32;
        self.properties.push(PropertyDef {
            component: component.0,
            name: name.to_string(),
            value_type,
            list,
            default: default.map(str::to_string),
            description: description.map(str::to_string),
        });
        Ok(PropertyRef(index))
    }

    /// Add a profile with its property values
    ///
    /// Every property must belong to `component`. Single-valued properties
    /// accept at most one value.
    pub fn add_profile(
        &mut self,
        component: ComponentRef,
        profile_id: u32,
        values: &[(PropertyRef, &str)],
    ) -> Result<(), FormatError> {
        self.check_component(component)?;
        if self.profile_ids.contains_key(&profile_id) {
            return Err(FormatError::InvalidInput(format!(
                "duplicate profile id {}",
                profile_id
            )));
        }

        let mut owned = Vec::with_capacity(values.len());
        for (property, value) in values {
            let def = self.properties.get(property.0 as usize).ok_or_else(|| {
                FormatError::InvalidInput(format!("unknown property {}", property.0))
            })?;
            if def.component != component.0 {
                return Err(FormatError::InvalidInput(format!(
                    "property '{}' does not belong to component '{}'",
                    def.name, self.components[component.0 as usize].name
                )));
            }
            if !def.list && owned.iter().any(|(p, _)| *p == property.0) {
                return Err(FormatError::InvalidInput(format!(
                    "profile {} has several values for single-valued property '{}'",
                    profile_id, def.name
                )));
            }
            owned.push((property.0, value.to_string()));
        }

        self.profile_ids.insert(profile_id, self.profiles.len());
        self.profiles.push(ProfileDef {
            profile_id,
            component: component.0,
            values: owned,
        });
        Ok(())
    }

    /// Set the profile a component resolves to when nothing matched
    pub fn set_default_profile(
        &mut self,
        component: ComponentRef,
        profile_id: u32,
    ) -> Result<(), FormatError> {
        self.check_component(component)?;
        let profile = self.lookup_profile(profile_id)?;
        if profile.component != component.0 {
            return Err(FormatError::InvalidInput(format!(
                "default profile {} belongs to another component",
                profile_id
            )));
        }
        self.components[component.0 as usize].default_profile = Some(profile_id);
        Ok(())
    }

    /// Add a signature identified by `nodes`, substrings of `user_agent`
    ///
    /// Each node substring is located left to right, starting where the
    /// previous one ended. Signatures are ranked by insertion order, most
    /// popular first. Returns the rank.
    pub fn add_signature(
        &mut self,
        user_agent: &str,
        nodes: &[&str],
        profile_ids: &[u32],
    ) -> Result<u32, FormatError> {
        let mut spans = Vec::with_capacity(nodes.len());
        let mut from = 0;
        for node in nodes {
            let found = user_agent
                .get(from..)
                .and_then(|rest| rest.find(node))
                .ok_or_else(|| {
                    FormatError::InvalidInput(format!(
                        "node '{}' not found in '{}' after byte {}",
                        node, user_agent, from
                    ))
                })?;
            let start = from + found;
            spans.push(start..start + node.len());
            from = start + node.len();
        }
        self.add_signature_spans(user_agent, &spans, profile_ids)
    }

    /// Add a signature whose nodes are explicit byte ranges of `user_agent`
    pub fn add_signature_spans(
        &mut self,
        user_agent: &str,
        spans: &[Range<usize>],
        profile_ids: &[u32],
    ) -> Result<u32, FormatError> {
        if spans.is_empty() {
            return Err(FormatError::InvalidInput(format!(
                "signature '{}' has no nodes",
                user_agent
            )));
        }
        let mut sorted = spans.to_vec();
        sorted.sort_by_key(|s| s.start);
        for pair in sorted.windows(2) {
            if pair[0].end > pair[1].start {
                return Err(FormatError::InvalidInput(format!(
                    "overlapping nodes {:?} and {:?} in '{}'",
                    pair[0], pair[1], user_agent
                )));
            }
        }
        if let Some(bad) = sorted
            .iter()
            .find(|s| s.is_empty() || s.end > user_agent.len())
        {
            return Err(FormatError::InvalidInput(format!(
                "node span {:?} is empty or outside '{}'",
                bad, user_agent
            )));
        }
        if user_agent.len() > i32::MAX as usize {
            return Err(FormatError::InvalidInput("user agent too long".to_string()));
        }

        let mut components = BTreeSet::new();
        for id in profile_ids {
            let profile = self.lookup_profile(*id)?;
            if !components.insert(profile.component) {
                return Err(FormatError::InvalidInput(format!(
                    "signature '{}' has two profiles for one component",
                    user_agent
                )));
            }
        }

        let rank = self.signatures.len() as u32;
        self.signatures.push(SignatureDef {
            user_agent: user_agent.as_bytes().to_vec(),
            spans: sorted,
            profile_ids: profile_ids.to_vec(),
        });
        Ok(rank)
    }

    fn check_component(&self, component: ComponentRef) -> Result<(), FormatError> {
        if (component.0 as usize) < self.components.len() {
            Ok(())
        } else {
            Err(FormatError::InvalidInput(format!(
                "unknown component {}",
                component.0
            )))
        }
    }

    fn lookup_profile(&self, profile_id: u32) -> Result<&ProfileDef, FormatError> {
        self.profile_ids
            .get(&profile_id)
            .map(|&i| &self.profiles[i])
            .ok_or_else(|| FormatError::InvalidInput(format!("unknown profile id {}", profile_id)))
    }

    /// Serialize the dataset
    ///
    /// Fails when a signature's own user agent, scanned right to left for
    /// the deepest complete nodes, finds a node set other than the
    /// signature's own. Such a signature could never match exactly.
    pub fn build(self) -> Result<Vec<u8>, FormatError> {
        let mut strings = StringTable::default();
        let name = strings.intern(self.name.as_bytes());

        // Profiles sorted by id give profile indexes
        let mut profile_order: Vec<usize> = (0..self.profiles.len()).collect();
        profile_order.sort_by_key(|&i| self.profiles[i].profile_id);
        let profile_index: HashMap<u32, u32> = profile_order
            .iter()
            .enumerate()
            .map(|(index, &def)| (self.profiles[def].profile_id, index as u32))
            .collect();

        // Values grouped by property, then by text
        let mut value_keys: BTreeSet<(u32, &str)> = BTreeSet::new();
        for profile in &self.profiles {
            for (property, value) in &profile.values {
                value_keys.insert((*property, value.as_str()));
            }
        }
        for (index, property) in self.properties.iter().enumerate() {
            if let Some(default) = &property.default {
                value_keys.insert((index as u32, default.as_str()));
            }
        }
        let values: Vec<(u32, &str)> = value_keys.into_iter().collect();
        let value_index: HashMap<(u32, &str), u32> = values
            .iter()
            .enumerate()
            .map(|(i, key)| (*key, i as u32))
            .collect();

        let mut component_records = Vec::with_capacity(self.components.len());
        for component in &self.components {
            let default_id = component.default_profile.ok_or_else(|| {
                FormatError::InvalidInput(format!(
                    "component '{}' has no default profile",
                    component.name
                ))
            })?;
            let record = ComponentRecord {
                component_id: component.component_id,
                name: strings.intern(component.name.as_bytes()),
                default_profile: profile_index[&default_id],
                header_count: component.headers.len() as u32,
            };
            let headers: Vec<u32> = component
                .headers
                .iter()
                .map(|h| strings.intern(h.as_bytes()))
                .collect();
            let mut bytes = record.as_bytes().to_vec();
            bytes.extend_from_slice(headers.as_bytes());
            component_records.push(bytes);
        }

        let mut property_records = Vec::with_capacity(self.properties.len());
        for (index, property) in self.properties.iter().enumerate() {
            let index = index as u32;
            let first_value = values.partition_point(|(p, _)| *p < index) as u32;
            let value_count = values[first_value as usize..]
                .iter()
                .take_while(|(p, _)| *p == index)
                .count() as u32;
            let record = PropertyRecord {
                component: property.component,
                name: strings.intern(property.name.as_bytes()),
                value_type: property.value_type as u32,
                flags: if property.list { PROPERTY_FLAG_LIST } else { 0 },
                first_value,
                value_count,
                default_value: property
                    .default
                    .as_deref()
                    .map(|d| value_index[&(index, d)])
                    .unwrap_or(NONE),
                description: property
                    .description
                    .as_deref()
                    .map(|d| strings.intern(d.as_bytes()))
                    .unwrap_or(NONE),
            };
            property_records.push(record.as_bytes().to_vec());
        }

        let value_records: Vec<Vec<u8>> = values
            .iter()
            .map(|(property, text)| {
                ValueRecord {
                    property: *property,
                    name: strings.intern(text.as_bytes()),
                }
                .as_bytes()
                .to_vec()
            })
            .collect();

        let trie = NodeTrie::build(&self.signatures)?;
        for (def, nodes) in self.signatures.iter().zip(&trie.signature_nodes) {
            let mut expected = nodes.clone();
            expected.sort_unstable();
            if trie.evaluate(&def.user_agent) != expected {
                return Err(FormatError::InvalidInput(format!(
                    "signature '{}' does not match its own user agent exactly",
                    String::from_utf8_lossy(&def.user_agent)
                )));
            }
        }

        // Signatures sorted by their node offsets
        let mut signatures: Vec<(Vec<u32>, u32, u32, Vec<u32>)> =
            Vec::with_capacity(self.signatures.len());
        for (rank, (def, nodes)) in self.signatures.iter().zip(&trie.signature_nodes).enumerate() {
            let mut offsets: Vec<u32> = nodes.iter().map(|&n| trie.final_index[n]).collect();
            offsets.sort_unstable();
            let length = nodes
                .iter()
                .map(|&n| trie.nodes[n].root_position)
                .max()
                .unwrap_or(-1)
                + 1;
            let mut profiles: Vec<u32> = def.profile_ids.iter().map(|id| profile_index[id]).collect();
            profiles.sort_by_key(|&p| self.profiles[profile_order[p as usize]].component);
            signatures.push((offsets, rank as u32, length as u32, profiles));
        }
        signatures.sort_by(|a, b| a.0.cmp(&b.0));
        for pair in signatures.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(FormatError::InvalidInput(format!(
                    "signatures ranked {} and {} share the same nodes",
                    pair[0].1, pair[1].1
                )));
            }
        }
        let mut ranked_signature_indexes = vec![0u32; signatures.len()];
        let mut profile_signatures: Vec<Vec<u32>> = vec![Vec::new(); self.profiles.len()];
        for (index, (_, rank, _, profiles)) in signatures.iter().enumerate() {
            ranked_signature_indexes[*rank as usize] = index as u32;
            for &p in profiles {
                profile_signatures[p as usize].push(index as u32);
            }
        }
        let signature_records: Vec<Vec<u8>> = signatures
            .iter()
            .map(|(offsets, rank, length, profiles)| {
                let record = SignatureRecord {
                    rank: *rank,
                    length: *length,
                    node_count: offsets.len() as u32,
                    profile_count: profiles.len() as u32,
                };
                let mut bytes = record.as_bytes().to_vec();
                bytes.extend_from_slice(offsets.as_bytes());
                bytes.extend_from_slice(profiles.as_bytes());
                bytes
            })
            .collect();

        let mut profile_records = Vec::with_capacity(self.profiles.len());
        let mut profile_offsets = Vec::with_capacity(self.profiles.len());
        for (index, &def) in profile_order.iter().enumerate() {
            let profile = &self.profiles[def];
            let mut value_ids: Vec<u32> = profile
                .values
                .iter()
                .map(|(p, v)| value_index[&(*p, v.as_str())])
                .collect();
            value_ids.sort_unstable();
            value_ids.dedup();
            let record = ProfileRecord {
                profile_id: profile.profile_id,
                component: profile.component,
                value_count: value_ids.len() as u32,
                signature_count: profile_signatures[index].len() as u32,
            };
            let mut bytes = record.as_bytes().to_vec();
            bytes.extend_from_slice(value_ids.as_bytes());
            bytes.extend_from_slice(profile_signatures[index].as_bytes());
            profile_records.push(bytes);
            profile_offsets.push(ProfileOffset {
                profile_id: profile.profile_id,
                profile_index: index as u32,
            });
        }

        let node_records = trie.records();
        let root_nodes = trie.root_catalog();

        let mut header = DatasetHeader::new();
        header.name = name;
        header.min_user_agent_length = self.min_user_agent_length;
        header.max_signatures = self.max_signatures;
        header.max_signatures_closest = self.max_signatures_closest;

        let mut out = vec![0u8; std::mem::size_of::<DatasetHeader>()];
        header.components = write_entity_section(&mut out, &component_records)?;
        header.properties = write_entity_section(&mut out, &property_records)?;
        header.values = write_entity_section(&mut out, &value_records)?;
        header.profiles = write_entity_section(&mut out, &profile_records)?;
        header.signatures = write_entity_section(&mut out, &signature_records)?;
        header.nodes = write_entity_section(&mut out, &node_records)?;
        // Strings last: every earlier section interned into the table
        header.strings = write_entity_section(&mut out, &strings.records())?;
        header.ranked_signature_indexes =
            write_array_section(&mut out, ranked_signature_indexes.as_bytes(), ranked_signature_indexes.len())?;
        header.root_nodes = write_array_section(&mut out, root_nodes.as_bytes(), root_nodes.len())?;
        header.profile_offsets =
            write_array_section(&mut out, profile_offsets.as_bytes(), profile_offsets.len())?;

        out[..std::mem::size_of::<DatasetHeader>()].copy_from_slice(header.as_bytes());
        Ok(out)
    }
}

/// Deduplicating string table
#[derive(Default)]
struct StringTable {
    index: HashMap<Vec<u8>, u32>,
    strings: Vec<Vec<u8>>,
}

impl StringTable {
    fn intern(&mut self, s: &[u8]) -> u32 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        self.index.insert(s.to_vec(), i);
        self.strings.push(s.to_vec());
        i
    }

    fn records(&self) -> Vec<Vec<u8>> {
        self.strings
            .iter()
            .map(|s| {
                let mut bytes = StringRecord {
                    length: s.len() as u32,
                }
                .as_bytes()
                .to_vec();
                bytes.extend_from_slice(s);
                bytes
            })
            .collect()
    }
}

fn offset_u32(offset: usize) -> Result<u32, FormatError> {
    u32::try_from(offset)
        .map_err(|_| FormatError::InvalidInput(format!("dataset exceeds 4GiB at offset {}", offset)))
}

fn write_entity_section(out: &mut Vec<u8>, records: &[Vec<u8>]) -> Result<SectionHeader, FormatError> {
    let table_start = out.len();
    out.resize(table_start + (records.len() + 1) * 4, 0);
    for (i, record) in records.iter().enumerate() {
        let start = offset_u32(out.len())?;
        out[table_start + i * 4..table_start + i * 4 + 4].copy_from_slice(&start.to_le_bytes());
        out.extend_from_slice(record);
    }
    let end = offset_u32(out.len())?;
    let last = table_start + records.len() * 4;
    out[last..last + 4].copy_from_slice(&end.to_le_bytes());
    Ok(SectionHeader {
        count: records.len() as u32,
        offset: offset_u32(table_start)?,
    })
}

fn write_array_section(out: &mut Vec<u8>, bytes: &[u8], count: usize) -> Result<SectionHeader, FormatError> {
    let offset = offset_u32(out.len())?;
    out.extend_from_slice(bytes);
    offset_u32(out.len())?;
    Ok(SectionHeader {
        count: count as u32,
        offset,
    })
}

/// Trie node under construction
struct TrieNode {
    root_position: i32,
    position: i32,
    depth: u32,
    parent: Option<usize>,
    children: BTreeMap<u8, usize>,
    numeric_children: BTreeMap<i32, usize>,
    characters: Option<Vec<u8>>,
    ranks: BTreeSet<u32>,
}

/// Right-to-left character trie shared by every signature
struct NodeTrie {
    nodes: Vec<TrieNode>,
    roots: BTreeMap<i32, usize>,
    /// Complete trie nodes of each signature, in rank order
    signature_nodes: Vec<Vec<usize>>,
    /// Trie node to serialized node index
    final_index: Vec<u32>,
    /// Serialized node index to trie node
    order: Vec<usize>,
}

impl NodeTrie {
    fn build(signatures: &[SignatureDef]) -> Result<Self, FormatError> {
        let mut trie = NodeTrie {
            nodes: Vec::new(),
            roots: BTreeMap::new(),
            signature_nodes: Vec::with_capacity(signatures.len()),
            final_index: Vec::new(),
            order: Vec::new(),
        };

        for (rank, signature) in signatures.iter().enumerate() {
            let mut complete = Vec::with_capacity(signature.spans.len());
            for span in &signature.spans {
                let node = trie.insert(&signature.user_agent, span.clone());
                trie.nodes[node].ranks.insert(rank as u32);
                complete.push(node);
            }
            trie.signature_nodes.push(complete);
        }

        // Serialized order: root position, then depth, then creation
        let mut order: Vec<usize> = (0..trie.nodes.len()).collect();
        order.sort_by_key(|&n| (trie.nodes[n].root_position, trie.nodes[n].depth, n));
        let mut final_index = vec![0u32; trie.nodes.len()];
        for (index, &n) in order.iter().enumerate() {
            final_index[n] = u32::try_from(index)
                .map_err(|_| FormatError::InvalidInput("too many nodes".to_string()))?;
        }
        trie.order = order;
        trie.final_index = final_index;
        Ok(trie)
    }

    fn new_node(&mut self, root_position: i32, position: i32, depth: u32, parent: Option<usize>) -> usize {
        self.nodes.push(TrieNode {
            root_position,
            position,
            depth,
            parent,
            children: BTreeMap::new(),
            numeric_children: BTreeMap::new(),
            characters: None,
            ranks: BTreeSet::new(),
        });
        self.nodes.len() - 1
    }

    /// Insert the characters of `span`, consumed from its right end, and
    /// return the complete node
    fn insert(&mut self, user_agent: &[u8], span: Range<usize>) -> usize {
        let root_position = (span.end - 1) as i32;
        let root = match self.roots.get(&root_position) {
            Some(&root) => root,
            None => {
                let root = self.new_node(root_position, root_position, 0, None);
                self.roots.insert(root_position, root);
                root
            }
        };

        // path[k] is the node after consuming k characters
        let mut path = Vec::with_capacity(span.len() + 1);
        path.push(root);
        let mut current = root;
        for (k, position) in span.clone().rev().enumerate() {
            let byte = user_agent[position];
            current = match self.nodes[current].children.get(&byte) {
                Some(&child) => child,
                None => {
                    let child =
                        self.new_node(root_position, position as i32 - 1, k as u32 + 1, Some(current));
                    self.nodes[current].children.insert(byte, child);
                    child
                }
            };
            path.push(current);
        }
        self.nodes[current].characters = Some(user_agent[span.clone()].to_vec());

        self.add_numeric_children(user_agent, &span, &path);
        current
    }

    /// Register a numeric transition wherever a digit run starts inside the span
    fn add_numeric_children(&mut self, user_agent: &[u8], span: &Range<usize>, path: &[usize]) {
        let start = span.start as i32;
        for (k, &node) in path.iter().enumerate().take(span.len()) {
            let p = span.end as i32 - 1 - k as i32;
            let is_digit = |i: i32| i >= 0 && user_agent[i as usize].is_ascii_digit();
            if !is_digit(p) || (k > 0 && is_digit(p + 1)) {
                continue;
            }
            let mut q = p;
            while q >= start && is_digit(q) {
                q -= 1;
            }
            // A run cut off by the span start would read differently in a target
            if q < start && is_digit(q) {
                continue;
            }
            let value = numeric_value(&user_agent[(q + 1) as usize..=p as usize]);
            if value > MAX_NUMERIC_VALUE {
                continue;
            }
            let related = path[k + (p - q) as usize];
            self.nodes[node].numeric_children.entry(value).or_insert(related);
        }
    }

    fn records(&self) -> Vec<Vec<u8>> {
        self.order
            .iter()
            .map(|&n| {
                let node = &self.nodes[n];
                let characters = node.characters.as_deref().unwrap_or(&[]);
                let record = NodeRecord {
                    position: node.position,
                    next_character_position: if node.characters.is_some() {
                        node.position
                    } else {
                        NO_NEXT_CHARACTER
                    },
                    parent: node.parent.map(|p| self.final_index[p] as i32).unwrap_or(-1),
                    length: (node.root_position - node.position) as u32,
                    characters_length: characters.len() as u32,
                    child_count: node.children.len() as u32,
                    numeric_child_count: node.numeric_children.len() as u32,
                    ranked_signature_count: node.ranks.len() as u32,
                };
                let mut bytes = record.as_bytes().to_vec();
                for &child in node.children.values() {
                    bytes.extend_from_slice(
                        ChildRecord {
                            related: self.final_index[child],
                            value_length: 1,
                        }
                        .as_bytes(),
                    );
                }
                for (&value, &related) in &node.numeric_children {
                    bytes.extend_from_slice(
                        NumericChildRecord {
                            value,
                            related: self.final_index[related],
                        }
                        .as_bytes(),
                    );
                }
                for rank in &node.ranks {
                    bytes.extend_from_slice(&rank.to_le_bytes());
                }
                bytes.extend_from_slice(characters);
                bytes.extend(node.children.keys().copied());
                bytes
            })
            .collect()
    }

    /// Complete nodes a right-to-left scan of `target` collects, sorted
    fn evaluate(&self, target: &[u8]) -> Vec<usize> {
        let catalog_len = self.roots.keys().next_back().map_or(0, |&p| p as i64 + 1);
        let mut index = (target.len() as i64).min(catalog_len) - 1;
        let mut found = Vec::new();
        while index >= 0 {
            let deepest = self
                .roots
                .get(&(index as i32))
                .and_then(|&root| self.deepest_complete(root, target));
            match deepest {
                Some(node) => {
                    found.push(node);
                    index = i64::from(self.nodes[node].position).min(index - 1);
                }
                None => index -= 1,
            }
        }
        found.sort_unstable();
        found.dedup();
        found
    }

    fn deepest_complete(&self, root: usize, target: &[u8]) -> Option<usize> {
        let mut deepest = None;
        let mut current = root;
        loop {
            let node = &self.nodes[current];
            if node.characters.is_some() {
                deepest = Some(current);
            }
            let Ok(position) = usize::try_from(node.position) else {
                break;
            };
            match target.get(position).and_then(|b| node.children.get(b)) {
                Some(&child) => current = child,
                None => break,
            }
        }
        deepest
    }

    /// Root node index per character position, [`NONE`] where no node ends
    fn root_catalog(&self) -> Vec<u32> {
        let len = self
            .roots
            .keys()
            .next_back()
            .map(|&p| p as usize + 1)
            .unwrap_or(0);
        let mut catalog = vec![NONE; len];
        for (&position, &root) in &self.roots {
            catalog[position as usize] = self.final_index[root];
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_dataset;

    fn small_builder() -> DatasetBuilder {
        let mut builder = DatasetBuilder::new("test").min_user_agent_length(4);
        let hardware = builder.add_component("HardwarePlatform", &["User-Agent"]);
        let model = builder
            .add_property(hardware, "HardwareModel", ValueType::String, Some("Unknown"))
            .unwrap();
        builder.add_profile(hardware, 10, &[(model, "Unknown")]).unwrap();
        builder.add_profile(hardware, 11, &[(model, "Phone")]).unwrap();
        builder.set_default_profile(hardware, 10).unwrap();
        builder
    }

    #[test]
    fn test_build_produces_valid_dataset() {
        let mut builder = small_builder();
        builder
            .add_signature("Phone/1.0 Mobile", &["Phone/1", "Mobile"], &[11])
            .unwrap();
        let bytes = builder.build().unwrap();

        let result = validate_dataset(&bytes);
        assert!(result.is_valid(), "errors: {:?}", result.errors);
        let header = DatasetHeader::read(&bytes).unwrap();
        assert_eq!(header.min_user_agent_length, 4);
        assert_eq!(header.signatures.count, 1);
        assert_eq!(header.profiles.count, 2);
        // Root catalog reaches the rightmost node's last character
        assert_eq!(header.root_nodes.count, 16);
    }

    #[test]
    fn test_complete_node_layout() {
        let mut builder = small_builder();
        builder.add_signature("ab Phone", &["Phone"], &[11]).unwrap();
        let bytes = builder.build().unwrap();
        let header = DatasetHeader::read(&bytes).unwrap();

        let roots = read_u32_section(&bytes, header.root_nodes, "root nodes").unwrap();
        let root = roots[7];
        assert_ne!(root, NONE);
        assert!(roots[..7].iter().all(|&r| r == NONE));

        // Walk the single-character chain down to the complete node
        let mut index = root;
        for _ in 0..5 {
            let range = record_range(&bytes, header.nodes, index, EntityKind::Node).unwrap();
            let node = parse_node(&bytes[range]).unwrap();
            assert_eq!(node.children.len(), 1);
            index = node.children[0].0.related;
        }
        let range = record_range(&bytes, header.nodes, index, EntityKind::Node).unwrap();
        let node = parse_node(&bytes[range]).unwrap();
        assert_eq!(node.characters, b"Phone");
        assert_eq!(node.record.position, 2);
        assert_eq!(node.record.next_character_position, 2);
        assert_eq!(node.record.length, 5);
        assert_eq!(node.ranked_signatures, vec![0]);
    }

    #[test]
    fn test_numeric_child_points_past_digit_run() {
        let mut builder = small_builder();
        builder.add_signature("Chrome/32", &["Chrome/32"], &[11]).unwrap();
        let bytes = builder.build().unwrap();
        let header = DatasetHeader::read(&bytes).unwrap();

        let roots = read_u32_section(&bytes, header.root_nodes, "root nodes").unwrap();
        let range = record_range(&bytes, header.nodes, roots[8], EntityKind::Node).unwrap();
        let root = parse_node(&bytes[range]).unwrap();
        assert_eq!(root.numeric_children.len(), 1);
        assert_eq!(root.numeric_children[0].value, 32);

        let related = root.numeric_children[0].related;
        let range = record_range(&bytes, header.nodes, related, EntityKind::Node).unwrap();
        let node = parse_node(&bytes[range]).unwrap();
        assert_eq!(node.record.position, 6);
    }

    #[test]
    fn test_rejects_missing_node_and_duplicates() {
        let mut builder = small_builder();
        assert!(matches!(
            builder.add_signature("Phone", &["Tablet"], &[11]),
            Err(FormatError::InvalidInput(_))
        ));
        assert!(builder.add_signature("Phone", &["Phone"], &[99]).is_err());

        builder.add_signature("x Phone", &["Phone"], &[11]).unwrap();
        builder.add_signature("y Phone", &["Phone"], &[11]).unwrap();
        assert!(matches!(builder.build(), Err(FormatError::InvalidInput(_))));
    }

    #[test]
    fn test_rejects_signature_shadowed_by_another_node() {
        let mut builder = small_builder();
        builder
            .add_signature("Build/4 Tablet", &["Build/4", "Tablet"], &[11])
            .unwrap();
        // Scanning this user agent also finds the "Build/4" node it does not use
        builder.add_signature("Build/4 Mobile", &["Mobile"], &[11]).unwrap();
        let err = builder.build().unwrap_err();
        assert!(matches!(err, FormatError::InvalidInput(msg) if msg.contains("Build/4 Mobile")));
    }

    #[test]
    fn test_accepts_signatures_using_every_node_they_contain() {
        let mut builder = small_builder();
        builder
            .add_signature("Build/4 Tablet", &["Build/4", "Tablet"], &[11])
            .unwrap();
        builder
            .add_signature("Build/4 Mobile", &["Build/4", "Mobile"], &[11])
            .unwrap();
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_component_without_default_profile_fails() {
        let mut builder = DatasetBuilder::new("test");
        builder.add_component("Browser", &["User-Agent"]);
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_ranked_indexes_follow_insertion_order() {
        let mut builder = small_builder();
        // Inserted most popular first; sorted order differs from rank order
        builder.add_signature("zz Phone", &["zz Phone"], &[11]).unwrap();
        builder.add_signature("Mobile a", &["Mobile"], &[11]).unwrap();
        let bytes = builder.build().unwrap();
        let header = DatasetHeader::read(&bytes).unwrap();
        let ranked = read_u32_section(&bytes, header.ranked_signature_indexes, "ranked").unwrap();
        assert_eq!(ranked.len(), 2);

        for (rank, &index) in ranked.iter().enumerate() {
            let range = record_range(&bytes, header.signatures, index, EntityKind::Signature).unwrap();
            let signature = parse_signature(&bytes[range]).unwrap();
            assert_eq!(signature.record.rank, rank as u32);
        }
    }
}
