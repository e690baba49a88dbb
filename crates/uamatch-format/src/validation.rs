//! Structural validation for dataset buffers
//!
//! Checks a buffer before it is trusted by a reader: header, section and
//! record bounds, cross references between entities and the orderings the
//! binary searches depend on.

use crate::offset_format::*;
use std::cmp::Ordering;

/// Validation result for format-level checks
#[derive(Debug, Clone)]
pub struct FormatValidationResult {
    /// Errors found during validation
    pub errors: Vec<String>,
    /// Warnings about potential issues
    pub warnings: Vec<String>,
    /// Validation statistics
    pub stats: FormatStats,
}

impl FormatValidationResult {
    /// Create a new empty validation result
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            stats: FormatStats::default(),
        }
    }

    /// Check if validation passed (no errors)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn error(&mut self, msg: String) {
        self.errors.push(msg);
    }

    /// Add a warning
    pub fn warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }
}

impl Default for FormatValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics from format validation
#[derive(Debug, Clone, Default)]
pub struct FormatStats {
    /// Format version
    pub version: u32,
    /// Buffer size in bytes
    pub total_size: usize,
    /// Number of strings
    pub string_count: u32,
    /// Number of components
    pub component_count: u32,
    /// Number of properties
    pub property_count: u32,
    /// Number of values
    pub value_count: u32,
    /// Number of profiles
    pub profile_count: u32,
    /// Number of signatures
    pub signature_count: u32,
    /// Number of nodes
    pub node_count: u32,
    /// Number of complete nodes
    pub complete_node_count: u32,
    /// Length of the root node catalog
    pub root_position_count: u32,
}

/// Stop collecting per-record errors after this many
const MAX_RECORD_ERRORS: usize = 100;

/// Validate a dataset buffer
pub fn validate_dataset(data: &[u8]) -> FormatValidationResult {
    let mut result = FormatValidationResult::new();
    result.stats.total_size = data.len();

    let header = match DatasetHeader::read(data) {
        Ok(header) => header,
        Err(e) => {
            result.error(e.to_string());
            return result;
        }
    };

    let stats = &mut result.stats;
    stats.version = header.version;
    stats.string_count = header.strings.count;
    stats.component_count = header.components.count;
    stats.property_count = header.properties.count;
    stats.value_count = header.values.count;
    stats.profile_count = header.profiles.count;
    stats.signature_count = header.signatures.count;
    stats.node_count = header.nodes.count;
    stats.root_position_count = header.root_nodes.count;

    let mut checker = Checker {
        data,
        header,
        result,
    };
    checker.check_index_tables();
    if !checker.result.is_valid() {
        return checker.result;
    }
    checker.check_strings();
    checker.check_components();
    checker.check_properties_and_values();
    checker.check_profiles();
    checker.check_signatures();
    checker.check_nodes();
    checker.check_arrays();

    if header.signatures.count == 0 {
        checker
            .result
            .warning("dataset has no signatures; every match will use default profiles".to_string());
    }
    if header.max_signatures == 0 {
        checker
            .result
            .warning("max_signatures is 0; nearest and closest matching are disabled".to_string());
    }
    checker.result
}

struct Checker<'a> {
    data: &'a [u8],
    header: DatasetHeader,
    result: FormatValidationResult,
}

impl<'a> Checker<'a> {
    fn error(&mut self, msg: String) {
        if self.result.errors.len() < MAX_RECORD_ERRORS {
            self.result.error(msg);
        }
    }

    fn check_index_tables(&mut self) {
        let kinds = [
            EntityKind::String,
            EntityKind::Component,
            EntityKind::Property,
            EntityKind::Value,
            EntityKind::Profile,
            EntityKind::Signature,
            EntityKind::Node,
        ];
        for kind in kinds {
            let section = self.header.section(kind);
            let start = section.offset as usize;
            let table = self
                .data
                .get(start..)
                .and_then(|rest| read_u32s(rest, section.count as usize + 1, kind.as_str()).ok());
            let Some((table, _)) = table else {
                self.error(format!(
                    "{} index table at {} with {} entries exceeds buffer",
                    kind.as_str(),
                    start,
                    section.count
                ));
                continue;
            };
            let table_end = start + (section.count as usize + 1) * 4;
            if table[0] as usize != table_end {
                self.error(format!(
                    "{} records start at {}, expected {}",
                    kind.as_str(),
                    table[0],
                    table_end
                ));
            }
            if table.windows(2).any(|w| w[0] > w[1]) {
                self.error(format!("{} index table is not ascending", kind.as_str()));
            }
            if let Some(&last) = table.last() {
                if last as usize > self.data.len() {
                    self.error(format!(
                        "{} records end at {} beyond buffer of {} bytes",
                        kind.as_str(),
                        last,
                        self.data.len()
                    ));
                }
            }
        }
    }

    fn record(&self, kind: EntityKind, index: u32) -> Result<&'a [u8], String> {
        let range = record_range(self.data, self.header.section(kind), index, kind)
            .map_err(|e| e.to_string())?;
        let data = self.data;
        Ok(&data[range])
    }

    fn check_ref(&mut self, what: &str, value: u32, kind: EntityKind) {
        let count = self.header.section(kind).count;
        if value >= count {
            self.error(format!(
                "{} references {} {} (count {})",
                what,
                kind.as_str(),
                value,
                count
            ));
        }
    }

    fn check_strings(&mut self) {
        for i in 0..self.header.strings.count {
            if let Err(e) = self.record(EntityKind::String, i).and_then(|b| {
                parse_string(b).map(|_| ()).map_err(|e| e.to_string())
            }) {
                self.error(format!("string {}: {}", i, e));
            }
        }
        if self.header.name != NONE {
            self.check_ref("header name", self.header.name, EntityKind::String);
        }
    }

    fn check_components(&mut self) {
        for i in 0..self.header.components.count {
            let view = match self
                .record(EntityKind::Component, i)
                .and_then(|b| parse_component(b).map_err(|e| e.to_string()))
            {
                Ok(view) => view,
                Err(e) => {
                    self.error(format!("component {}: {}", i, e));
                    continue;
                }
            };
            let what = format!("component {}", i);
            self.check_ref(&what, view.record.name, EntityKind::String);
            self.check_ref(&what, view.record.default_profile, EntityKind::Profile);
            for header in view.headers {
                self.check_ref(&what, header, EntityKind::String);
            }
            if view.record.default_profile < self.header.profiles.count {
                if let Ok(profile) = self
                    .record(EntityKind::Profile, view.record.default_profile)
                    .and_then(|b| parse_profile(b).map_err(|e| e.to_string()))
                {
                    if profile.record.component != i {
                        self.error(format!(
                            "component {} default profile {} belongs to component {}",
                            i, profile.record.profile_id, profile.record.component
                        ));
                    }
                }
            }
        }
    }

    fn check_properties_and_values(&mut self) {
        for i in 0..self.header.properties.count {
            let record = match self
                .record(EntityKind::Property, i)
                .and_then(|b| parse_property(b).map_err(|e| e.to_string()))
            {
                Ok(record) => record,
                Err(e) => {
                    self.error(format!("property {}: {}", i, e));
                    continue;
                }
            };
            let what = format!("property {}", i);
            self.check_ref(&what, record.component, EntityKind::Component);
            self.check_ref(&what, record.name, EntityKind::String);
            if ValueType::from_u32(record.value_type).is_err() {
                self.error(format!("{} has unknown value type {}", what, record.value_type));
            }
            let end = u64::from(record.first_value) + u64::from(record.value_count);
            if end > u64::from(self.header.values.count) {
                self.error(format!(
                    "{} value range {}..{} exceeds {} values",
                    what, record.first_value, end, self.header.values.count
                ));
            }
            if record.default_value != NONE
                && (record.default_value < record.first_value
                    || u64::from(record.default_value) >= end)
            {
                self.error(format!(
                    "{} default value {} is outside its value range",
                    what, record.default_value
                ));
            }
            if record.description != NONE {
                self.check_ref(&what, record.description, EntityKind::String);
            }
        }

        let mut previous_property = 0;
        for i in 0..self.header.values.count {
            let record = match self
                .record(EntityKind::Value, i)
                .and_then(|b| parse_value(b).map_err(|e| e.to_string()))
            {
                Ok(record) => record,
                Err(e) => {
                    self.error(format!("value {}: {}", i, e));
                    continue;
                }
            };
            let what = format!("value {}", i);
            self.check_ref(&what, record.property, EntityKind::Property);
            self.check_ref(&what, record.name, EntityKind::String);
            if record.property < previous_property {
                self.error(format!("{} is not grouped by property", what));
            }
            previous_property = record.property;
        }
    }

    fn check_profiles(&mut self) {
        for i in 0..self.header.profiles.count {
            let view = match self
                .record(EntityKind::Profile, i)
                .and_then(|b| parse_profile(b).map_err(|e| e.to_string()))
            {
                Ok(view) => view,
                Err(e) => {
                    self.error(format!("profile {}: {}", i, e));
                    continue;
                }
            };
            let what = format!("profile {}", view.record.profile_id);
            self.check_ref(&what, view.record.component, EntityKind::Component);
            if view.values.windows(2).any(|w| w[0] >= w[1]) {
                self.error(format!("{} values are not strictly ascending", what));
            }
            for value in view.values {
                self.check_ref(&what, value, EntityKind::Value);
            }
            for signature in view.signatures {
                self.check_ref(&what, signature, EntityKind::Signature);
            }
        }
    }

    fn check_signatures(&mut self) {
        let mut previous: Option<Vec<u32>> = None;
        for i in 0..self.header.signatures.count {
            let view = match self
                .record(EntityKind::Signature, i)
                .and_then(|b| parse_signature(b).map_err(|e| e.to_string()))
            {
                Ok(view) => view,
                Err(e) => {
                    self.error(format!("signature {}: {}", i, e));
                    previous = None;
                    continue;
                }
            };
            let what = format!("signature {}", i);
            if view.nodes.is_empty() {
                self.error(format!("{} has no nodes", what));
            }
            if view.nodes.windows(2).any(|w| w[0] >= w[1]) {
                self.error(format!("{} node offsets are not strictly ascending", what));
            }
            for &node in &view.nodes {
                self.check_ref(&what, node, EntityKind::Node);
            }
            for &profile in &view.profiles {
                self.check_ref(&what, profile, EntityKind::Profile);
            }
            if view.record.rank >= self.header.signatures.count {
                self.error(format!("{} rank {} out of range", what, view.record.rank));
            }
            if let Some(prev) = &previous {
                if prev.as_slice().cmp(view.nodes.as_slice()) != Ordering::Less {
                    self.error(format!("{} is not sorted after its predecessor", what));
                }
            }
            previous = Some(view.nodes);
        }
    }

    fn check_nodes(&mut self) {
        let mut complete = 0;
        for i in 0..self.header.nodes.count {
            let view = match self
                .record(EntityKind::Node, i)
                .and_then(|b| parse_node(b).map_err(|e| e.to_string()))
            {
                Ok(view) => view,
                Err(e) => {
                    self.error(format!("node {}: {}", i, e));
                    continue;
                }
            };
            let what = format!("node {}", i);
            if view.record.parent >= 0 {
                self.check_ref(&what, view.record.parent as u32, EntityKind::Node);
            } else if view.record.parent != -1 {
                self.error(format!("{} has invalid parent {}", what, view.record.parent));
            }
            if !view.characters.is_empty() {
                complete += 1;
                if view.characters.len() as u32 != view.record.length {
                    self.error(format!(
                        "{} has {} characters but length {}",
                        what,
                        view.characters.len(),
                        view.record.length
                    ));
                }
            }
            if view.children.iter().any(|(_, v)| v.is_empty()) {
                self.error(format!("{} has an empty child value", what));
            }
            if view.children.windows(2).any(|w| w[0].1 >= w[1].1) {
                self.error(format!("{} children are not sorted", what));
            }
            if view
                .numeric_children
                .windows(2)
                .any(|w| w[0].value >= w[1].value)
            {
                self.error(format!("{} numeric children are not sorted", what));
            }
            for (child, _) in &view.children {
                self.check_ref(&what, child.related, EntityKind::Node);
            }
            for child in &view.numeric_children {
                self.check_ref(&what, child.related, EntityKind::Node);
            }
            for &rank in &view.ranked_signatures {
                if rank >= self.header.signatures.count {
                    self.error(format!("{} ranked signature {} out of range", what, rank));
                }
            }
        }
        self.result.stats.complete_node_count = complete;
    }

    fn check_arrays(&mut self) {
        match read_u32_section(self.data, self.header.ranked_signature_indexes, "ranked signatures") {
            Ok(ranked) => {
                if ranked.len() as u32 != self.header.signatures.count {
                    self.error(format!(
                        "{} ranked signature indexes for {} signatures",
                        ranked.len(),
                        self.header.signatures.count
                    ));
                }
                let mut seen = vec![false; self.header.signatures.count as usize];
                for (rank, &index) in ranked.iter().enumerate() {
                    match seen.get_mut(index as usize) {
                        Some(slot) if !*slot => *slot = true,
                        Some(_) => self.error(format!("signature {} ranked twice", index)),
                        None => {
                            self.error(format!("rank {} references signature {}", rank, index));
                            continue;
                        }
                    }
                    if let Ok(view) = self
                        .record(EntityKind::Signature, index)
                        .and_then(|b| parse_signature(b).map_err(|e| e.to_string()))
                    {
                        if view.record.rank as usize != rank {
                            self.error(format!(
                                "signature {} has rank {} but is listed at rank {}",
                                index, view.record.rank, rank
                            ));
                        }
                    }
                }
            }
            Err(e) => self.error(e.to_string()),
        }

        match read_u32_section(self.data, self.header.root_nodes, "root nodes") {
            Ok(roots) => {
                for (position, &node) in roots.iter().enumerate() {
                    if node != NONE && node >= self.header.nodes.count {
                        self.error(format!(
                            "root node at position {} references node {}",
                            position, node
                        ));
                    }
                }
            }
            Err(e) => self.error(e.to_string()),
        }

        match read_profile_offsets(self.data, self.header.profile_offsets) {
            Ok(offsets) => {
                if offsets.len() as u32 != self.header.profiles.count {
                    self.error(format!(
                        "{} profile offsets for {} profiles",
                        offsets.len(),
                        self.header.profiles.count
                    ));
                }
                if offsets.windows(2).any(|w| w[0].profile_id >= w[1].profile_id) {
                    self.error("profile offsets are not sorted by profile id".to_string());
                }
                for offset in offsets {
                    match self
                        .record(EntityKind::Profile, offset.profile_index)
                        .and_then(|b| parse_profile(b).map_err(|e| e.to_string()))
                    {
                        Ok(view) if view.record.profile_id == offset.profile_id => {}
                        Ok(view) => self.error(format!(
                            "profile offset {} points at profile {}",
                            offset.profile_id, view.record.profile_id
                        )),
                        Err(e) => self.error(format!("profile offset {}: {}", offset.profile_id, e)),
                    }
                }
            }
            Err(e) => self.error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DatasetBuilder;

    fn dataset() -> Vec<u8> {
        let mut builder = DatasetBuilder::new("validation");
        let browser = builder.add_component("Browser", &["User-Agent"]);
        let name = builder
            .add_property(browser, "BrowserName", ValueType::String, Some("Unknown"))
            .unwrap();
        builder.add_profile(browser, 1, &[]).unwrap();
        builder.add_profile(browser, 2, &[(name, "Chrome")]).unwrap();
        builder.set_default_profile(browser, 1).unwrap();
        builder
            .add_signature("Mozilla Chrome/32", &["Chrome/32"], &[2])
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_built_dataset_is_valid() {
        let result = validate_dataset(&dataset());
        assert!(result.is_valid(), "errors: {:?}", result.errors);
        assert_eq!(result.stats.signature_count, 1);
        assert_eq!(result.stats.profile_count, 2);
        assert_eq!(result.stats.complete_node_count, 1);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_truncated_buffer() {
        let result = validate_dataset(&[0u8; 10]);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_bad_magic() {
        let mut data = dataset();
        data[0] = b'X';
        let result = validate_dataset(&data);
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("magic"));
    }

    #[test]
    fn test_truncated_sections_are_reported() {
        let mut data = dataset();
        data.truncate(data.len() - 4);
        let result = validate_dataset(&data);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_corrupt_root_node_reference() {
        let mut data = dataset();
        let header = DatasetHeader::read(&data).unwrap();
        let last = header.root_nodes.offset as usize + (header.root_nodes.count as usize - 1) * 4;
        data[last..last + 4].copy_from_slice(&999u32.to_le_bytes());
        let result = validate_dataset(&data);
        assert!(result.errors.iter().any(|e| e.contains("root node")));
    }

    #[test]
    fn test_empty_dataset_warns() {
        let mut builder = DatasetBuilder::new("empty");
        let browser = builder.add_component("Browser", &["User-Agent"]);
        builder.add_profile(browser, 1, &[]).unwrap();
        builder.set_default_profile(browser, 1).unwrap();
        let result = validate_dataset(&builder.build().unwrap());
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }
}
