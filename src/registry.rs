//! Registry module: the catalogue of fields a filter may reference.
//!
//! This module provides the FieldRegistry type and its builder. Several
//! protocol layers may register fields under the same user-facing name; those
//! are linked into a same-name chain that the VM walks explicitly.

use crate::ftypes::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a field in the registry.
pub type FieldId = usize;

/// A named value of an enumerated field, e.g. `SYN` for a TCP flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueString {
    pub value: u64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderFieldInfo {
    pub id: FieldId,
    pub abbrev: String,
    pub name: String,
    pub ftype: FieldType,
    pub value_strings: Vec<ValueString>,
    /// Replacement name when this field is deprecated.
    pub deprecated_by: Option<String>,
    pub same_name_next: Option<FieldId>,
}

impl HeaderFieldInfo {
    /// Case-insensitive lookup of a named value.
    pub fn value_by_label(&self, label: &str) -> Option<u64> {
        self.value_strings
            .iter()
            .find(|vs| vs.label.eq_ignore_ascii_case(label))
            .map(|vs| vs.value)
    }

    pub fn label_for(&self, value: u64) -> Option<&str> {
        self.value_strings
            .iter()
            .find(|vs| vs.value == value)
            .map(|vs| vs.label.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FieldRegistry {
    fields: Vec<HeaderFieldInfo>,
    by_name: HashMap<String, FieldId>,
}

impl FieldRegistry {
    pub fn get(&self, id: FieldId) -> Option<&HeaderFieldInfo> {
        self.fields.get(id)
    }

    /// First registered field with this name, i.e. the head of its chain.
    pub fn lookup(&self, abbrev: &str) -> Option<&HeaderFieldInfo> {
        self.by_name.get(abbrev).and_then(|id| self.fields.get(*id))
    }

    pub fn fields(&self) -> &[HeaderFieldInfo] {
        &self.fields
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Iterates over every field registered under the same name as `id`,
    /// starting at `id` itself.
    pub fn same_name_chain(&self, id: FieldId) -> SameNameChain<'_> {
        SameNameChain {
            registry: self,
            next: Some(id),
        }
    }
}

pub struct SameNameChain<'r> {
    registry: &'r FieldRegistry,
    next: Option<FieldId>,
}

impl<'r> Iterator for SameNameChain<'r> {
    type Item = &'r HeaderFieldInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let info = self.registry.get(self.next?)?;
        self.next = info.same_name_next;
        Some(info)
    }
}

/// Declaration of a single field, consumed by [`FieldRegistryBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    abbrev: String,
    name: Option<String>,
    ftype: FieldType,
    value_strings: Vec<ValueString>,
    deprecated_by: Option<String>,
}

impl FieldSpec {
    pub fn new(abbrev: impl Into<String>, ftype: FieldType) -> Self {
        Self {
            abbrev: abbrev.into(),
            name: None,
            ftype,
            value_strings: Vec::new(),
            deprecated_by: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn value_string(mut self, value: u64, label: impl Into<String>) -> Self {
        self.value_strings.push(ValueString {
            value,
            label: label.into(),
        });
        self
    }

    pub fn deprecated_by(mut self, replacement: impl Into<String>) -> Self {
        self.deprecated_by = Some(replacement.into());
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FieldRegistryBuilder {
    specs: Vec<FieldSpec>,
}

impl FieldRegistryBuilder {
    pub fn new() -> Self {
        Self { specs: Vec::new() }
    }

    pub fn field(self, abbrev: impl Into<String>, ftype: FieldType) -> Self {
        self.spec(FieldSpec::new(abbrev, ftype))
    }

    pub fn spec(mut self, spec: FieldSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Assigns ids in registration order and links same-name fields.
    pub fn build(self) -> FieldRegistry {
        let mut fields: Vec<HeaderFieldInfo> = Vec::with_capacity(self.specs.len());
        let mut by_name = HashMap::new();
        let mut chain_tail: HashMap<String, FieldId> = HashMap::new();
        for (id, spec) in self.specs.into_iter().enumerate() {
            if let Some(prev) = chain_tail.insert(spec.abbrev.clone(), id) {
                fields[prev].same_name_next = Some(id);
            } else {
                by_name.insert(spec.abbrev.clone(), id);
            }
            fields.push(HeaderFieldInfo {
                id,
                name: spec.name.unwrap_or_else(|| spec.abbrev.clone()),
                abbrev: spec.abbrev,
                ftype: spec.ftype,
                value_strings: spec.value_strings,
                deprecated_by: spec.deprecated_by,
                same_name_next: None,
            });
        }
        FieldRegistry { fields, by_name }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json;

    #[test]
    fn test_field_registration_and_retrieval() {
        let registry = FieldRegistryBuilder::new()
            .field("ip.addr", FieldType::Ipv4)
            .field("tcp.port", FieldType::UInt16)
            .build();
        assert_eq!(registry.lookup("ip.addr").map(|f| f.ftype), Some(FieldType::Ipv4));
        assert_eq!(registry.lookup("tcp.port").map(|f| f.id), Some(1));
        assert!(registry.lookup("udp.port").is_none());
        assert_eq!(registry.num_fields(), 2);
    }

    #[test]
    fn test_same_name_chain() {
        let registry = FieldRegistryBuilder::new()
            .field("ip.addr", FieldType::Ipv4)
            .field("tcp.port", FieldType::UInt16)
            .field("ip.addr", FieldType::Ipv4)
            .field("ip.addr", FieldType::Ipv4)
            .build();
        let head = registry.lookup("ip.addr").unwrap();
        assert_eq!(head.id, 0);
        let ids: Vec<_> = registry.same_name_chain(head.id).map(|f| f.id).collect();
        assert_eq!(ids, vec![0, 2, 3]);
        let ids: Vec<_> = registry.same_name_chain(2).map(|f| f.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_value_strings() {
        let registry = FieldRegistryBuilder::new()
            .spec(
                FieldSpec::new("tcp.flags", FieldType::UInt8)
                    .name("Flags")
                    .value_string(0x02, "SYN")
                    .value_string(0x10, "ACK"),
            )
            .build();
        let info = registry.lookup("tcp.flags").unwrap();
        assert_eq!(info.name, "Flags");
        assert_eq!(info.value_by_label("syn"), Some(2));
        assert_eq!(info.label_for(0x10), Some("ACK"));
        assert_eq!(info.value_by_label("FIN"), None);
    }

    #[test]
    fn test_registry_serialization_deserialization() {
        let registry = FieldRegistryBuilder::new()
            .spec(FieldSpec::new("bootp", FieldType::Protocol).deprecated_by("dhcp"))
            .field("dhcp", FieldType::Protocol)
            .build();
        let json = serde_json::to_string(&registry).unwrap();
        let deserialized: FieldRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(registry.fields(), deserialized.fields());
        assert_eq!(
            deserialized.lookup("bootp").and_then(|f| f.deprecated_by.as_deref()),
            Some("dhcp")
        );
    }
}
