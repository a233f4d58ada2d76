//! Tree module: the per-packet field tree a compiled filter is evaluated against.
//!
//! This module provides the FieldTree query trait consumed by the VM and
//! ProtoTree, a concrete tree that dissectors (or tests) populate.

use crate::ftypes::FValue;
use crate::registry::{FieldId, FieldRegistry};
use crate::DfilterError;
use std::collections::{BTreeMap, BTreeSet};

/// Read access to one packet's dissected fields.
pub trait FieldTree {
    fn field_exists(&self, field: FieldId) -> bool;

    /// Every occurrence of `field`, in tree order.
    fn read_field_values(&self, field: FieldId) -> Vec<FValue>;
}

#[derive(Debug, Clone, Default)]
pub struct ProtoTree {
    values: BTreeMap<FieldId, Vec<FValue>>,
    interest: Option<BTreeSet<FieldId>>,
}

impl ProtoTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tree that only records the given fields; other additions are
    /// accepted and dropped.
    pub fn primed(fields: &[FieldId]) -> Self {
        Self {
            values: BTreeMap::new(),
            interest: Some(fields.iter().copied().collect()),
        }
    }

    pub fn is_interesting(&self, field: FieldId) -> bool {
        self.interest
            .as_ref()
            .map_or(true, |interest| interest.contains(&field))
    }

    /// Adds an occurrence of the first field registered as `abbrev`.
    pub fn add(
        &mut self,
        registry: &FieldRegistry,
        abbrev: &str,
        value: FValue,
    ) -> Result<(), DfilterError> {
        let info = registry
            .lookup(abbrev)
            .ok_or_else(|| DfilterError::FieldNotFound(abbrev.to_string()))?;
        self.add_id(registry, info.id, value)
    }

    /// Adds an occurrence of a specific field, which may be any member of a
    /// same-name chain.
    pub fn add_id(
        &mut self,
        registry: &FieldRegistry,
        field: FieldId,
        value: FValue,
    ) -> Result<(), DfilterError> {
        let info = registry
            .get(field)
            .ok_or_else(|| DfilterError::FieldNotFound(format!("#{}", field)))?;
        if value.ftype() != info.ftype {
            return Err(DfilterError::TypeMismatch {
                field: info.abbrev.clone(),
                expected: info.ftype,
                actual: value.ftype(),
            });
        }
        if self.is_interesting(field) {
            self.values.entry(field).or_default().push(value);
        }
        Ok(())
    }

    /// Parses `text` as a value of the field's type and adds it.
    pub fn add_parsed(
        &mut self,
        registry: &FieldRegistry,
        abbrev: &str,
        text: &str,
    ) -> Result<(), DfilterError> {
        let info = registry
            .lookup(abbrev)
            .ok_or_else(|| DfilterError::FieldNotFound(abbrev.to_string()))?;
        let value = FValue::from_unparsed(info.ftype, text, false)
            .map_err(DfilterError::InvalidValue)?;
        self.add_id(registry, info.id, value)
    }

    pub fn values(&self, field: FieldId) -> &[FValue] {
        self.values.get(&field).map_or(&[], Vec::as_slice)
    }

    /// Present fields with their occurrences, in field-id order.
    pub fn iter(&self) -> impl Iterator<Item = (FieldId, &[FValue])> {
        self.values.iter().map(|(id, values)| (*id, values.as_slice()))
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl FieldTree for ProtoTree {
    fn field_exists(&self, field: FieldId) -> bool {
        self.values.get(&field).map_or(false, |v| !v.is_empty())
    }

    fn read_field_values(&self, field: FieldId) -> Vec<FValue> {
        self.values(field).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftypes::FieldType;
    use crate::registry::FieldRegistryBuilder;

    fn registry() -> FieldRegistry {
        FieldRegistryBuilder::new()
            .field("tcp.port", FieldType::UInt16)
            .field("http.host", FieldType::String)
            .field("tcp.port", FieldType::UInt16)
            .build()
    }

    #[test]
    fn test_add_and_read_values() {
        let reg = registry();
        let mut tree = ProtoTree::new();
        tree.add(&reg, "tcp.port", FValue::Unsigned(FieldType::UInt16, 80)).unwrap();
        tree.add_parsed(&reg, "tcp.port", "443").unwrap();
        assert!(tree.field_exists(0));
        assert!(!tree.field_exists(1));
        assert_eq!(
            tree.read_field_values(0),
            vec![
                FValue::Unsigned(FieldType::UInt16, 80),
                FValue::Unsigned(FieldType::UInt16, 443)
            ]
        );
    }

    #[test]
    fn test_type_checking() {
        let reg = registry();
        let mut tree = ProtoTree::new();
        let res = tree.add(&reg, "tcp.port", FValue::String("80".into()));
        assert!(matches!(res, Err(DfilterError::TypeMismatch { .. })));
        let res = tree.add(&reg, "tcp.port", FValue::Unsigned(FieldType::UInt32, 80));
        assert!(res.is_err());
        assert!(tree.add_parsed(&reg, "tcp.port", "70000").is_err());
    }

    #[test]
    fn test_field_not_found() {
        let reg = registry();
        let mut tree = ProtoTree::new();
        let res = tree.add(&reg, "udp.port", FValue::Unsigned(FieldType::UInt16, 53));
        assert!(matches!(res, Err(DfilterError::FieldNotFound(_))));
    }

    #[test]
    fn test_chain_member_ids() {
        let reg = registry();
        let mut tree = ProtoTree::new();
        tree.add_id(&reg, 2, FValue::Unsigned(FieldType::UInt16, 22)).unwrap();
        assert!(!tree.field_exists(0));
        assert!(tree.field_exists(2));
    }

    #[test]
    fn test_primed_tree_drops_uninteresting_fields() {
        let reg = registry();
        let mut tree = ProtoTree::primed(&[1]);
        tree.add(&reg, "tcp.port", FValue::Unsigned(FieldType::UInt16, 80)).unwrap();
        tree.add(&reg, "http.host", FValue::String("example.com".into())).unwrap();
        assert!(!tree.field_exists(0));
        assert!(tree.field_exists(1));
        assert_eq!(tree.iter().count(), 1);
    }
}
