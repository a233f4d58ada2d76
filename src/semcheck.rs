//! Semantic checker module: type-checks a parsed filter and rewrites it into
//! the form the code generator expects.
//!
//! Literals are converted into typed values of whatever they are compared
//! with, non-byte entities compared against a slice are wrapped in a `[0:]`
//! conversion, and every relation is checked against the capabilities of
//! the types involved. The first type error aborts the walk. Style and
//! deprecation findings are collected on the side and never abort it.

use crate::drange::DRange;
use crate::engine::EngineOptions;
use crate::ftypes::{FValue, FieldType};
use crate::functions::FunctionParam;
use crate::registry::FieldRegistry;
use crate::syntax_tree::{
    FieldRef, FunctionCall, Quantifier, RelOp, SetElement, StNode, TestNode, TestOp,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TypeError(pub String);

impl TypeError {
    fn new(message: impl Into<String>) -> Self {
        TypeError(message.into())
    }
}

/// A non-fatal finding about a filter that compiled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Warning {
    SuggestParentheses { inner: String, outer: String },
    DeprecatedNotEqual,
    DeprecatedField { field: String, replacement: String },
}

impl Warning {
    pub fn is_deprecation(&self) -> bool {
        !matches!(self, Warning::SuggestParentheses { .. })
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::SuggestParentheses { inner, outer } => {
                write!(f, "suggest parentheses around '{}' within '{}'", inner, outer)
            }
            Warning::DeprecatedNotEqual => f.write_str(
                "\"!=\" is deprecated or may have unexpected results. \
                 Consider using \"!==\" (all_ne) or \"~=\" (any_ne) instead.",
            ),
            Warning::DeprecatedField { field, replacement } => {
                write!(f, "\"{}\" is deprecated, use \"{}\" instead.", field, replacement)
            }
        }
    }
}

/// Checks `tree` in place. The error, if any, is the first one found; the
/// warnings are whatever was collected up to that point.
pub fn check(
    tree: &mut StNode,
    registry: &FieldRegistry,
    options: &EngineOptions,
) -> (Result<(), TypeError>, Vec<Warning>) {
    let mut checker = SemanticChecker::new(registry, options);
    let result = checker.check_logical_operand(tree);
    if let Err(e) = &result {
        debug!(error = %e, "semantic check failed");
    }
    (result, checker.warnings)
}

pub struct SemanticChecker<'a> {
    registry: &'a FieldRegistry,
    options: &'a EngineOptions,
    warnings: Vec<Warning>,
}

impl<'a> SemanticChecker<'a> {
    pub fn new(registry: &'a FieldRegistry, options: &'a EngineOptions) -> Self {
        Self {
            registry,
            options,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, warning: Warning) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    fn check_logical_operand(&mut self, node: &mut StNode) -> Result<(), TypeError> {
        match node {
            StNode::Test(test) => self.check_test(test),
            other => Err(TypeError::new(format!(
                "\"{}\" is not a test; a {} cannot be used as a condition.",
                other,
                other.kind().to_ascii_lowercase()
            ))),
        }
    }

    fn check_test(&mut self, test: &mut TestNode) -> Result<(), TypeError> {
        let TestNode {
            op,
            quantifier,
            left,
            right,
            ..
        } = test;
        match *op {
            TestOp::Exists => self.check_exists(left),
            TestOp::Not => self.check_logical_operand(left),
            TestOp::And | TestOp::Or => {
                let right = right
                    .as_deref_mut()
                    .ok_or_else(|| TypeError::new("logical operator is missing an operand"))?;
                self.check_parentheses(*op, left);
                self.check_parentheses(*op, right);
                self.check_logical_operand(left)?;
                self.check_logical_operand(right)
            }
            TestOp::Relation(rel) => {
                let right = right
                    .as_deref_mut()
                    .ok_or_else(|| TypeError::new("comparison is missing its right-hand side"))?;
                if rel == RelOp::Ne && *quantifier == Quantifier::Default && self.options.warn_deprecated
                {
                    self.warn(Warning::DeprecatedNotEqual);
                }
                self.check_relation(rel, left, right)
            }
            TestOp::In => {
                if *quantifier == Quantifier::All {
                    return Err(TypeError::new(
                        "The \"all\" quantifier cannot be used with set membership.",
                    ));
                }
                let right = right
                    .as_deref_mut()
                    .ok_or_else(|| TypeError::new("membership test is missing its set"))?;
                self.check_membership(left, right)
            }
        }
    }

    fn check_parentheses(&mut self, outer: TestOp, child: &StNode) {
        if !self.options.warn_parentheses {
            return;
        }
        if let StNode::Test(inner) = child {
            let mixed = matches!(
                (outer, inner.op),
                (TestOp::Or, TestOp::And) | (TestOp::And, TestOp::Or)
            );
            if mixed && !inner.parenthesized {
                self.warn(Warning::SuggestParentheses {
                    inner: logical_symbol(inner.op).to_string(),
                    outer: logical_symbol(outer).to_string(),
                });
            }
        }
    }

    fn check_exists(&mut self, node: &mut StNode) -> Result<(), TypeError> {
        match node {
            StNode::Field(field) => {
                self.note_field(field);
                Ok(())
            }
            StNode::String(s) => Err(not_a_field(&String::from_utf8_lossy(s))),
            StNode::Unparsed(s) => Err(not_a_field(s)),
            StNode::Range { .. } => Err(TypeError::new(
                "You cannot test whether a range is present.",
            )),
            StNode::Function(_) => Err(TypeError::new(
                "You cannot test whether a function is present.",
            )),
            other => Err(TypeError::new(format!(
                "\"{}\" cannot be tested for presence.",
                other
            ))),
        }
    }

    fn note_field(&mut self, field: &FieldRef) {
        if !self.options.warn_deprecated {
            return;
        }
        let replacement = self
            .registry
            .get(field.id)
            .and_then(|info| info.deprecated_by.clone());
        if let Some(replacement) = replacement {
            self.warn(Warning::DeprecatedField {
                field: field.abbrev.clone(),
                replacement,
            });
        }
    }

    /// The type an operand evaluates to; `None` for a literal whose type is
    /// decided by the other side.
    fn entity_type(&mut self, node: &mut StNode) -> Result<Option<FieldType>, TypeError> {
        match node {
            StNode::Field(field) => {
                self.note_field(field);
                Ok(Some(field.value_type()))
            }
            StNode::Range { .. } => {
                self.check_drange(node)?;
                Ok(Some(FieldType::Bytes))
            }
            StNode::Function(call) => self.check_function(call).map(Some),
            StNode::Fvalue(value) => Ok(Some(value.ftype())),
            StNode::String(_) | StNode::Unparsed(_) => Ok(None),
            StNode::Set(_) => Err(TypeError::new(
                "A set can only appear on the right-hand side of \"in\".",
            )),
            StNode::Test(_) => Err(TypeError::new(format!(
                "\"{}\" is a test and cannot be used as a value.",
                node
            ))),
        }
    }

    fn check_drange(&mut self, node: &mut StNode) -> Result<(), TypeError> {
        let StNode::Range { entity, drange } = node else {
            return Ok(());
        };
        match self.entity_type(entity)? {
            None => Err(TypeError::new(format!(
                "Range is not supported on the literal \"{}\".",
                literal_text(entity)
            ))),
            Some(ftype) if !ftype.can_slice() => Err(TypeError::new(format!(
                "\"{}\" is a {} and cannot be sliced into a sequence of bytes.",
                entity, ftype
            ))),
            Some(_) => drange.validate().map_err(TypeError),
        }
    }

    fn check_op(&self, op: RelOp, ftype: FieldType, node: &StNode) -> Result<(), TypeError> {
        let supported = match op {
            RelOp::Eq | RelOp::Ne => ftype.can_eq(),
            RelOp::Gt | RelOp::Ge | RelOp::Lt | RelOp::Le => ftype.can_order(),
            RelOp::BitwiseAnd => ftype.can_bitwise_and(),
            RelOp::Contains => ftype.can_contains(),
            RelOp::Matches => ftype.can_matches(),
        };
        if supported {
            Ok(())
        } else {
            Err(TypeError::new(format!(
                "{} (type={}) cannot participate in '{}' comparison.",
                node, ftype, op
            )))
        }
    }

    fn check_relation(
        &mut self,
        op: RelOp,
        left: &mut StNode,
        right: &mut StNode,
    ) -> Result<(), TypeError> {
        if let StNode::Field(field) = right {
            if field.ftype == FieldType::Protocol && !field.raw {
                return Err(TypeError::new(format!(
                    "Protocol (\"{}\") cannot appear on right-hand side of comparison.",
                    field.abbrev
                )));
            }
        }

        let left_type = self.entity_type(left)?;
        let right_type = self.entity_type(right)?;

        if op == RelOp::Matches && right_type.is_some() {
            return Err(TypeError::new(format!(
                "The right-hand side of \"matches\" must be a string, not \"{}\".",
                right
            )));
        }

        match (left_type, right_type) {
            (None, None) => Err(TypeError::new(format!(
                "Neither \"{}\" nor \"{}\" are field or protocol names.",
                literal_text(left),
                literal_text(right)
            ))),
            (Some(ftype), None) => {
                self.check_op(op, ftype, left)?;
                let value = self.literal_value(op, ftype, Some(&*left), right)?;
                *right = StNode::Fvalue(value);
                Ok(())
            }
            (None, Some(ftype)) => {
                self.check_op(op, ftype, right)?;
                let value = self.literal_value(RelOp::Eq, ftype, Some(&*right), left)?;
                *left = StNode::Fvalue(value);
                Ok(())
            }
            (Some(a), Some(b)) => {
                let (a, b) = self.unify_bytes(left, right, a, b)?;
                self.check_op(op, a, left)?;
                self.check_op(op, b, right)?;
                if a.is_compatible(b) {
                    Ok(())
                } else {
                    Err(TypeError::new(format!(
                        "{} and {} are not of compatible types.",
                        left, right
                    )))
                }
            }
        }
    }

    /// A slice on one side turns a non-byte entity on the other side into
    /// its whole byte representation.
    fn unify_bytes(
        &self,
        left: &mut StNode,
        right: &mut StNode,
        left_type: FieldType,
        right_type: FieldType,
    ) -> Result<(FieldType, FieldType), TypeError> {
        let mut types = (left_type, right_type);
        if matches!(right, StNode::Range { .. }) && !left_type.is_bytes_like() {
            wrap_whole(left, left_type)?;
            types.0 = FieldType::Bytes;
        }
        if matches!(left, StNode::Range { .. }) && !right_type.is_bytes_like() {
            wrap_whole(right, right_type)?;
            types.1 = FieldType::Bytes;
        }
        Ok(types)
    }

    fn literal_value(
        &self,
        op: RelOp,
        ftype: FieldType,
        partner: Option<&StNode>,
        literal: &StNode,
    ) -> Result<FValue, TypeError> {
        let (text, quoted) = match literal {
            StNode::String(s) => (String::from_utf8_lossy(s), true),
            StNode::Unparsed(s) => (Cow::Borrowed(s.as_str()), false),
            other => {
                return Err(TypeError::new(format!("\"{}\" is not a literal.", other)));
            }
        };
        if op == RelOp::Matches {
            return FValue::from_unparsed(FieldType::Pcre, &text, false).map_err(TypeError);
        }

        // A single byte written as a number, e.g. `frame[0] == 0x45`.
        if let Some(StNode::Range { drange, .. }) = partner {
            if !quoted && drange.static_length() == Some(1) {
                if let Ok(FValue::Unsigned(_, byte)) =
                    FValue::from_unparsed(FieldType::UInt8, &text, false)
                {
                    return Ok(FValue::Bytes(vec![byte as u8]));
                }
            }
        }

        let parsed = match literal {
            StNode::String(bytes) => FValue::from_string(ftype, bytes),
            _ => FValue::from_unparsed(ftype, &text, op == RelOp::Contains),
        };
        parsed.or_else(|err| {
            self.value_string(partner, ftype, &text)
                .ok_or(TypeError(err))
        })
    }

    /// Falls back to the field's named values, e.g. `tcp.flags == SYN`.
    fn value_string(&self, partner: Option<&StNode>, ftype: FieldType, label: &str) -> Option<FValue> {
        let Some(StNode::Field(field)) = partner else {
            return None;
        };
        if field.raw {
            return None;
        }
        let value = self
            .registry
            .same_name_chain(field.id)
            .find_map(|info| info.value_by_label(label))?;
        match ftype {
            t if t.is_unsigned() => Some(FValue::Unsigned(t, value)),
            t if t.is_signed() => Some(FValue::Signed(t, value as i64)),
            FieldType::Boolean => Some(FValue::Boolean(value != 0)),
            _ => None,
        }
    }

    fn check_membership(&mut self, left: &mut StNode, right: &mut StNode) -> Result<(), TypeError> {
        if !matches!(
            left,
            StNode::Field(_) | StNode::Range { .. } | StNode::Function(_)
        ) {
            return Err(TypeError::new(format!(
                "\"{}\" cannot be tested for membership; only a field, slice or function can.",
                left
            )));
        }
        let StNode::Set(elements) = right else {
            return Err(TypeError::new("\"in\" must be followed by a set."));
        };
        for element in elements.iter_mut() {
            match element {
                SetElement::Single(node) => {
                    reject_slice_in_set(node)?;
                    self.check_relation(RelOp::Eq, left, node)?;
                }
                SetElement::Range(low, high) => {
                    reject_slice_in_set(low)?;
                    reject_slice_in_set(high)?;
                    self.check_relation(RelOp::Ge, left, low)?;
                    self.check_relation(RelOp::Le, left, high)?;
                }
            }
        }
        Ok(())
    }

    fn check_function(&mut self, call: &mut FunctionCall) -> Result<FieldType, TypeError> {
        let func = call.func.clone();
        let name = func.name();
        let count = call.params.len();
        let min = func.function().min_args();
        let max = func.function().max_args();
        if count < min {
            return Err(TypeError::new(format!(
                "Function {} needs at least {} argument{}.",
                name,
                min,
                plural(min)
            )));
        }
        if count > max {
            return Err(TypeError::new(format!(
                "Function {} can only accept {} argument{}.",
                name,
                max,
                plural(max)
            )));
        }

        let mut types = Vec::with_capacity(count);
        for param in call.params.iter_mut() {
            types.push(self.entity_type(param)?);
        }
        // Literal arguments take the type of the first typed argument.
        let literal_type = types
            .iter()
            .flatten()
            .next()
            .copied()
            .unwrap_or(FieldType::String);

        let mut params = Vec::with_capacity(count);
        for (param, ftype) in call.params.iter_mut().zip(types) {
            match ftype {
                Some(ftype) => params.push(FunctionParam {
                    ftype,
                    literal: false,
                }),
                None => {
                    let value = self.literal_value(RelOp::Eq, literal_type, None, param)?;
                    *param = StNode::Fvalue(value);
                    params.push(FunctionParam {
                        ftype: literal_type,
                        literal: true,
                    });
                }
            }
        }
        func.function().check(&params).map_err(TypeError)
    }
}

fn wrap_whole(node: &mut StNode, ftype: FieldType) -> Result<(), TypeError> {
    if !ftype.can_slice() {
        return Err(TypeError::new(format!(
            "\"{}\" is a {} and cannot be converted into a sequence of bytes.",
            node, ftype
        )));
    }
    let inner = std::mem::replace(node, StNode::Unparsed(String::new()));
    *node = StNode::range(inner, DRange::whole());
    Ok(())
}

fn reject_slice_in_set(node: &StNode) -> Result<(), TypeError> {
    match node {
        StNode::Range { .. } => Err(TypeError::new(format!(
            "Slices are not allowed in a set: \"{}\".",
            node
        ))),
        _ => Ok(()),
    }
}

fn not_a_field(name: &str) -> TypeError {
    TypeError::new(format!("\"{}\" is neither a field nor a protocol name.", name))
}

fn literal_text(node: &StNode) -> String {
    match node {
        StNode::String(s) => String::from_utf8_lossy(s).into_owned(),
        StNode::Unparsed(s) => s.clone(),
        other => other.to_string(),
    }
}

fn logical_symbol(op: TestOp) -> &'static str {
    match op {
        TestOp::And => "&&",
        TestOp::Or => "||",
        _ => "?",
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}
