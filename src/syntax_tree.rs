//! Syntax tree module: the parsed representation of a display filter.
//!
//! This module provides the StNode sum type. The parser builds it, the
//! semantic checker rewrites it in place (literals become typed values,
//! implicit byte conversions are inserted) and the code generator lowers it.
//! Every node owns its children, so `clone` is a deep copy.

use crate::drange::DRange;
use crate::ftypes::{FValue, FieldType, StringRepr};
use crate::functions::FunctionRef;
use crate::lex::quote_bytes;
use crate::registry::{FieldId, HeaderFieldInfo};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    BitwiseAnd,
    Contains,
    Matches,
}

impl RelOp {
    /// Name used in instruction listings, e.g. `EQ` in `ANY_EQ`.
    pub fn ident(self) -> &'static str {
        match self {
            RelOp::Eq => "EQ",
            RelOp::Ne => "NE",
            RelOp::Gt => "GT",
            RelOp::Ge => "GE",
            RelOp::Lt => "LT",
            RelOp::Le => "LE",
            RelOp::BitwiseAnd => "BITWISE_AND",
            RelOp::Contains => "CONTAINS",
            RelOp::Matches => "MATCHES",
        }
    }
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelOp::Eq => "==",
            RelOp::Ne => "!=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::BitwiseAnd => "&",
            RelOp::Contains => "contains",
            RelOp::Matches => "matches",
        };
        f.write_str(s)
    }
}

/// How a relation combines the occurrences of a multi-valued field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Quantifier {
    /// Not written in the filter; behaves as `Any`.
    #[default]
    Default,
    Any,
    All,
}

impl Quantifier {
    /// `Default` resolved to the quantifier it behaves as.
    pub fn effective(self) -> Quantifier {
        match self {
            Quantifier::All => Quantifier::All,
            _ => Quantifier::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOp {
    Exists,
    Not,
    And,
    Or,
    Relation(RelOp),
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestNode {
    pub op: TestOp,
    pub quantifier: Quantifier,
    pub left: Box<StNode>,
    pub right: Option<Box<StNode>>,
    /// Written inside explicit parentheses.
    pub parenthesized: bool,
}

impl TestNode {
    pub fn unary(op: TestOp, operand: StNode) -> Self {
        Self {
            op,
            quantifier: Quantifier::Default,
            left: Box::new(operand),
            right: None,
            parenthesized: false,
        }
    }

    pub fn binary(op: TestOp, left: StNode, right: StNode) -> Self {
        Self {
            op,
            quantifier: Quantifier::Default,
            left: Box::new(left),
            right: Some(Box::new(right)),
            parenthesized: false,
        }
    }
}

/// A reference to a registered field, by the head of its same-name chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub id: FieldId,
    pub abbrev: String,
    pub ftype: FieldType,
    /// Written as `@field`: values are compared as raw bytes.
    pub raw: bool,
}

impl FieldRef {
    pub fn new(info: &HeaderFieldInfo, raw: bool) -> Self {
        Self {
            id: info.id,
            abbrev: info.abbrev.clone(),
            ftype: info.ftype,
            raw,
        }
    }

    /// The type the field's values have when read for comparison.
    pub fn value_type(&self) -> FieldType {
        if self.raw {
            FieldType::Bytes
        } else {
            self.ftype
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub func: FunctionRef,
    pub params: Vec<StNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetElement {
    Single(StNode),
    /// `low..high`, both ends inclusive.
    Range(StNode, StNode),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StNode {
    Test(TestNode),
    Field(FieldRef),
    Fvalue(FValue),
    Range { entity: Box<StNode>, drange: DRange },
    Function(FunctionCall),
    Set(Vec<SetElement>),
    /// Quoted literal; escapes may produce bytes that are not UTF-8.
    String(Vec<u8>),
    Unparsed(String),
}

impl StNode {
    pub fn test(test: TestNode) -> Self {
        StNode::Test(test)
    }

    pub fn range(entity: StNode, drange: DRange) -> Self {
        StNode::Range {
            entity: Box::new(entity),
            drange,
        }
    }

    /// Short name of the variant, used in diagnostics and dumps.
    pub fn kind(&self) -> &'static str {
        match self {
            StNode::Test(_) => "TEST",
            StNode::Field(_) => "FIELD",
            StNode::Fvalue(_) => "FVALUE",
            StNode::Range { .. } => "RANGE",
            StNode::Function(_) => "FUNCTION",
            StNode::Set(_) => "SET",
            StNode::String(_) => "STRING",
            StNode::Unparsed(_) => "UNPARSED",
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, StNode::String(_) | StNode::Unparsed(_))
    }

    /// Indented, variant-tagged rendering of the whole tree.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        match self {
            StNode::Test(test) => {
                let _ = match test.op {
                    TestOp::Relation(op) => writeln!(
                        out,
                        "{}TEST({}_{})",
                        indent,
                        quantifier_label(test.quantifier),
                        op.ident().to_ascii_lowercase()
                    ),
                    op => writeln!(out, "{}TEST({})", indent, test_op_label(op)),
                };
                test.left.dump_into(out, depth + 1);
                if let Some(right) = &test.right {
                    right.dump_into(out, depth + 1);
                }
            }
            StNode::Field(field) => {
                let _ = writeln!(
                    out,
                    "{}FIELD({}{} <{}>)",
                    indent,
                    if field.raw { "@" } else { "" },
                    field.abbrev,
                    field.ftype.ident()
                );
            }
            StNode::Fvalue(value) => {
                let _ = writeln!(
                    out,
                    "{}FVALUE({} <{}>)",
                    indent,
                    value.to_string_repr(StringRepr::Filter).unwrap_or_default(),
                    value.ftype().ident()
                );
            }
            StNode::Range { entity, drange } => {
                let _ = writeln!(out, "{}RANGE({})", indent, drange);
                entity.dump_into(out, depth + 1);
            }
            StNode::Function(call) => {
                let _ = writeln!(out, "{}FUNCTION({})", indent, call.func.name());
                for param in &call.params {
                    param.dump_into(out, depth + 1);
                }
            }
            StNode::Set(elements) => {
                let _ = writeln!(out, "{}SET", indent);
                for element in elements {
                    match element {
                        SetElement::Single(node) => node.dump_into(out, depth + 1),
                        SetElement::Range(low, high) => {
                            let _ = writeln!(out, "{}  RANGE_ELEMENT", indent);
                            low.dump_into(out, depth + 2);
                            high.dump_into(out, depth + 2);
                        }
                    }
                }
            }
            StNode::String(s) => {
                let _ = writeln!(out, "{}STRING({})", indent, quote_bytes(s));
            }
            StNode::Unparsed(s) => {
                let _ = writeln!(out, "{}UNPARSED({})", indent, s);
            }
        }
    }
}

fn quantifier_label(q: Quantifier) -> &'static str {
    match q.effective() {
        Quantifier::All => "all",
        _ => "any",
    }
}

fn test_op_label(op: TestOp) -> &'static str {
    match op {
        TestOp::Exists => "exists",
        TestOp::Not => "not",
        TestOp::And => "and",
        TestOp::Or => "or",
        TestOp::In => "in",
        TestOp::Relation(_) => "relation",
    }
}

impl fmt::Display for StNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StNode::Test(test) => {
                if test.parenthesized {
                    f.write_str("(")?;
                }
                match (test.op, &test.right) {
                    (TestOp::Exists, _) => write!(f, "{}", test.left)?,
                    (TestOp::Not, _) => write!(f, "!{}", test.left)?,
                    (TestOp::And, Some(right)) => write!(f, "{} && {}", test.left, right)?,
                    (TestOp::Or, Some(right)) => write!(f, "{} || {}", test.left, right)?,
                    (TestOp::In, Some(right)) => write!(f, "{} in {}", test.left, right)?,
                    (TestOp::Relation(op), Some(right)) => {
                        match test.quantifier {
                            Quantifier::Default => {}
                            Quantifier::Any => f.write_str("any ")?,
                            Quantifier::All => f.write_str("all ")?,
                        }
                        write!(f, "{} {} {}", test.left, op, right)?
                    }
                    (_, None) => write!(f, "{}", test.left)?,
                }
                if test.parenthesized {
                    f.write_str(")")?;
                }
                Ok(())
            }
            StNode::Field(field) if field.raw => write!(f, "@{}", field.abbrev),
            StNode::Field(field) => f.write_str(&field.abbrev),
            StNode::Fvalue(value) => match value.to_string_repr(StringRepr::Filter) {
                Some(repr) => f.write_str(&repr),
                None => f.write_str("\"\""),
            },
            StNode::Range { entity, drange } => write!(f, "{}{}", entity, drange),
            StNode::Function(call) => {
                write!(f, "{}(", call.func.name())?;
                for (i, param) in call.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                f.write_str(")")
            }
            StNode::Set(elements) => {
                f.write_str("{")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    match element {
                        SetElement::Single(node) => write!(f, "{}", node)?,
                        SetElement::Range(low, high) => write!(f, "{}..{}", low, high)?,
                    }
                }
                f.write_str("}")
            }
            StNode::String(s) => f.write_str(&quote_bytes(s)),
            StNode::Unparsed(s) => f.write_str(s),
        }
    }
}
