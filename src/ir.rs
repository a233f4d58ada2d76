//! Intermediate Representation (IR) for the filter engine.
//!
//! This module defines the register-machine instructions the code generator
//! emits and the VM executes, and their human-readable listing.

use crate::drange::DRange;
use crate::ftypes::{FValue, StringRepr};
use crate::functions::FunctionRef;
use crate::registry::FieldId;
use crate::syntax_tree::{Quantifier, RelOp};
use std::fmt;

/// A slot in the register file. Each register holds a list of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(pub usize);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg#{}", self.0)
    }
}

/// A field as the VM sees it: the head of its same-name chain and every
/// member of that chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldOperand {
    pub id: FieldId,
    pub abbrev: String,
    /// Values are read as their raw byte representation.
    pub raw: bool,
    pub chain: Vec<FieldId>,
}

impl fmt::Display for FieldOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw {
            f.write_str("@")?;
        }
        f.write_str(&self.abbrev)
    }
}

/// A constant materialized once, when the compiled filter is created.
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub value: FValue,
    pub dst: Register,
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} {} <{}> -> {}",
            "PUT_FVALUE",
            self.value
                .to_string_repr(StringRepr::Filter)
                .unwrap_or_else(|| "\"\"".to_string()),
            self.value.ftype().ident(),
            self.dst
        )
    }
}

/// A single instruction in the per-packet program.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Accumulator := the field, or any field sharing its name, is present.
    CheckExists(FieldOperand),
    /// Reads every occurrence of a field into `dst`; accumulator := any found.
    ReadTree { field: FieldOperand, dst: Register },
    /// Calls a native function; accumulator := it produced a result.
    CallFunction {
        func: FunctionRef,
        args: Vec<Register>,
        dst: Register,
    },
    /// Slices every value of `src` into `dst`.
    MkRange {
        src: Register,
        dst: Register,
        range: DRange,
    },
    /// Accumulator := the relation holds for any (or all) value pairs.
    Relation {
        op: RelOp,
        quantifier: Quantifier,
        lhs: Register,
        rhs: Register,
    },
    /// Accumulator := some value of `lhs` lies within `[low, high]`.
    AnyInRange {
        lhs: Register,
        low: Register,
        high: Register,
    },
    Not,
    IfTrueGoto(usize),
    IfFalseGoto(usize),
    Return,
}

impl Instruction {
    pub fn mnemonic(&self) -> String {
        match self {
            Instruction::CheckExists(_) => "CHECK_EXISTS".to_string(),
            Instruction::ReadTree { .. } => "READ_TREE".to_string(),
            Instruction::CallFunction { .. } => "CALL_FUNCTION".to_string(),
            Instruction::MkRange { .. } => "MK_RANGE".to_string(),
            Instruction::Relation { op, quantifier, .. } => {
                let prefix = match quantifier.effective() {
                    Quantifier::All => "ALL",
                    _ => "ANY",
                };
                format!("{}_{}", prefix, op.ident())
            }
            Instruction::AnyInRange { .. } => "ANY_IN_RANGE".to_string(),
            Instruction::Not => "NOT".to_string(),
            Instruction::IfTrueGoto(_) => "IF_TRUE_GOTO".to_string(),
            Instruction::IfFalseGoto(_) => "IF_FALSE_GOTO".to_string(),
            Instruction::Return => "RETURN".to_string(),
        }
    }

    /// Target of a conditional jump.
    pub fn jump_target(&self) -> Option<usize> {
        match self {
            Instruction::IfTrueGoto(t) | Instruction::IfFalseGoto(t) => Some(*t),
            _ => None,
        }
    }

    pub(crate) fn set_jump_target(&mut self, target: usize) {
        if let Instruction::IfTrueGoto(t) | Instruction::IfFalseGoto(t) = self {
            *t = target;
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<16}", self.mnemonic())?;
        match self {
            Instruction::CheckExists(field) => write!(f, " {}", field),
            Instruction::ReadTree { field, dst } => write!(f, " {} -> {}", field, dst),
            Instruction::CallFunction { func, args, dst } => {
                write!(f, " {}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ") -> {}", dst)
            }
            Instruction::MkRange { src, dst, range } => {
                write!(f, " {}{} -> {}", src, range, dst)
            }
            Instruction::Relation { lhs, rhs, .. } => write!(f, " {} {}", lhs, rhs),
            Instruction::AnyInRange { lhs, low, high } => {
                write!(f, " {} in {{{} .. {}}}", lhs, low, high)
            }
            Instruction::IfTrueGoto(t) | Instruction::IfFalseGoto(t) => write!(f, " {}", t),
            Instruction::Not | Instruction::Return => Ok(()),
        }
    }
}

/// Generated code: the per-packet instructions plus the constants they read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub insns: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub num_registers: usize,
}

impl Program {
    /// Listing of the constants, then of every instruction in program order.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        if !self.constants.is_empty() {
            out.push_str("Constants:\n");
            for (i, constant) in self.constants.iter().enumerate() {
                out.push_str(&format!("{:04} {}\n", i, constant.to_string().trim_end()));
            }
            out.push('\n');
        }
        out.push_str("Instructions:\n");
        for (i, insn) in self.insns.iter().enumerate() {
            out.push_str(&format!("{:04} {}\n", i, insn.to_string().trim_end()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftypes::FieldType;

    fn port() -> FieldOperand {
        FieldOperand {
            id: 1,
            abbrev: "tcp.port".into(),
            raw: false,
            chain: vec![1],
        }
    }

    #[test]
    fn test_instruction_rendering() {
        let read = Instruction::ReadTree {
            field: port(),
            dst: Register(0),
        };
        assert_eq!(read.to_string(), "READ_TREE        tcp.port -> reg#0");
        let relation = Instruction::Relation {
            op: RelOp::Ne,
            quantifier: Quantifier::All,
            lhs: Register(0),
            rhs: Register(1),
        };
        assert_eq!(relation.mnemonic(), "ALL_NE");
        assert_eq!(relation.to_string(), "ALL_NE           reg#0 reg#1");
        let default = Instruction::Relation {
            op: RelOp::BitwiseAnd,
            quantifier: Quantifier::Default,
            lhs: Register(0),
            rhs: Register(1),
        };
        assert_eq!(default.mnemonic(), "ANY_BITWISE_AND");
        assert_eq!(Instruction::IfFalseGoto(7).to_string(), "IF_FALSE_GOTO    7");
        assert_eq!(Instruction::Return.to_string().trim_end(), "RETURN");
    }

    #[test]
    fn test_jump_targets() {
        let mut jump = Instruction::IfTrueGoto(3);
        assert_eq!(jump.jump_target(), Some(3));
        jump.set_jump_target(5);
        assert_eq!(jump, Instruction::IfTrueGoto(5));
        assert_eq!(Instruction::Not.jump_target(), None);
    }

    #[test]
    fn test_program_listing() {
        let program = Program {
            insns: vec![
                Instruction::ReadTree {
                    field: port(),
                    dst: Register(0),
                },
                Instruction::IfFalseGoto(3),
                Instruction::Relation {
                    op: RelOp::Eq,
                    quantifier: Quantifier::Default,
                    lhs: Register(0),
                    rhs: Register(1),
                },
                Instruction::Return,
            ],
            constants: vec![Constant {
                value: FValue::Unsigned(FieldType::UInt16, 80),
                dst: Register(1),
            }],
            num_registers: 2,
        };
        assert_eq!(
            program.listing(),
            "Constants:\n\
             0000 PUT_FVALUE       80 <FT_UINT16> -> reg#1\n\
             \n\
             Instructions:\n\
             0000 READ_TREE        tcp.port -> reg#0\n\
             0001 IF_FALSE_GOTO    3\n\
             0002 ANY_EQ           reg#0 reg#1\n\
             0003 RETURN\n"
        );
    }
}
