//! Virtual machine module: runs a generated program against one packet.
//!
//! Constant registers are loaded once per compiled filter and shared. Every
//! evaluation gets a fresh register file, so one program can be evaluated
//! from several threads at once.

use crate::ftypes::FValue;
use crate::ir::{Instruction, Program, Register};
use crate::syntax_tree::{Quantifier, RelOp};
use crate::tree::FieldTree;
use std::cmp::Ordering;
use tracing::trace;

/// Constant registers indexed by register number; `None` for registers
/// written at run time.
pub type ConstantRegisters = Vec<Option<Vec<FValue>>>;

/// Materializes the program's constants into their fixed registers.
pub fn load_constants(program: &Program) -> ConstantRegisters {
    let mut registers: ConstantRegisters = vec![None; program.num_registers];
    for constant in &program.constants {
        if let Some(slot) = registers.get_mut(constant.dst.0) {
            slot.get_or_insert_with(Vec::new).push(constant.value.clone());
        }
    }
    registers
}

/// Per-evaluation register state.
struct RegisterFile<'c> {
    constants: &'c [Option<Vec<FValue>>],
    values: Vec<Vec<FValue>>,
    attempted: Vec<bool>,
}

impl<'c> RegisterFile<'c> {
    fn new(constants: &'c [Option<Vec<FValue>>], size: usize) -> Self {
        Self {
            constants,
            values: vec![Vec::new(); size],
            attempted: vec![false; size],
        }
    }

    fn get(&self, reg: Register) -> &[FValue] {
        match self.constants.get(reg.0) {
            Some(Some(values)) => values,
            _ => self.values.get(reg.0).map_or(&[], Vec::as_slice),
        }
    }

    fn set(&mut self, reg: Register, values: Vec<FValue>) {
        if let Some(slot) = self.values.get_mut(reg.0) {
            *slot = values;
        }
        if let Some(flag) = self.attempted.get_mut(reg.0) {
            *flag = true;
        }
    }

    fn was_attempted(&self, reg: Register) -> bool {
        self.attempted.get(reg.0).copied().unwrap_or(false)
    }
}

/// Runs `program` against `tree` and returns the verdict.
pub fn execute(program: &Program, constants: &[Option<Vec<FValue>>], tree: &dyn FieldTree) -> bool {
    let mut registers = RegisterFile::new(constants, program.num_registers);
    let mut accumulator = false;
    let mut pc = 0;

    while let Some(insn) = program.insns.get(pc) {
        pc += 1;
        match insn {
            Instruction::CheckExists(field) => {
                accumulator = field.chain.iter().any(|id| tree.field_exists(*id));
            }
            Instruction::ReadTree { field, dst } => {
                if !registers.was_attempted(*dst) {
                    let mut values = Vec::new();
                    for id in &field.chain {
                        values.extend(tree.read_field_values(*id));
                    }
                    if field.raw {
                        values = values
                            .into_iter()
                            .map(|v| FValue::Bytes(v.to_bytes()))
                            .collect();
                    }
                    registers.set(*dst, values);
                }
                accumulator = !registers.get(*dst).is_empty();
            }
            Instruction::CallFunction { func, args, dst } => {
                let result = {
                    let params: Vec<&[FValue]> = args.iter().map(|r| registers.get(*r)).collect();
                    func.function().call(&params)
                };
                accumulator = result.is_some();
                registers.set(*dst, result.unwrap_or_default());
            }
            Instruction::MkRange { src, dst, range } => {
                let sliced: Vec<FValue> = registers
                    .get(*src)
                    .iter()
                    .filter_map(|v| v.slice(range))
                    .collect();
                registers.set(*dst, sliced);
            }
            Instruction::Relation {
                op,
                quantifier,
                lhs,
                rhs,
            } => {
                accumulator = relation(*op, *quantifier, registers.get(*lhs), registers.get(*rhs));
            }
            Instruction::AnyInRange { lhs, low, high } => {
                let (low, high) = (registers.get(*low), registers.get(*high));
                accumulator = registers.get(*lhs).iter().any(|v| {
                    low.iter().any(|lo| {
                        matches!(v.compare(lo), Some(Ordering::Greater | Ordering::Equal))
                    }) && high.iter().any(|hi| {
                        matches!(v.compare(hi), Some(Ordering::Less | Ordering::Equal))
                    })
                });
            }
            Instruction::Not => accumulator = !accumulator,
            Instruction::IfTrueGoto(target) => {
                if accumulator {
                    pc = *target;
                }
            }
            Instruction::IfFalseGoto(target) => {
                if !accumulator {
                    pc = *target;
                }
            }
            Instruction::Return => break,
        }
    }

    trace!(verdict = accumulator, "evaluated filter");
    accumulator
}

/// Cross-product test of two registers. `All` over an empty register is
/// false.
fn relation(op: RelOp, quantifier: Quantifier, lhs: &[FValue], rhs: &[FValue]) -> bool {
    let test = |a: &FValue, b: &FValue| match op {
        RelOp::Eq => a.equals(b),
        RelOp::Ne => !a.equals(b),
        RelOp::Gt => a.compare(b) == Some(Ordering::Greater),
        RelOp::Ge => matches!(a.compare(b), Some(Ordering::Greater | Ordering::Equal)),
        RelOp::Lt => a.compare(b) == Some(Ordering::Less),
        RelOp::Le => matches!(a.compare(b), Some(Ordering::Less | Ordering::Equal)),
        RelOp::BitwiseAnd => a.bitwise_and(b),
        RelOp::Contains => a.contains(b),
        RelOp::Matches => a.matches(b),
    };
    match quantifier.effective() {
        Quantifier::All => {
            !lhs.is_empty()
                && !rhs.is_empty()
                && lhs.iter().all(|a| rhs.iter().all(|b| test(a, b)))
        }
        _ => lhs.iter().any(|a| rhs.iter().any(|b| test(a, b))),
    }
}
