//! Compiler module: lowers a checked syntax tree into register-machine code.
//!
//! Jumps are emitted against labels and resolved to absolute instruction
//! indices in a second pass. An optional peephole pass then shortens jump
//! chains and drops jumps that only fall through.

use crate::ir::{Constant, FieldOperand, Instruction, Program, Register};
use crate::registry::{FieldId, FieldRegistry};
use crate::syntax_tree::{
    FieldRef, FunctionCall, Quantifier, RelOp, SetElement, StNode, TestNode, TestOp,
};
use crate::ftypes::FValue;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// The output of code generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCode {
    pub program: Program,
    /// Every field the program may read, including same-name chain members.
    pub interesting: Vec<FieldId>,
}

pub struct DefaultCompiler;

impl DefaultCompiler {
    pub fn compile(tree: &StNode, registry: &FieldRegistry, optimize: bool) -> GeneratedCode {
        let mut code = CodeGenerator::new(registry).generate(tree);
        if optimize {
            optimize_program(&mut code.program);
        }
        code
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Label(usize);

enum Pending {
    Insn(Instruction),
    IfTrue(Label),
    IfFalse(Label),
}

pub struct CodeGenerator<'r> {
    registry: &'r FieldRegistry,
    code: Vec<Pending>,
    labels: Vec<Option<usize>>,
    constants: Vec<Constant>,
    next_register: usize,
    loaded_fields: HashMap<(FieldId, bool), Register>,
    interesting: BTreeSet<FieldId>,
}

impl<'r> CodeGenerator<'r> {
    pub fn new(registry: &'r FieldRegistry) -> Self {
        Self {
            registry,
            code: Vec::new(),
            labels: Vec::new(),
            constants: Vec::new(),
            next_register: 0,
            loaded_fields: HashMap::new(),
            interesting: BTreeSet::new(),
        }
    }

    pub fn generate(mut self, tree: &StNode) -> GeneratedCode {
        self.gen_node(tree);
        self.emit(Instruction::Return);

        let end = self.code.len() - 1;
        let labels = self.labels;
        let resolve = |label: Label| labels.get(label.0).copied().flatten().unwrap_or(end);
        let insns: Vec<Instruction> = self
            .code
            .into_iter()
            .map(|pending| match pending {
                Pending::Insn(insn) => insn,
                Pending::IfTrue(label) => Instruction::IfTrueGoto(resolve(label)),
                Pending::IfFalse(label) => Instruction::IfFalseGoto(resolve(label)),
            })
            .collect();
        debug!(
            instructions = insns.len(),
            constants = self.constants.len(),
            registers = self.next_register,
            "generated filter program"
        );
        GeneratedCode {
            program: Program {
                insns,
                constants: self.constants,
                num_registers: self.next_register,
            },
            interesting: self.interesting.into_iter().collect(),
        }
    }

    fn emit(&mut self, insn: Instruction) {
        self.code.push(Pending::Insn(insn));
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next instruction emitted.
    fn place(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    fn new_register(&mut self) -> Register {
        let reg = Register(self.next_register);
        self.next_register += 1;
        reg
    }

    fn operand(&mut self, field: &FieldRef) -> FieldOperand {
        let chain: Vec<FieldId> = self
            .registry
            .same_name_chain(field.id)
            .map(|info| info.id)
            .collect();
        self.interesting.extend(chain.iter().copied());
        FieldOperand {
            id: field.id,
            abbrev: field.abbrev.clone(),
            raw: field.raw,
            chain,
        }
    }

    fn gen_node(&mut self, node: &StNode) {
        match node {
            StNode::Test(test) => self.gen_test(test),
            other => {
                let end = self.new_label();
                self.gen_entity(other, end);
                self.place(end);
            }
        }
    }

    fn gen_test(&mut self, test: &TestNode) {
        match (test.op, test.right.as_deref()) {
            (TestOp::Exists, _) => match test.left.as_ref() {
                StNode::Field(field) => {
                    let operand = self.operand(field);
                    self.emit(Instruction::CheckExists(operand));
                }
                other => self.gen_node(other),
            },
            (TestOp::Not, _) => {
                self.gen_node(&test.left);
                self.emit(Instruction::Not);
            }
            (TestOp::And, Some(right)) => {
                let end = self.new_label();
                self.gen_node(&test.left);
                self.code.push(Pending::IfFalse(end));
                self.gen_node(right);
                self.place(end);
            }
            (TestOp::Or, Some(right)) => {
                let end = self.new_label();
                self.gen_node(&test.left);
                self.code.push(Pending::IfTrue(end));
                self.gen_node(right);
                self.place(end);
            }
            (TestOp::Relation(op), Some(right)) => {
                let end = self.new_label();
                let lhs = self.gen_entity(&test.left, end);
                let rhs = self.gen_entity(right, end);
                self.emit(Instruction::Relation {
                    op,
                    quantifier: test.quantifier,
                    lhs,
                    rhs,
                });
                self.place(end);
            }
            (TestOp::In, Some(StNode::Set(elements))) => {
                let end = self.new_label();
                let lhs = self.gen_entity(&test.left, end);
                for (i, element) in elements.iter().enumerate() {
                    self.gen_set_element(lhs, element, end);
                    if i + 1 < elements.len() {
                        self.code.push(Pending::IfTrue(end));
                    }
                }
                self.place(end);
            }
            (_, right) => {
                // Binary operator with a malformed right side; evaluate the
                // left side alone.
                debug!(op = ?test.op, has_right = right.is_some(), "malformed test node");
                self.gen_node(&test.left);
            }
        }
    }

    fn gen_set_element(&mut self, lhs: Register, element: &SetElement, fail: Label) {
        match element {
            SetElement::Single(node) => {
                let rhs = self.gen_entity(node, fail);
                self.emit(Instruction::Relation {
                    op: RelOp::Eq,
                    quantifier: Quantifier::Any,
                    lhs,
                    rhs,
                });
            }
            SetElement::Range(low, high) => {
                let low = self.gen_entity(low, fail);
                let high = self.gen_entity(high, fail);
                self.emit(Instruction::AnyInRange { lhs, low, high });
            }
        }
    }

    /// Loads an operand into a register. A missing field or a function
    /// without a result jumps to `fail` with a false accumulator.
    fn gen_entity(&mut self, node: &StNode, fail: Label) -> Register {
        match node {
            StNode::Field(field) => {
                let reg = self.read_field(field);
                self.code.push(Pending::IfFalse(fail));
                reg
            }
            StNode::Fvalue(value) => self.put_constant(value.clone()),
            StNode::Range { entity, drange } => {
                let src = self.gen_entity(entity, fail);
                let dst = self.new_register();
                self.emit(Instruction::MkRange {
                    src,
                    dst,
                    range: drange.clone(),
                });
                dst
            }
            StNode::Function(call) => self.gen_call(call, fail),
            StNode::String(s) => {
                self.put_constant(FValue::String(String::from_utf8_lossy(s).into_owned()))
            }
            StNode::Unparsed(s) => self.put_constant(FValue::String(s.clone())),
            StNode::Set(_) | StNode::Test(_) => self.new_register(),
        }
    }

    fn gen_call(&mut self, call: &FunctionCall, fail: Label) -> Register {
        let mut args = Vec::with_capacity(call.params.len());
        for param in &call.params {
            // Absent fields are passed as empty registers, so `count` can
            // see zero occurrences.
            let reg = match param {
                StNode::Field(field) => self.read_field(field),
                other => self.gen_entity(other, fail),
            };
            args.push(reg);
        }
        let dst = self.new_register();
        self.emit(Instruction::CallFunction {
            func: call.func.clone(),
            args,
            dst,
        });
        self.code.push(Pending::IfFalse(fail));
        dst
    }

    fn read_field(&mut self, field: &FieldRef) -> Register {
        let key = (field.id, field.raw);
        let reg = match self.loaded_fields.get(&key) {
            Some(reg) => *reg,
            None => {
                let reg = self.new_register();
                self.loaded_fields.insert(key, reg);
                reg
            }
        };
        let operand = self.operand(field);
        self.emit(Instruction::ReadTree {
            field: operand,
            dst: reg,
        });
        reg
    }

    fn put_constant(&mut self, value: FValue) -> Register {
        let dst = self.new_register();
        self.constants.push(Constant { value, dst });
        dst
    }
}

/// Peephole pass over resolved jumps.
///
/// Walking backwards, each jump target is advanced while the instruction
/// there is known not to change the outcome: a jump of the same polarity is
/// followed to its own target, a jump of the opposite polarity cannot fire
/// and is stepped over, and a repeat of the field read that set the
/// accumulator reproduces it. Jumps to the next instruction are then removed.
pub fn optimize_program(program: &mut Program) {
    let before = program.insns.len();
    let insns = &mut program.insns;

    for i in (0..insns.len()).rev() {
        let (polarity, mut target) = match insns[i] {
            Instruction::IfTrueGoto(t) => (true, t),
            Instruction::IfFalseGoto(t) => (false, t),
            _ => continue,
        };
        let preceding_read = match i.checked_sub(1).map(|p| &insns[p]) {
            Some(read @ Instruction::ReadTree { .. }) => Some(read.clone()),
            _ => None,
        };
        for _ in 0..insns.len() {
            let next = match insns.get(target) {
                Some(Instruction::IfTrueGoto(t)) if polarity => *t,
                Some(Instruction::IfFalseGoto(t)) if !polarity => *t,
                Some(Instruction::IfTrueGoto(_)) | Some(Instruction::IfFalseGoto(_)) => target + 1,
                Some(read @ Instruction::ReadTree { .. }) if preceding_read.as_ref() == Some(read) => {
                    target + 1
                }
                _ => break,
            };
            if next <= i {
                break;
            }
            target = next;
        }
        if insns[i].jump_target() != Some(target) {
            debug!(at = i, target, "retargeted jump");
            insns[i].set_jump_target(target);
        }
    }

    // Drop jumps that land on the following instruction.
    let keep: Vec<bool> = insns
        .iter()
        .enumerate()
        .map(|(i, insn)| insn.jump_target() != Some(i + 1))
        .collect();
    let mut new_index = Vec::with_capacity(insns.len() + 1);
    let mut kept = 0;
    for &k in &keep {
        new_index.push(kept);
        if k {
            kept += 1;
        }
    }
    new_index.push(kept);

    let mut index = 0;
    insns.retain(|_| {
        let k = keep[index];
        index += 1;
        k
    });
    for insn in insns.iter_mut() {
        if let Some(t) = insn.jump_target() {
            insn.set_jump_target(new_index[t.min(new_index.len() - 1)]);
        }
    }
    debug!(before, after = program.insns.len(), "optimized filter program");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::ftypes::FieldType;
    use crate::functions::FunctionRegistry;
    use crate::grammar::FilterParser;
    use crate::registry::FieldRegistryBuilder;
    use crate::semcheck::check;

    fn registry() -> FieldRegistry {
        FieldRegistryBuilder::new()
            .field("frame", FieldType::Protocol)
            .field("tcp.port", FieldType::UInt16)
            .field("http.host", FieldType::String)
            .field("ip.addr", FieldType::Ipv4)
            .field("ip.addr", FieldType::Ipv4)
            .build()
    }

    fn compile(text: &str, optimize: bool) -> GeneratedCode {
        let reg = registry();
        let mut tree = FilterParser::parse(text, &reg, &FunctionRegistry::with_builtins()).unwrap();
        let (result, _) = check(&mut tree, &reg, &EngineOptions::default());
        result.unwrap();
        DefaultCompiler::compile(&tree, &reg, optimize)
    }

    fn mnemonics(code: &GeneratedCode) -> Vec<String> {
        code.program.insns.iter().map(|i| i.mnemonic()).collect()
    }

    #[test]
    fn test_existence() {
        let code = compile("ip.addr", true);
        match &code.program.insns[0] {
            Instruction::CheckExists(field) => assert_eq!(field.chain, vec![3, 4]),
            other => panic!("Expected CHECK_EXISTS, got {:?}", other),
        }
        assert_eq!(code.interesting, vec![3, 4]);
        assert_eq!(mnemonics(&code), vec!["CHECK_EXISTS", "RETURN"]);
    }

    #[test]
    fn test_relation_layout() {
        let code = compile("tcp.port == 80", false);
        assert_eq!(
            code.program.insns,
            vec![
                Instruction::ReadTree {
                    field: FieldOperand {
                        id: 1,
                        abbrev: "tcp.port".into(),
                        raw: false,
                        chain: vec![1],
                    },
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
            ]
        );
        assert_eq!(
            code.program.constants,
            vec![Constant {
                value: FValue::Unsigned(FieldType::UInt16, 80),
                dst: Register(1),
            }]
        );
    }

    #[test]
    fn test_field_register_reuse() {
        let code = compile("tcp.port == 80 || tcp.port == 443", false);
        let reads: Vec<Register> = code
            .program
            .insns
            .iter()
            .filter_map(|i| match i {
                Instruction::ReadTree { dst, .. } => Some(*dst),
                _ => None,
            })
            .collect();
        assert_eq!(reads, vec![Register(0), Register(0)]);
        assert_eq!(code.program.num_registers, 3);
    }

    #[test]
    fn test_membership_chain() {
        let code = compile("tcp.port in {80, 443}", true);
        assert_eq!(
            mnemonics(&code),
            vec!["READ_TREE", "IF_FALSE_GOTO", "ANY_EQ", "IF_TRUE_GOTO", "ANY_EQ", "RETURN"]
        );
        assert_eq!(code.program.insns[1], Instruction::IfFalseGoto(5));
        assert_eq!(code.program.insns[3], Instruction::IfTrueGoto(5));

        let code = compile("tcp.port in {80 1000..2000}", true);
        assert!(mnemonics(&code).contains(&"ANY_IN_RANGE".to_string()));
    }

    #[test]
    fn test_logical_short_circuit() {
        let code = compile("frame && tcp.port", false);
        assert_eq!(
            code.program.insns[1..],
            [Instruction::IfFalseGoto(3), Instruction::CheckExists(FieldOperand {
                id: 1,
                abbrev: "tcp.port".into(),
                raw: false,
                chain: vec![1],
            }), Instruction::Return]
        );
        let code = compile("!frame || tcp.port", false);
        assert_eq!(
            mnemonics(&code),
            vec!["CHECK_EXISTS", "NOT", "IF_TRUE_GOTO", "CHECK_EXISTS", "RETURN"]
        );
    }

    #[test]
    fn test_function_and_range_codegen() {
        let code = compile("len(http.host) > 3", false);
        assert_eq!(
            mnemonics(&code),
            vec!["READ_TREE", "CALL_FUNCTION", "IF_FALSE_GOTO", "ANY_GT", "RETURN"]
        );
        let code = compile("frame[0:2] == 01:02", false);
        assert_eq!(
            mnemonics(&code),
            vec!["READ_TREE", "IF_FALSE_GOTO", "MK_RANGE", "ANY_EQ", "RETURN"]
        );
    }

    #[test]
    fn test_optimizer_coalesces_repeated_reads() {
        let plain = compile("tcp.port == 1 || tcp.port == 2", false);
        assert_eq!(plain.program.insns[1], Instruction::IfFalseGoto(3));

        let code = compile("tcp.port == 1 || tcp.port == 2", true);
        // A missing port on the first read skips the second comparison.
        assert_eq!(code.program.insns[1], Instruction::IfFalseGoto(7));
        assert_eq!(code.program.insns.len(), plain.program.insns.len());
    }

    #[test]
    fn test_optimizer_follows_jump_chains() {
        let code = compile("(frame || tcp.port) || http.host", false);
        assert_eq!(code.program.insns[1], Instruction::IfTrueGoto(3));
        let code = compile("(frame || tcp.port) || http.host", true);
        assert_eq!(
            code.program.insns,
            vec![
                Instruction::CheckExists(FieldOperand {
                    id: 0,
                    abbrev: "frame".into(),
                    raw: false,
                    chain: vec![0],
                }),
                Instruction::IfTrueGoto(5),
                Instruction::CheckExists(FieldOperand {
                    id: 1,
                    abbrev: "tcp.port".into(),
                    raw: false,
                    chain: vec![1],
                }),
                Instruction::IfTrueGoto(5),
                Instruction::CheckExists(FieldOperand {
                    id: 2,
                    abbrev: "http.host".into(),
                    raw: false,
                    chain: vec![2],
                }),
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn test_optimizer_removes_fallthrough_jumps() {
        let mut program = Program {
            insns: vec![
                Instruction::Not,
                Instruction::IfTrueGoto(2),
                Instruction::Not,
                Instruction::IfFalseGoto(4),
                Instruction::Return,
            ],
            constants: Vec::new(),
            num_registers: 0,
        };
        optimize_program(&mut program);
        assert_eq!(
            program.insns,
            vec![Instruction::Not, Instruction::Not, Instruction::Return]
        );
    }
}
