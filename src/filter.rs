//! Filter module: wraps compiled filters and provides the main execution API.
//!
//! This module provides the CompiledFilter type. A compiled filter is
//! immutable; its constants are materialized once, here, and every
//! evaluation allocates its own register file.

use crate::compiler::GeneratedCode;
use crate::ir::Program;
use crate::registry::FieldId;
use crate::semcheck::Warning;
use crate::tree::FieldTree;
use crate::vm::{execute, load_constants, ConstantRegisters};

/// A compiled filter, ready for execution.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    text: String,
    expanded: String,
    program: Program,
    constants: ConstantRegisters,
    interesting: Vec<FieldId>,
    warnings: Vec<Warning>,
    syntax_tree: Option<String>,
}

impl CompiledFilter {
    pub(crate) fn new(
        text: &str,
        expanded: String,
        code: GeneratedCode,
        syntax_tree: String,
        warnings: Vec<Warning>,
    ) -> Self {
        let constants = load_constants(&code.program);
        Self {
            text: text.to_string(),
            expanded,
            program: code.program,
            constants,
            interesting: code.interesting,
            warnings,
            syntax_tree: Some(syntax_tree),
        }
    }

    /// The filter compiled from empty text; it matches every packet.
    pub(crate) fn match_all(text: &str, expanded: String) -> Self {
        Self {
            text: text.to_string(),
            expanded,
            program: Program::default(),
            constants: Vec::new(),
            interesting: Vec::new(),
            warnings: Vec::new(),
            syntax_tree: None,
        }
    }

    pub fn evaluate(&self, tree: &dyn FieldTree) -> bool {
        if self.is_match_all() {
            return true;
        }
        execute(&self.program, &self.constants, tree)
    }

    pub fn is_match_all(&self) -> bool {
        self.program.insns.is_empty()
    }

    /// Fields the filter may read, for priming a tree before dissection.
    pub fn interesting_fields(&self) -> &[FieldId] {
        &self.interesting
    }

    /// Human-readable listing of the constants and instructions.
    pub fn dump(&self) -> String {
        self.program.listing()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn deprecated_warnings(&self) -> Vec<String> {
        self.warnings
            .iter()
            .filter(|w| w.is_deprecation())
            .map(ToString::to_string)
            .collect()
    }

    /// The text as written, before macro expansion.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expanded_text(&self) -> &str {
        &self.expanded
    }

    /// Debug rendering of the checked syntax tree.
    pub fn syntax_tree(&self) -> Option<&str> {
        self.syntax_tree.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FilterEngine;
    use crate::ftypes::{FValue, FieldType};
    use crate::registry::{FieldRegistry, FieldRegistryBuilder, FieldSpec};
    use crate::tree::ProtoTree;

    fn registry() -> FieldRegistry {
        FieldRegistryBuilder::new()
            .field("tcp.port", FieldType::UInt16)
            .field("http.host", FieldType::String)
            .spec(FieldSpec::new("bootp", FieldType::Protocol).deprecated_by("dhcp"))
            .build()
    }

    fn packet(reg: &FieldRegistry, port: u64) -> ProtoTree {
        let mut tree = ProtoTree::new();
        tree.add(reg, "tcp.port", FValue::Unsigned(FieldType::UInt16, port)).unwrap();
        tree
    }

    #[test]
    fn test_compiled_filter_evaluate() {
        let engine = FilterEngine::new(registry());
        let filter = engine.compile("tcp.port == 80").unwrap();
        assert!(filter.evaluate(&packet(engine.registry(), 80)));
        assert!(!filter.evaluate(&packet(engine.registry(), 81)));
        assert!(!filter.evaluate(&ProtoTree::new()));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let engine = FilterEngine::new(registry());
        let filter = engine.compile("   ").unwrap();
        assert!(filter.is_match_all());
        assert!(filter.evaluate(&ProtoTree::new()));
        assert!(filter.interesting_fields().is_empty());
        assert_eq!(filter.dump(), "Instructions:\n");
        assert_eq!(filter.syntax_tree(), None);
    }

    #[test]
    fn test_interesting_fields_and_dump() {
        let engine = FilterEngine::new(registry());
        let filter = engine.compile("http.host || tcp.port == 80").unwrap();
        assert_eq!(filter.interesting_fields(), &[0, 1]);
        let dump = filter.dump();
        assert!(dump.starts_with("Constants:\n0000 PUT_FVALUE       80 <FT_UINT16> -> reg#1\n"));
        assert!(dump.contains("0000 CHECK_EXISTS     http.host\n"));
        assert!(dump.ends_with("RETURN\n"));
        assert_eq!(
            filter.syntax_tree(),
            Some(
                "TEST(or)\n  TEST(exists)\n    FIELD(http.host <FT_STRING>)\n  TEST(any_eq)\n    \
                 FIELD(tcp.port <FT_UINT16>)\n    FVALUE(80 <FT_UINT16>)\n"
            )
        );
    }

    #[test]
    fn test_deprecated_warnings() {
        let engine = FilterEngine::new(registry());
        let filter = engine.compile("bootp || tcp.port != 1 && http.host").unwrap();
        assert_eq!(filter.warnings().len(), 3);
        assert_eq!(
            filter.deprecated_warnings(),
            vec![
                "\"bootp\" is deprecated, use \"dhcp\" instead.".to_string(),
                "\"!=\" is deprecated or may have unexpected results. \
                 Consider using \"!==\" (all_ne) or \"~=\" (any_ne) instead."
                    .to_string(),
            ]
        );
    }

    #[test]
    fn test_concurrent_evaluation() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CompiledFilter>();

        let engine = FilterEngine::new(registry());
        let filter = engine.compile("tcp.port in {80 443}").unwrap();
        let reg = engine.registry();
        std::thread::scope(|s| {
            for port in [80u64, 443, 22] {
                let filter = &filter;
                s.spawn(move || {
                    let tree = packet(reg, port);
                    assert_eq!(filter.evaluate(&tree), port != 22);
                });
            }
        });
    }
}
