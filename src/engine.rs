//! Engine module: the front door tying the compiler pipeline together.
//!
//! A `FilterEngine` owns the field catalogue, the function registry and the
//! current macro table, and turns filter text into [`CompiledFilter`]s:
//! macro expansion, parsing, semantic checking, code generation and
//! optional optimization, in that order.

use crate::compiler::DefaultCompiler;
use crate::filter::CompiledFilter;
use crate::functions::{FilterFunction, FunctionRegistry};
use crate::grammar::FilterParser;
use crate::macros::{FieldValueCache, MacroContext, MacroStore, MacroTable};
use crate::registry::FieldRegistry;
use crate::semcheck::check;
use crate::syntax_tree::StNode;
use crate::DfilterError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Compilation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Run the peephole pass over generated code.
    pub optimize: bool,
    /// Report deprecated fields and the `!=` operator.
    pub warn_deprecated: bool,
    /// Report `&&` mixed with `||` without parentheses.
    pub warn_parentheses: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            warn_deprecated: true,
            warn_parentheses: true,
        }
    }
}

pub struct FilterEngine {
    registry: Arc<FieldRegistry>,
    functions: Arc<FunctionRegistry>,
    macros: MacroStore,
    options: EngineOptions,
}

impl FilterEngine {
    /// An engine with the built-in functions, no macros and default options.
    pub fn new(registry: FieldRegistry) -> Self {
        Self::builder(registry).build()
    }

    pub fn builder(registry: FieldRegistry) -> FilterEngineBuilder {
        FilterEngineBuilder::new(registry)
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn macros(&self) -> &MacroStore {
        &self.macros
    }

    /// Swaps in a new macro table; compilations already running keep the
    /// table they started with.
    pub fn set_macros(&self, table: MacroTable) {
        self.macros.replace_table(table);
    }

    pub fn set_field_values(&self, cache: Option<FieldValueCache>) {
        self.macros.replace_field_values(cache);
    }

    pub fn expand(&self, text: &str) -> Result<String, DfilterError> {
        Ok(self.macros.expand(text)?)
    }

    /// Expands and parses `text` without checking it.
    pub fn parse(&self, text: &str) -> Result<StNode, DfilterError> {
        let expanded = self.expand(text)?;
        FilterParser::parse(&expanded, &self.registry, &self.functions)
            .map_err(|e| DfilterError::syntax(e, &expanded))
    }

    pub fn compile(&self, text: &str) -> Result<CompiledFilter, DfilterError> {
        let expanded = self.expand(text)?;
        debug!(filter = text, expanded = %expanded, "compiling filter");
        if expanded.trim().is_empty() {
            return Ok(CompiledFilter::match_all(text, expanded));
        }

        let mut tree = FilterParser::parse(&expanded, &self.registry, &self.functions)
            .map_err(|e| DfilterError::syntax(e, &expanded))?;
        let (result, warnings) = check(&mut tree, &self.registry, &self.options);
        result?;
        if !warnings.is_empty() {
            let messages: Vec<String> = warnings.iter().map(ToString::to_string).collect();
            warn!(filter = text, warnings = ?messages, "filter compiled with warnings");
        }

        let code = DefaultCompiler::compile(&tree, &self.registry, self.options.optimize);
        debug!(
            instructions = code.program.insns.len(),
            interesting = code.interesting.len(),
            "filter compiled"
        );
        Ok(CompiledFilter::new(text, expanded, code, tree.dump(), warnings))
    }
}

/// Builder for [`FilterEngine`].
pub struct FilterEngineBuilder {
    registry: FieldRegistry,
    functions: FunctionRegistry,
    macros: MacroTable,
    options: EngineOptions,
}

impl FilterEngineBuilder {
    pub fn new(registry: FieldRegistry) -> Self {
        Self {
            registry,
            functions: FunctionRegistry::with_builtins(),
            macros: MacroTable::default(),
            options: EngineOptions::default(),
        }
    }

    pub fn function<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: FilterFunction + 'static,
    {
        self.functions.register(name, func);
        self
    }

    /// Replaces the whole function registry, built-ins included.
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn macros(mut self, table: MacroTable) -> Self {
        self.macros = table;
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn optimize(mut self, optimize: bool) -> Self {
        self.options.optimize = optimize;
        self
    }

    pub fn build(self) -> FilterEngine {
        FilterEngine {
            registry: Arc::new(self.registry),
            functions: Arc::new(self.functions),
            macros: MacroStore::new(MacroContext::new(self.macros)),
            options: self.options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftypes::{FValue, FieldType};
    use crate::functions::FunctionParam;
    use crate::macros::{MacroError, MacroRecord};
    use crate::registry::FieldRegistryBuilder;
    use crate::tree::ProtoTree;

    fn registry() -> FieldRegistry {
        FieldRegistryBuilder::new()
            .field("ip.addr", FieldType::Ipv4)
            .field("tcp.port", FieldType::UInt16)
            .build()
    }

    fn macros() -> MacroTable {
        MacroTable::new(vec![MacroRecord::new("local", "ip.addr == 10.0.0.$1")]).unwrap()
    }

    #[test]
    fn test_options_defaults_and_serde() {
        let options = EngineOptions::default();
        assert!(options.optimize && options.warn_deprecated && options.warn_parentheses);
        let partial: EngineOptions = serde_json::from_str(r#"{"optimize": false}"#).unwrap();
        assert_eq!(
            partial,
            EngineOptions {
                optimize: false,
                ..EngineOptions::default()
            }
        );
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(serde_json::from_str::<EngineOptions>(&json).unwrap(), options);
    }

    #[test]
    fn test_compile_with_macros() {
        let engine = FilterEngine::builder(registry()).macros(macros()).build();
        let filter = engine.compile("${local:5}").unwrap();
        assert_eq!(filter.expanded_text(), "ip.addr == 10.0.0.5");
        assert_eq!(filter.text(), "${local:5}");
        let mut tree = ProtoTree::new();
        tree.add_parsed(engine.registry(), "ip.addr", "10.0.0.5").unwrap();
        assert!(filter.evaluate(&tree));
    }

    #[test]
    fn test_macro_table_swap() {
        let engine = FilterEngine::new(registry());
        assert_eq!(
            engine.compile("${local:5}").unwrap_err(),
            DfilterError::Macro(MacroError::Unknown("local".into()))
        );
        engine.set_macros(macros());
        assert!(engine.compile("${local:5}").is_ok());
        assert_eq!(engine.macros().snapshot().table().len(), 1);
    }

    #[test]
    fn test_error_kinds() {
        let engine = FilterEngine::new(registry());
        match engine.compile("tcp.port ==").unwrap_err() {
            DfilterError::Syntax {
                capture_filter_hint,
                ..
            } => assert!(!capture_filter_hint),
            other => panic!("Expected syntax error, got {:?}", other),
        }
        let err = engine.compile("host 10.0.0.1").unwrap_err();
        assert!(err.to_string().starts_with("unable to parse filter string"));
        assert!(err.hint().is_some());
        match engine.compile("tcp.port == foo").unwrap_err() {
            DfilterError::Type(e) => assert_eq!(e.to_string(), "\"foo\" is not a valid number."),
            other => panic!("Expected type error, got {:?}", other),
        }
    }

    #[test]
    fn test_optimize_option() {
        let text = "tcp.port == 1 || tcp.port == 2";
        let optimized = FilterEngine::new(registry()).compile(text).unwrap();
        let plain = FilterEngine::builder(registry())
            .optimize(false)
            .build()
            .compile(text)
            .unwrap();
        assert_ne!(optimized.dump(), plain.dump());
        let mut tree = ProtoTree::new();
        tree.add(&registry(), "tcp.port", FValue::Unsigned(FieldType::UInt16, 2)).unwrap();
        assert!(optimized.evaluate(&tree));
        assert!(plain.evaluate(&tree));
    }

    struct Double;

    impl FilterFunction for Double {
        fn min_args(&self) -> usize {
            1
        }

        fn max_args(&self) -> usize {
            1
        }

        fn check(&self, params: &[FunctionParam]) -> Result<FieldType, String> {
            if params[0].ftype.is_unsigned() {
                Ok(FieldType::UInt64)
            } else {
                Err("double() takes an unsigned integer".to_string())
            }
        }

        fn call(&self, args: &[&[FValue]]) -> Option<Vec<FValue>> {
            let values: Vec<FValue> = args
                .first()?
                .iter()
                .filter_map(|v| match v {
                    FValue::Unsigned(_, n) => Some(FValue::Unsigned(FieldType::UInt64, n * 2)),
                    _ => None,
                })
                .collect();
            (!values.is_empty()).then_some(values)
        }
    }

    #[test]
    fn test_user_function() {
        let engine = FilterEngine::builder(registry()).function("double", Double).build();
        let filter = engine.compile("double(tcp.port) == 160").unwrap();
        let mut tree = ProtoTree::new();
        tree.add(engine.registry(), "tcp.port", FValue::Unsigned(FieldType::UInt16, 80))
            .unwrap();
        assert!(filter.evaluate(&tree));
        assert!(!filter.evaluate(&ProtoTree::new()));
        assert!(engine.compile("double(ip.addr) == 1").is_err());
    }

    #[test]
    fn test_parse_only() {
        let engine = FilterEngine::builder(registry()).macros(macros()).build();
        let tree = engine.parse("${local:7}").unwrap();
        assert_eq!(tree.to_string(), "ip.addr == 10.0.0.7");
    }
}
