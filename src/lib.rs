//! Dfilter: a display-filter engine for dissected packet trees.
//!
//! Filter text such as `ip.addr == 10.0.0.5 && tcp.port in {80 443}` goes
//! through a small compiler pipeline and ends up as bytecode evaluated once
//! per packet.
//!
//! # Architecture
//! - Macro expansion of `${name:args}` references (macros)
//! - Tokenizing and parsing into a syntax tree (lex, grammar, syntax_tree)
//! - Semantic checking with implicit conversions (semcheck)
//! - Code generation and peephole optimization (compiler, ir)
//! - Register VM execution against a field tree (vm, tree, filter)
//! - A front door tying the stages together (engine)

mod compiler;
mod drange;
mod engine;
mod filter;
mod ftypes;
mod functions;
mod grammar;
mod ir;
mod lex;
mod macros;
mod registry;
mod semcheck;
mod syntax_tree;
mod tree;
mod vm;

pub use compiler::*;
pub use drange::*;
pub use engine::*;
pub use filter::*;
pub use ftypes::*;
pub use functions::*;
pub use grammar::*;
pub use ir::*;
pub use lex::*;
pub use macros::*;
pub use registry::*;
pub use semcheck::*;
pub use syntax_tree::*;
pub use tree::*;
pub use vm::*;

use thiserror::Error;

/// Unified error type for dfilter operations.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum DfilterError {
    #[error("{0}")]
    Macro(#[from] MacroError),

    #[error("unable to parse filter string: {error}")]
    Syntax {
        error: ParseError,
        /// The text reads like a capture filter rather than a display filter.
        capture_filter_hint: bool,
    },

    #[error("{0}")]
    Type(#[from] TypeError),

    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("field {field} holds {expected} values, got {actual}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        actual: FieldType,
    },

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl DfilterError {
    pub(crate) fn syntax(error: ParseError, text: &str) -> Self {
        DfilterError::Syntax {
            error,
            capture_filter_hint: looks_like_capture_filter(text),
        }
    }

    /// Secondary guidance to show next to the error message, if any.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            DfilterError::Syntax {
                capture_filter_hint: true,
                ..
            } => Some(
                "The filter looks like a valid capture filter (such as \"host 10.0.0.1\"). \
                 Capture and display filters use different syntax.",
            ),
            _ => None,
        }
    }
}

const CAPTURE_FILTER_KEYWORDS: &[&str] = &[
    "host",
    "net",
    "port",
    "portrange",
    "src",
    "dst",
    "ether",
    "gateway",
    "broadcast",
    "multicast",
    "less",
    "greater",
    "vlan",
];

/// Rough check for capture-filter (BPF) syntax, used only to enrich a syntax
/// error message.
pub fn looks_like_capture_filter(text: &str) -> bool {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c| c == '(' || c == ')'))
        .any(|w| CAPTURE_FILTER_KEYWORDS.contains(&w.to_ascii_lowercase().as_str()))
}
