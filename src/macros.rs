//! Macros module: textual expansion of `${name:arg;arg}` references, performed
//! before the filter text is tokenized.
//!
//! A reference resolves against the macro table first and then against a
//! cache of field values captured from a previously dissected packet, so that
//! `${tcp.port}` can mean "the port of the selected packet".

use crate::ftypes::StringRepr;
use crate::registry::FieldRegistry;
use crate::tree::ProtoTree;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

/// Expansion passes allowed before giving up on a self-referencing macro.
pub const MAX_NESTING: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacroError {
    #[error("macro '{0}' does not exist")]
    Unknown(String),

    #[error("macro '{0}' is unusable")]
    Unusable(String),

    #[error("wrong number {given} of arguments for macro {name}, expecting {expected} instead")]
    ArgumentCount {
        name: String,
        given: usize,
        expected: usize,
    },

    #[error("end of filter in the middle of a macro expression")]
    Unterminated,

    #[error("invalid character in macro name")]
    InvalidNameCharacter,

    #[error("too much nesting in macros")]
    TooMuchNesting,

    #[error("macro name cannot be empty")]
    EmptyName,

    #[error("invalid macro name {0:?}: only letters, digits and underscore are allowed")]
    InvalidName(String),

    #[error("macro '{0}' already exists")]
    DuplicateName(String),

    #[error("macro table line {line}: {reason}")]
    TableSyntax { line: usize, reason: String },
}

/// One user-editable row of the macro table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroRecord {
    pub name: String,
    pub text: String,
}

impl MacroRecord {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// A macro with its template pre-split at the `$N` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macro {
    name: String,
    text: String,
    parts: Vec<String>,
    args_pos: Vec<usize>,
    argc: usize,
    usable: bool,
}

impl Macro {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let name = name.into();
        let text = text.into();
        let mut parts = vec![String::new()];
        let mut args_pos = Vec::new();
        let mut argc = 0;
        let mut usable = true;

        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        push_char(&mut parts, escaped);
                    }
                }
                '$' => {
                    let mut digits = String::new();
                    while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                        digits.push(*d);
                        chars.next();
                    }
                    match digits.parse::<usize>() {
                        Ok(0) => {
                            usable = false;
                            push_str(&mut parts, '$', &digits);
                        }
                        Ok(pos) => {
                            argc = argc.max(pos);
                            args_pos.push(pos - 1);
                            parts.push(String::new());
                        }
                        Err(_) if digits.is_empty() => push_char(&mut parts, '$'),
                        Err(_) => {
                            usable = false;
                            push_str(&mut parts, '$', &digits);
                        }
                    }
                }
                c => push_char(&mut parts, c),
            }
        }

        Self {
            name,
            text,
            parts,
            args_pos,
            argc,
            usable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn argc(&self) -> usize {
        self.argc
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    fn render(&self, args: &[String]) -> Result<String, MacroError> {
        if args.len() != self.argc {
            return Err(MacroError::ArgumentCount {
                name: self.name.clone(),
                given: args.len(),
                expected: self.argc,
            });
        }
        let mut out = self.parts[0].clone();
        for (pos, part) in self.args_pos.iter().zip(&self.parts[1..]) {
            out.push_str(&args[*pos]);
            out.push_str(part);
        }
        Ok(out)
    }
}

fn push_char(parts: &mut [String], c: char) {
    if let Some(part) = parts.last_mut() {
        part.push(c);
    }
}

fn push_str(parts: &mut [String], c: char, rest: &str) {
    if let Some(part) = parts.last_mut() {
        part.push(c);
        part.push_str(rest);
    }
}

/// Rejects names that are empty or contain anything but letters, digits and
/// underscore.
pub fn validate_macro_name(name: &str) -> Result<(), MacroError> {
    if name.is_empty() {
        return Err(MacroError::EmptyName);
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MacroError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// An immutable macro table. Edits produce a new table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroTable {
    macros: Vec<Macro>,
}

impl MacroTable {
    pub fn new<I>(records: I) -> Result<Self, MacroError>
    where
        I: IntoIterator<Item = MacroRecord>,
    {
        let mut macros: Vec<Macro> = Vec::new();
        for record in records {
            validate_macro_name(&record.name)?;
            if macros.iter().any(|m| m.name == record.name) {
                return Err(MacroError::DuplicateName(record.name));
            }
            macros.push(Macro::new(record.name, record.text));
        }
        Ok(Self { macros })
    }

    pub fn get(&self, name: &str) -> Option<&Macro> {
        self.macros.iter().find(|m| m.name == name)
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    pub fn records(&self) -> Vec<MacroRecord> {
        self.macros
            .iter()
            .map(|m| MacroRecord::new(m.name.clone(), m.text.clone()))
            .collect()
    }

    /// A new table with `record` added, or replacing the macro of the same name.
    pub fn with_macro(&self, record: MacroRecord) -> Result<Self, MacroError> {
        let mut records = self.records();
        match records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Self::new(records)
    }

    pub fn without_macro(&self, name: &str) -> Self {
        Self {
            macros: self
                .macros
                .iter()
                .filter(|m| m.name != name)
                .cloned()
                .collect(),
        }
    }

    /// Parses the macro table file: one `"name","text"` record per line,
    /// `#` comments, `\xHH` escapes inside the quotes.
    pub fn parse_file(contents: &str) -> Result<Self, MacroError> {
        let mut records = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let syntax = |reason: &str| MacroError::TableSyntax {
                line: index + 1,
                reason: reason.to_string(),
            };
            let (name, rest) = take_quoted(line).map_err(|r| syntax(r))?;
            let rest = rest
                .trim_start()
                .strip_prefix(',')
                .ok_or_else(|| syntax("expected ',' between fields"))?;
            let (text, rest) = take_quoted(rest.trim_start()).map_err(|r| syntax(r))?;
            if !rest.trim().is_empty() {
                return Err(syntax("unexpected data after the last field"));
            }
            records.push(MacroRecord { name, text });
        }
        Self::new(records)
    }

    pub fn to_file_string(&self) -> String {
        let mut out = String::new();
        for m in &self.macros {
            let _ = writeln!(out, "{},{}", escape_quoted(&m.name), escape_quoted(&m.text));
        }
        out
    }
}

fn take_quoted(input: &str) -> Result<(String, &str), &'static str> {
    let body = input.strip_prefix('"').ok_or("expected '\"'")?;
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &body[i + 1..])),
            '\\' => match chars.next() {
                Some((_, 'x')) => {
                    let hi = chars.next().and_then(|(_, c)| c.to_digit(16));
                    let lo = chars.next().and_then(|(_, c)| c.to_digit(16));
                    match (hi, lo) {
                        (Some(hi), Some(lo)) => out.push(char::from((hi * 16 + lo) as u8)),
                        _ => return Err("invalid \\x escape"),
                    }
                }
                Some((_, escaped)) => out.push(escaped),
                None => return Err("unterminated escape"),
            },
            c => out.push(c),
        }
    }
    Err("missing closing '\"'")
}

fn escape_quoted(s: &str) -> String {
    let mut out = String::from("\"");
    for c in s.chars() {
        if c == '"' || c == '\\' || c.is_ascii_control() {
            let _ = write!(out, "\\x{:02x}", c as u32);
        } else {
            out.push(c);
        }
    }
    out.push('"');
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedValue {
    repr: Option<String>,
    usable: bool,
}

/// Filter-syntax representations of the fields of one dissected packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValueCache {
    entries: HashMap<String, CachedValue>,
}

impl FieldValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a field's value; a second occurrence of the same name makes
    /// the entry ambiguous and therefore unusable.
    pub fn insert(&mut self, name: impl Into<String>, repr: Option<String>) {
        self.entries
            .entry(name.into())
            .and_modify(|e| e.usable = false)
            .or_insert_with(|| CachedValue {
                usable: repr.is_some(),
                repr,
            });
    }

    pub fn capture(tree: &ProtoTree, registry: &FieldRegistry) -> Self {
        let mut cache = Self::new();
        for (id, values) in tree.iter() {
            if let Some(info) = registry.get(id) {
                for value in values {
                    cache.insert(info.abbrev.clone(), value.to_string_repr(StringRepr::Filter));
                }
            }
        }
        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn resolve(&self, name: &str) -> Option<Result<&str, MacroError>> {
        self.entries.get(name).map(|e| match (&e.repr, e.usable) {
            (Some(repr), true) => Ok(repr.as_str()),
            _ => Err(MacroError::Unusable(name.to_string())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Outside,
    Starting,
    Name,
    Args,
}

/// Everything an expansion reads: the macro table and the optional field
/// value cache. Never mutated once built.
#[derive(Debug, Clone, Default)]
pub struct MacroContext {
    table: Arc<MacroTable>,
    field_values: Option<Arc<FieldValueCache>>,
}

impl MacroContext {
    pub fn new(table: MacroTable) -> Self {
        Self {
            table: Arc::new(table),
            field_values: None,
        }
    }

    pub fn with_field_values(mut self, cache: FieldValueCache) -> Self {
        self.field_values = Some(Arc::new(cache));
        self
    }

    pub fn table(&self) -> &MacroTable {
        &self.table
    }

    /// Expands every macro reference in `text`, re-scanning the result until
    /// no substitution happens. Any failure aborts the whole expansion.
    pub fn expand(&self, text: &str) -> Result<String, MacroError> {
        let mut current = text.to_string();
        // Up to MAX_NESTING substituting passes, plus one that finds nothing
        // left to expand.
        for passes in 0..=MAX_NESTING {
            let (expanded, changed) = self.expand_once(&current)?;
            if !changed {
                if passes > 0 {
                    debug!(passes, expanded = %expanded, "expanded macros");
                }
                return Ok(expanded);
            }
            current = expanded;
        }
        Err(MacroError::TooMuchNesting)
    }

    fn expand_once(&self, text: &str) -> Result<(String, bool), MacroError> {
        let mut out = String::with_capacity(text.len());
        let mut state = ScanState::Outside;
        let mut name = String::new();
        let mut arg = String::new();
        let mut args: Vec<String> = Vec::new();
        let mut changed = false;

        let mut chars = text.chars();
        loop {
            let c = chars.next();
            match state {
                ScanState::Outside => match c {
                    None => break,
                    Some('$') => state = ScanState::Starting,
                    Some(c) => out.push(c),
                },
                ScanState::Starting => match c {
                    Some('{') => {
                        name.clear();
                        arg.clear();
                        args.clear();
                        state = ScanState::Name;
                    }
                    None => {
                        out.push('$');
                        break;
                    }
                    Some(c) => {
                        out.push('$');
                        out.push(c);
                        state = ScanState::Outside;
                    }
                },
                ScanState::Name => match c {
                    Some(c) if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') => {
                        name.push(c)
                    }
                    Some(':') => state = ScanState::Args,
                    Some('}') => {
                        out.push_str(&self.resolve(&name, &[])?);
                        changed = true;
                        state = ScanState::Outside;
                    }
                    None => return Err(MacroError::Unterminated),
                    Some(_) => return Err(MacroError::InvalidNameCharacter),
                },
                ScanState::Args => match c {
                    None => return Err(MacroError::Unterminated),
                    Some(';') => args.push(std::mem::take(&mut arg)),
                    Some('\\') => match chars.next() {
                        Some(escaped) => arg.push(escaped),
                        None => return Err(MacroError::Unterminated),
                    },
                    Some('}') => {
                        args.push(std::mem::take(&mut arg));
                        out.push_str(&self.resolve(&name, &args)?);
                        changed = true;
                        state = ScanState::Outside;
                    }
                    Some(c) => arg.push(c),
                },
            }
        }
        Ok((out, changed))
    }

    fn resolve(&self, name: &str, args: &[String]) -> Result<String, MacroError> {
        if let Some(m) = self.table.get(name).filter(|m| m.is_usable()) {
            return m.render(args);
        }
        match self.field_values.as_ref().and_then(|cache| cache.resolve(name)) {
            Some(Ok(repr)) => Ok(repr.to_string()),
            Some(Err(e)) => Err(e),
            None => Err(MacroError::Unknown(name.to_string())),
        }
    }
}

/// Shared holder of the current macro context. Replacing the table swaps the
/// whole context, so an expansion never observes a half-built table.
#[derive(Debug, Default)]
pub struct MacroStore {
    current: RwLock<Arc<MacroContext>>,
}

impl MacroStore {
    pub fn new(context: MacroContext) -> Self {
        Self {
            current: RwLock::new(Arc::new(context)),
        }
    }

    pub fn snapshot(&self) -> Arc<MacroContext> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace_table(&self, table: MacroTable) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = MacroContext::clone(&guard);
        next.table = Arc::new(table);
        *guard = Arc::new(next);
        debug!(macros = guard.table.len(), "macro table replaced");
    }

    pub fn replace_field_values(&self, cache: Option<FieldValueCache>) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = MacroContext::clone(&guard);
        next.field_values = cache.map(Arc::new);
        *guard = Arc::new(next);
    }

    pub fn expand(&self, text: &str) -> Result<String, MacroError> {
        self.snapshot().expand(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftypes::{FValue, FieldType};
    use crate::registry::FieldRegistryBuilder;
    use serde_json;

    fn context(records: &[(&str, &str)]) -> MacroContext {
        let table = MacroTable::new(records.iter().map(|(n, t)| MacroRecord::new(*n, *t))).unwrap();
        MacroContext::new(table)
    }

    #[test]
    fn test_expand_with_argument() {
        let ctx = context(&[("local", "ip.addr == 10.0.0.$1")]);
        assert_eq!(ctx.expand("${local:5}").unwrap(), "ip.addr == 10.0.0.5");
    }

    #[test]
    fn test_expand_interleaves_repeated_and_reordered_arguments() {
        let ctx = context(&[("pair", "$2 == $1 || $1 == $2")]);
        assert_eq!(ctx.expand("${pair:a;b}").unwrap(), "b == a || a == b");
        assert_eq!(ctx.table().get("pair").unwrap().argc(), 2);
    }

    #[test]
    fn test_argument_escapes() {
        let ctx = context(&[("str", "http.host == \"$1\"")]);
        assert_eq!(ctx.expand("${str:a\\;b\\}c}").unwrap(), "http.host == \"a;b}c\"");
    }

    #[test]
    fn test_text_without_macros_is_unchanged() {
        let ctx = context(&[("x", "y")]);
        for text in ["", "tcp.port == 80", "a $ b", "cost$", "$$", "$x"] {
            assert_eq!(ctx.expand(text).unwrap(), text);
        }
    }

    #[test]
    fn test_recursive_expansion() {
        let ctx = context(&[("web", "${port:80} || ${port:443}"), ("port", "tcp.port == $1")]);
        assert_eq!(ctx.expand("${web}").unwrap(), "tcp.port == 80 || tcp.port == 443");
    }

    #[test]
    fn test_error_kinds() {
        let ctx = context(&[("one", "x == $1")]);
        assert_eq!(ctx.expand("${nope}"), Err(MacroError::Unknown("nope".into())));
        assert_eq!(
            ctx.expand("${one}"),
            Err(MacroError::ArgumentCount {
                name: "one".into(),
                given: 0,
                expected: 1
            })
        );
        assert_eq!(
            ctx.expand("${one:1;2}").unwrap_err().to_string(),
            "wrong number 2 of arguments for macro one, expecting 1 instead"
        );
        assert_eq!(ctx.expand("${one:1"), Err(MacroError::Unterminated));
        assert_eq!(ctx.expand("${one"), Err(MacroError::Unterminated));
        assert_eq!(ctx.expand("${one:1\\"), Err(MacroError::Unterminated));
        assert_eq!(ctx.expand("${on e}"), Err(MacroError::InvalidNameCharacter));
    }

    #[test]
    fn test_nesting_ceiling() {
        let ctx = context(&[("loop", "${loop}")]);
        assert_eq!(ctx.expand("${loop}"), Err(MacroError::TooMuchNesting));
        let ctx = context(&[("a", "${b}"), ("b", "${a}")]);
        assert_eq!(
            ctx.expand("x ${a}").unwrap_err().to_string(),
            "too much nesting in macros"
        );
    }

    #[test]
    fn test_nesting_at_the_ceiling_converges() {
        let chain = |len: usize| {
            let owned: Vec<(String, String)> = (0..len)
                .map(|i| {
                    let text = if i + 1 == len {
                        "tcp.port".to_string()
                    } else {
                        format!("${{m{}}}", i + 1)
                    };
                    (format!("m{}", i), text)
                })
                .collect();
            MacroContext::new(
                MacroTable::new(owned.into_iter().map(|(n, t)| MacroRecord::new(n, t))).unwrap(),
            )
        };
        assert_eq!(chain(MAX_NESTING).expand("${m0}"), Ok("tcp.port".to_string()));
        assert_eq!(chain(MAX_NESTING + 1).expand("${m0}"), Err(MacroError::TooMuchNesting));
    }

    #[test]
    fn test_unusable_template() {
        let ctx = context(&[("zero", "x == $0")]);
        assert!(!ctx.table().get("zero").unwrap().is_usable());
        assert_eq!(ctx.expand("${zero}"), Err(MacroError::Unknown("zero".into())));
    }

    #[test]
    fn test_template_escapes() {
        let m = Macro::new("price", "cost == \\$1 && x == $1");
        assert_eq!(m.argc(), 1);
        assert_eq!(m.render(&["2".into()]).unwrap(), "cost == $1 && x == 2");
    }

    #[test]
    fn test_field_value_cache_fallback() {
        let registry = FieldRegistryBuilder::new()
            .field("tcp.port", FieldType::UInt16)
            .field("ip.addr", FieldType::Ipv4)
            .field("http.host", FieldType::String)
            .build();
        let mut tree = ProtoTree::new();
        tree.add_parsed(&registry, "tcp.port", "80").unwrap();
        tree.add_parsed(&registry, "ip.addr", "10.0.0.1").unwrap();
        tree.add_parsed(&registry, "ip.addr", "10.0.0.2").unwrap();
        tree.add(&registry, "http.host", FValue::String("a\"b".into())).unwrap();
        let cache = FieldValueCache::capture(&tree, &registry);
        assert_eq!(cache.len(), 3);

        let ctx = MacroContext::new(MacroTable::default()).with_field_values(cache);
        assert_eq!(ctx.expand("tcp.port == ${tcp.port}").unwrap(), "tcp.port == 80");
        assert_eq!(ctx.expand("${http.host}").unwrap(), "\"a\\\"b\"");
        assert_eq!(ctx.expand("${ip.addr}"), Err(MacroError::Unusable("ip.addr".into())));
        assert_eq!(
            ctx.expand("${ip.addr}").unwrap_err().to_string(),
            "macro 'ip.addr' is unusable"
        );
    }

    #[test]
    fn test_table_prefers_macros_over_cache() {
        let mut cache = FieldValueCache::new();
        cache.insert("port", Some("22".into()));
        let ctx = context(&[("port", "443")]).with_field_values(cache);
        assert_eq!(ctx.expand("${port}").unwrap(), "443");
    }

    #[test]
    fn test_table_validation() {
        assert_eq!(
            MacroTable::new(vec![MacroRecord::new("", "x")]),
            Err(MacroError::EmptyName)
        );
        assert_eq!(
            MacroTable::new(vec![MacroRecord::new("a.b", "x")]),
            Err(MacroError::InvalidName("a.b".into()))
        );
        assert_eq!(
            MacroTable::new(vec![MacroRecord::new("a", "x"), MacroRecord::new("a", "y")]),
            Err(MacroError::DuplicateName("a".into()))
        );
    }

    #[test]
    fn test_table_edits_build_new_tables() {
        let table = MacroTable::new(vec![MacroRecord::new("a", "1")]).unwrap();
        let edited = table.with_macro(MacroRecord::new("a", "2")).unwrap();
        let grown = edited.with_macro(MacroRecord::new("b", "3")).unwrap();
        assert_eq!(table.get("a").unwrap().text(), "1");
        assert_eq!(edited.get("a").unwrap().text(), "2");
        assert_eq!(grown.len(), 2);
        assert_eq!(grown.without_macro("a").len(), 1);
    }

    #[test]
    fn test_table_file_round_trip() {
        let contents = "# display filter macros\n\"local\",\"ip.addr == 10.0.0.$1\"\n\n\"q\",\"http.host == \\x22x\\x22\"\n";
        let table = MacroTable::parse_file(contents).unwrap();
        assert_eq!(table.get("q").unwrap().text(), "http.host == \"x\"");
        let reparsed = MacroTable::parse_file(&table.to_file_string()).unwrap();
        assert_eq!(reparsed, table);
    }

    #[test]
    fn test_table_file_errors() {
        let err = MacroTable::parse_file("\"a\",\"b\"\n\"c\" \"d\"").unwrap_err();
        assert!(matches!(err, MacroError::TableSyntax { line: 2, .. }));
        assert!(MacroTable::parse_file("\"a\",\"b").is_err());
    }

    #[test]
    fn test_records_serialize_as_json() {
        let records = vec![MacroRecord::new("local", "ip.addr == 10.0.0.$1")];
        let json = serde_json::to_string(&records).unwrap();
        let parsed: Vec<MacroRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(MacroTable::new(parsed).unwrap().records(), records);
    }

    #[test]
    fn test_store_swaps_whole_context() {
        let store = MacroStore::new(context(&[("a", "1")]));
        let before = store.snapshot();
        store.replace_table(MacroTable::new(vec![MacroRecord::new("a", "2")]).unwrap());
        assert_eq!(before.expand("${a}").unwrap(), "1");
        assert_eq!(store.expand("${a}").unwrap(), "2");
        let mut cache = FieldValueCache::new();
        cache.insert("tcp.port", Some("80".into()));
        store.replace_field_values(Some(cache));
        assert_eq!(store.expand("${tcp.port}").unwrap(), "80");
        assert_eq!(store.expand("${a}").unwrap(), "2");
    }
}
