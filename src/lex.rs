//! Lexer module: splits expanded filter text into tokens.
//!
//! Bare words, numbers, addresses and byte strings all come out as a single
//! `Unparsed` token. Their meaning depends on what they are compared with,
//! so interpretation is left to the semantic checker.

use crate::syntax_tree::{Quantifier, RelOp};
use std::fmt;
use thiserror::Error;

/// A syntax error at a byte offset into the expanded filter text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at offset {offset})")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    At,
    /// A relational operator, with the quantifier its spelling implies.
    Relation(RelOp, Option<Quantifier>),
    In,
    And,
    Or,
    Not,
    Any,
    All,
    /// Unescaped bytes; `\xHH` and octal escapes may yield non-UTF-8 data.
    Str(Vec<u8>),
    Unparsed(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::LBracket => f.write_str("["),
            Token::RBracket => f.write_str("]"),
            Token::LBrace => f.write_str("{"),
            Token::RBrace => f.write_str("}"),
            Token::Comma => f.write_str(","),
            Token::At => f.write_str("@"),
            Token::Relation(op, _) => write!(f, "{}", op),
            Token::In => f.write_str("in"),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Not => f.write_str("!"),
            Token::Any => f.write_str("any"),
            Token::All => f.write_str("all"),
            Token::Str(s) => f.write_str(&quote_bytes(s)),
            Token::Unparsed(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

// Longest spellings first.
const OPERATORS: &[(&str, Token)] = &[
    ("===", Token::Relation(RelOp::Eq, Some(Quantifier::All))),
    ("!==", Token::Relation(RelOp::Ne, Some(Quantifier::All))),
    ("==", Token::Relation(RelOp::Eq, None)),
    ("!=", Token::Relation(RelOp::Ne, None)),
    ("~=", Token::Relation(RelOp::Ne, Some(Quantifier::Any))),
    (">=", Token::Relation(RelOp::Ge, None)),
    ("<=", Token::Relation(RelOp::Le, None)),
    ("&&", Token::And),
    ("||", Token::Or),
    (">", Token::Relation(RelOp::Gt, None)),
    ("<", Token::Relation(RelOp::Lt, None)),
    ("&", Token::Relation(RelOp::BitwiseAnd, None)),
    ("~", Token::Relation(RelOp::Matches, None)),
    ("!", Token::Not),
    ("(", Token::LParen),
    (")", Token::RParen),
    ("[", Token::LBracket),
    ("]", Token::RBracket),
    ("{", Token::LBrace),
    ("}", Token::RBrace),
    (",", Token::Comma),
    ("@", Token::At),
];

fn keyword(word: &str) -> Option<Token> {
    let token = match word {
        "eq" => Token::Relation(RelOp::Eq, None),
        "ne" => Token::Relation(RelOp::Ne, None),
        "all_eq" => Token::Relation(RelOp::Eq, Some(Quantifier::All)),
        "any_eq" => Token::Relation(RelOp::Eq, Some(Quantifier::Any)),
        "all_ne" => Token::Relation(RelOp::Ne, Some(Quantifier::All)),
        "any_ne" => Token::Relation(RelOp::Ne, Some(Quantifier::Any)),
        "gt" => Token::Relation(RelOp::Gt, None),
        "ge" => Token::Relation(RelOp::Ge, None),
        "lt" => Token::Relation(RelOp::Lt, None),
        "le" => Token::Relation(RelOp::Le, None),
        "bitwise_and" => Token::Relation(RelOp::BitwiseAnd, None),
        "contains" => Token::Relation(RelOp::Contains, None),
        "matches" => Token::Relation(RelOp::Matches, None),
        "in" => Token::In,
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "any" => Token::Any,
        "all" => Token::All,
        _ => return None,
    };
    Some(token)
}

fn is_unparsed_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | ':' | '-' | '/' | '+')
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>, ParseError> {
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < input.len() {
        let rest = &input[pos..];
        let Some(c) = rest.chars().next() else { break };
        if c.is_whitespace() {
            pos += c.len_utf8();
            continue;
        }
        if c == '"' {
            let (s, len) = lex_string(input, pos)?;
            tokens.push(Spanned {
                token: Token::Str(s),
                offset: pos,
            });
            pos += len;
            continue;
        }
        if is_unparsed_char(c) {
            let len = rest
                .char_indices()
                .find(|(_, c)| !is_unparsed_char(*c))
                .map_or(rest.len(), |(i, _)| i);
            let word = &rest[..len];
            let token = keyword(word).unwrap_or_else(|| Token::Unparsed(word.to_string()));
            tokens.push(Spanned { token, offset: pos });
            pos += len;
            continue;
        }
        match OPERATORS.iter().find(|(op, _)| rest.starts_with(op)) {
            Some((op, token)) => {
                tokens.push(Spanned {
                    token: token.clone(),
                    offset: pos,
                });
                pos += op.len();
            }
            None => return Err(ParseError::new(pos, format!("unexpected character '{}'", c))),
        }
    }
    Ok(tokens)
}

/// Lexes a double-quoted string starting at `start`; returns the unescaped
/// bytes and the number of input bytes consumed.
fn lex_string(input: &str, start: usize) -> Result<(Vec<u8>, usize), ParseError> {
    let body = &input[start + 1..];
    let mut out = Vec::new();
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, i + 2)),
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| ParseError::new(start, "unterminated string"))?;
                match escaped {
                    'n' => out.push(b'\n'),
                    't' => out.push(b'\t'),
                    'r' => out.push(b'\r'),
                    'a' => out.push(0x07),
                    'b' => out.push(0x08),
                    'f' => out.push(0x0c),
                    'v' => out.push(0x0b),
                    'x' => {
                        let mut value = 0u32;
                        let mut digits = 0;
                        while digits < 2 {
                            match chars.peek().and_then(|(_, c)| c.to_digit(16)) {
                                Some(d) => {
                                    value = value * 16 + d;
                                    digits += 1;
                                    chars.next();
                                }
                                None => break,
                            }
                        }
                        if digits == 0 {
                            return Err(ParseError::new(
                                start + 1 + i,
                                "\\x escape requires at least one hex digit",
                            ));
                        }
                        out.push(value as u8);
                    }
                    '0'..='7' => {
                        let mut value = escaped.to_digit(8).unwrap_or(0);
                        for _ in 0..2 {
                            match chars.peek().and_then(|(_, c)| c.to_digit(8)) {
                                Some(d) => {
                                    value = value * 8 + d;
                                    chars.next();
                                }
                                None => break,
                            }
                        }
                        if value > 0xff {
                            return Err(ParseError::new(
                                start + 1 + i,
                                "octal escape out of range",
                            ));
                        }
                        out.push(value as u8);
                    }
                    '"' | '\\' | '\'' => push_char(&mut out, escaped),
                    // Unknown escapes are kept, so regex escapes like `\.` survive.
                    other => {
                        out.push(b'\\');
                        push_char(&mut out, other);
                    }
                }
            }
            c => push_char(&mut out, c),
        }
    }
    Err(ParseError::new(start, "unterminated string"))
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

/// Renders string literal bytes in filter syntax. Bytes that do not form
/// UTF-8 text are written as `\xHH` escapes.
pub fn quote_bytes(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return format!("{:?}", text);
    }
    let mut out = String::from("\"");
    for &b in bytes {
        match b {
            b'"' | b'\\' => {
                out.push('\\');
                out.push(char::from(b));
            }
            0x20..=0x7e => out.push(char::from(b)),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('"');
    out
}
