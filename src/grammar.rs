//! Grammar module: recursive-descent parser from tokens to a syntax tree.
//!
//! Precedence, loosest first: `||`, `&&`, `!`, then a single test (a
//! relation, a set membership, or a bare entity meaning "is present").
//! Words naming a registered field become field references; every other
//! bare word stays unparsed for the semantic checker to interpret.

use crate::drange::{DRange, DRangeNode};
use crate::functions::FunctionRegistry;
use crate::lex::{tokenize, ParseError, Spanned, Token};
use crate::registry::FieldRegistry;
use crate::syntax_tree::{FieldRef, FunctionCall, Quantifier, SetElement, StNode, TestNode, TestOp};

/// Deepest syntax tree the parser builds. Parentheses, negations, function
/// calls, slices and chained `&&`/`||` operands each add a level.
pub const MAX_DEPTH: usize = 128;

pub struct FilterParser<'a> {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
    depth: usize,
    registry: &'a FieldRegistry,
    functions: &'a FunctionRegistry,
}

impl<'a> FilterParser<'a> {
    pub fn new(
        input: &str,
        registry: &'a FieldRegistry,
        functions: &'a FunctionRegistry,
    ) -> Result<Self, ParseError> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
            end: input.len(),
            depth: 0,
            registry,
            functions,
        })
    }

    pub fn parse(
        input: &str,
        registry: &FieldRegistry,
        functions: &FunctionRegistry,
    ) -> Result<StNode, ParseError> {
        let mut parser = FilterParser::new(input, registry, functions)?;
        if parser.tokens.is_empty() {
            return Err(ParseError::new(0, "empty filter"));
        }
        let expr = parser.parse_expr()?;
        if let Some(next) = parser.tokens.get(parser.pos) {
            return Err(ParseError::new(
                next.offset,
                format!("unexpected \"{}\"", next.token),
            ));
        }
        Ok(expr)
    }

    fn parse_expr(&mut self) -> Result<StNode, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<StNode, ParseError> {
        let mut left = self.parse_and()?;
        let outer = self.depth;
        while self.consume(&Token::Or) {
            self.descend()?;
            let right = self.parse_and()?;
            left = StNode::Test(TestNode::binary(TestOp::Or, left, right));
        }
        self.depth = outer;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<StNode, ParseError> {
        let mut left = self.parse_not()?;
        let outer = self.depth;
        while self.consume(&Token::And) {
            self.descend()?;
            let right = self.parse_not()?;
            left = StNode::Test(TestNode::binary(TestOp::And, left, right));
        }
        self.depth = outer;
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<StNode, ParseError> {
        if self.consume(&Token::Not) {
            self.descend()?;
            let expr = self.parse_not()?;
            self.depth -= 1;
            Ok(StNode::Test(TestNode::unary(TestOp::Not, expr)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<StNode, ParseError> {
        if self.consume(&Token::LParen) {
            self.descend()?;
            let mut inner = self.parse_expr()?;
            self.expect(&Token::RParen)?;
            self.depth -= 1;
            if let StNode::Test(test) = &mut inner {
                test.parenthesized = true;
            }
            return Ok(inner);
        }

        let prefix = if self.consume(&Token::Any) {
            Some(Quantifier::Any)
        } else if self.consume(&Token::All) {
            Some(Quantifier::All)
        } else {
            None
        };

        let left = self.parse_entity()?;

        if let Some(Token::Relation(op, implied)) = self.peek().cloned() {
            self.pos += 1;
            let quantifier = match (prefix, implied) {
                (Some(a), Some(b)) if a != b => {
                    return Err(self.error_here("conflicting \"any\"/\"all\" quantifiers"));
                }
                (Some(q), _) | (None, Some(q)) => q,
                (None, None) => Quantifier::Default,
            };
            let right = self.parse_entity()?;
            let mut test = TestNode::binary(TestOp::Relation(op), left, right);
            test.quantifier = quantifier;
            return Ok(StNode::Test(test));
        }

        let negated = matches!(
            (self.peek(), self.tokens.get(self.pos + 1).map(|t| &t.token)),
            (Some(Token::Not), Some(Token::In))
        );
        if negated {
            self.pos += 1;
        }
        if self.consume(&Token::In) {
            let set = self.parse_set()?;
            let mut test = TestNode::binary(TestOp::In, left, set);
            test.quantifier = prefix.unwrap_or_default();
            let membership = StNode::Test(test);
            return Ok(if negated {
                StNode::Test(TestNode::unary(TestOp::Not, membership))
            } else {
                membership
            });
        }

        if prefix.is_some() {
            return Err(self.error_here("a quantifier must be followed by a comparison"));
        }
        Ok(StNode::Test(TestNode::unary(TestOp::Exists, left)))
    }

    /// A field, literal, function call or slice of one of those.
    fn parse_entity(&mut self) -> Result<StNode, ParseError> {
        let offset = self.offset();
        let token = self
            .next_token()
            .ok_or_else(|| ParseError::new(offset, "unexpected end of filter"))?;
        let mut entity = match token {
            Token::Str(s) => StNode::String(s),
            Token::At => match self.next_token() {
                Some(Token::Unparsed(name)) => match self.registry.lookup(&name) {
                    Some(info) => StNode::Field(FieldRef::new(info, true)),
                    None => {
                        return Err(ParseError::new(
                            offset,
                            format!("\"{}\" is not a valid protocol or protocol field", name),
                        ))
                    }
                },
                _ => return Err(ParseError::new(offset, "expected a field name after '@'")),
            },
            Token::Unparsed(word) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                self.parse_function(word, offset)?
            }
            Token::Unparsed(word) => match self.registry.lookup(&word) {
                Some(info) => StNode::Field(FieldRef::new(info, false)),
                None => StNode::Unparsed(word),
            },
            other => {
                return Err(ParseError::new(offset, format!("unexpected \"{}\"", other)));
            }
        };

        let outer = self.depth;
        while self.consume(&Token::LBracket) {
            self.descend()?;
            let drange = self.parse_range()?;
            entity = StNode::range(entity, drange);
        }
        self.depth = outer;
        Ok(entity)
    }

    fn parse_function(&mut self, name: String, offset: usize) -> Result<StNode, ParseError> {
        let func = self
            .functions
            .get(&name)
            .ok_or_else(|| ParseError::new(offset, format!("The function '{}' does not exist", name)))?;
        let mut params = Vec::new();
        self.descend()?;
        if !self.consume(&Token::RParen) {
            loop {
                params.push(self.parse_entity()?);
                if self.consume(&Token::Comma) {
                    continue;
                }
                self.expect(&Token::RParen)?;
                break;
            }
        }
        self.depth -= 1;
        Ok(StNode::Function(FunctionCall { func, params }))
    }

    fn parse_range(&mut self) -> Result<DRange, ParseError> {
        let mut nodes = Vec::new();
        loop {
            let offset = self.offset();
            match self.next_token() {
                Some(Token::Unparsed(spec)) => nodes.push(
                    parse_drange_node(&spec).map_err(|message| ParseError::new(offset, message))?,
                ),
                _ => return Err(ParseError::new(offset, "expected a byte range")),
            }
            if self.consume(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RBracket)?;
            return Ok(DRange::new(nodes));
        }
    }

    fn parse_set(&mut self) -> Result<StNode, ParseError> {
        self.expect(&Token::LBrace)?;
        let mut elements = Vec::new();
        loop {
            if self.consume(&Token::RBrace) {
                break;
            }
            if !elements.is_empty() {
                self.consume(&Token::Comma);
            }
            let element = match self.peek().cloned() {
                Some(Token::Unparsed(word)) if word.contains("..") && word != ".." => {
                    let offset = self.offset();
                    self.pos += 1;
                    match word.split_once("..") {
                        Some((low, high)) if !low.is_empty() && !high.is_empty() => {
                            SetElement::Range(self.word_node(low), self.word_node(high))
                        }
                        _ => return Err(ParseError::new(offset, format!("invalid range \"{}\"", word))),
                    }
                }
                Some(_) => {
                    let low = self.parse_entity()?;
                    if self.peek() == Some(&Token::Unparsed("..".to_string())) {
                        self.pos += 1;
                        let high = self.parse_entity()?;
                        SetElement::Range(low, high)
                    } else {
                        SetElement::Single(low)
                    }
                }
                None => return Err(self.error_here("unterminated set, expected '}'")),
            };
            elements.push(element);
        }
        if elements.is_empty() {
            return Err(self.error_here("a set cannot be empty"));
        }
        Ok(StNode::Set(elements))
    }

    fn word_node(&self, word: &str) -> StNode {
        match self.registry.lookup(word) {
            Some(info) => StNode::Field(FieldRef::new(info, false)),
            None => StNode::Unparsed(word.to_string()),
        }
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error_here(&format!(
                "filter is nested too deeply (more than {} levels)",
                MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn expect(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.consume(token) {
            Ok(())
        } else {
            Err(self.error_here(&format!("expected '{}'", token)))
        }
    }

    fn consume(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|t| t.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |t| t.offset)
    }

    fn error_here(&self, message: &str) -> ParseError {
        ParseError::new(self.offset(), message)
    }
}

fn parse_offset(s: &str, spec: &str) -> Result<i64, String> {
    s.parse::<i64>()
        .map_err(|_| format!("\"{}\" is not a valid byte range", spec))
}

/// One range specifier: `i:j`, `i-j`, `i`, `i:` or `:j`.
pub fn parse_drange_node(spec: &str) -> Result<DRangeNode, String> {
    if let Some((start, length)) = spec.split_once(':') {
        let start = if start.is_empty() { 0 } else { parse_offset(start, spec)? };
        if length.is_empty() {
            return Ok(DRangeNode::to_the_end(start));
        }
        return Ok(DRangeNode::length(start, parse_offset(length, spec)?));
    }
    // A leading '-' is the sign of the start offset, not the separator.
    let sep = spec
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '-')
        .map(|(i, _)| i);
    match sep {
        Some(i) => Ok(DRangeNode::offset(
            parse_offset(&spec[..i], spec)?,
            parse_offset(&spec[i + 1..], spec)?,
        )),
        None => Ok(DRangeNode::length(parse_offset(spec, spec)?, 1)),
    }
}
