//! Restricted arithmetic formulas.
//!
//! The grammar is identifiers, numeric literals, `+ - * /` and parentheses. Nothing
//! else lexes, so formulas produced by the mapping step can never reach function
//! calls, attribute access or control flow.
//!
//! ```text
//! expression := term (('+' | '-') term)*
//! term       := unary (('*' | '/') unary)*
//! unary      := ('-' | '+') unary | primary
//! primary    := NUMBER | IDENTIFIER | '(' expression ')'
//! ```

use crate::error::{MetricEngineError, Result};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    Token(String),
    BinaryOp {
        op: BinaryOperator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    fn binary(op: BinaryOperator, lhs: Expr, rhs: Expr) -> Self {
        Self::BinaryOp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// `None` on division by zero or a non-finite intermediate.
    fn evaluate(&self, values: &BTreeMap<&str, f64>) -> Option<f64> {
        match self {
            Self::Literal(v) => Some(*v),
            Self::Token(name) => values.get(name.as_str()).copied(),
            Self::BinaryOp { op, lhs, rhs } => {
                let l = lhs.evaluate(values)?;
                let r = rhs.evaluate(values)?;
                let result = match op {
                    BinaryOperator::Add => l + r,
                    BinaryOperator::Subtract => l - r,
                    BinaryOperator::Multiply => l * r,
                    BinaryOperator::Divide => {
                        if r == 0.0 {
                            return None;
                        }
                        l / r
                    }
                };
                result.is_finite().then_some(result)
            }
        }
    }

    fn collect_tokens(&self, out: &mut Vec<String>) {
        match self {
            Self::Literal(_) => {}
            Self::Token(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Self::BinaryOp { lhs, rhs, .. } => {
                lhs.collect_tokens(out);
                rhs.collect_tokens(out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Lexeme {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Eof,
}

impl Lexeme {
    fn describe(&self) -> String {
        match self {
            Self::Number(v) => format!("number {}", v),
            Self::Identifier(name) => format!("identifier '{}'", name),
            Self::Plus => "'+'".to_string(),
            Self::Minus => "'-'".to_string(),
            Self::Star => "'*'".to_string(),
            Self::Slash => "'/'".to_string(),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::Eof => "end of formula".to_string(),
        }
    }
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.input.get(self.pos + 1).copied()
    }

    fn next_token(&mut self) -> Result<(usize, Lexeme)> {
        self.skip_whitespace();
        let start = self.pos;

        let Some(ch) = self.peek() else {
            return Ok((start, Lexeme::Eof));
        };

        if ch.is_ascii_digit() || (ch == b'.' && self.peek_next().is_some_and(|c| c.is_ascii_digit()))
        {
            return self.scan_number(start).map(|lexeme| (start, lexeme));
        }

        if ch == b'_' || ch.is_ascii_alphabetic() {
            return Ok((start, self.scan_identifier(start)));
        }

        self.pos += 1;
        let lexeme = match ch {
            b'+' => Lexeme::Plus,
            b'-' => Lexeme::Minus,
            b'*' => Lexeme::Star,
            b'/' => Lexeme::Slash,
            b'(' => Lexeme::LParen,
            b')' => Lexeme::RParen,
            other => {
                return Err(MetricEngineError::FormulaSyntax {
                    position: start,
                    message: format!("unexpected character '{}'", other as char),
                })
            }
        };
        Ok((start, lexeme))
    }

    fn consume_digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn scan_number(&mut self, start: usize) -> Result<Lexeme> {
        self.consume_digits();
        if self.peek() == Some(b'.') {
            self.pos += 1;
            self.consume_digits();
        }

        // Exponent only when digits follow, so `2e` stays a syntax error downstream.
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let sign = matches!(self.peek_next(), Some(b'+') | Some(b'-'));
            let digit_at = if sign { self.pos + 2 } else { self.pos + 1 };
            if self.input.get(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                self.pos = digit_at;
                self.consume_digits();
            }
        }

        let text = String::from_utf8_lossy(&self.input[start..self.pos]);
        text.parse::<f64>()
            .map(Lexeme::Number)
            .map_err(|_| MetricEngineError::FormulaSyntax {
                position: start,
                message: format!("invalid numeric literal '{}'", text),
            })
    }

    fn scan_identifier(&mut self, start: usize) -> Lexeme {
        while self
            .peek()
            .is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric())
        {
            self.pos += 1;
        }
        Lexeme::Identifier(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Lexeme)>> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let (position, lexeme) = lexer.next_token()?;
        let done = lexeme == Lexeme::Eof;
        tokens.push((position, lexeme));
        if done {
            return Ok(tokens);
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Lexeme)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<(usize, Lexeme)>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> &Lexeme {
        self.tokens
            .get(self.pos)
            .map(|(_, lexeme)| lexeme)
            .unwrap_or(&Lexeme::Eof)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(position, _)| *position)
            .unwrap_or_default()
    }

    fn advance(&mut self) -> Lexeme {
        let lexeme = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        lexeme
    }

    fn error(&self, message: String) -> MetricEngineError {
        MetricEngineError::FormulaSyntax {
            position: self.position(),
            message,
        }
    }

    fn parse(mut self) -> Result<Expr> {
        let expr = self.parse_expression()?;
        if *self.peek() != Lexeme::Eof {
            return Err(self.error(format!("unexpected {}", self.peek().describe())));
        }
        Ok(expr)
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Lexeme::Plus => BinaryOperator::Add,
                Lexeme::Minus => BinaryOperator::Subtract,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_term()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Lexeme::Star => BinaryOperator::Multiply,
                Lexeme::Slash => BinaryOperator::Divide,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error(format!("nesting deeper than {}", MAX_NESTING)));
        }

        let expr = match self.peek() {
            Lexeme::Minus => {
                self.advance();
                // Negation lowers to `0 - x`; the tree only has literals, tokens and binary ops.
                self.parse_unary()
                    .map(|operand| Expr::binary(BinaryOperator::Subtract, Expr::Literal(0.0), operand))
            }
            Lexeme::Plus => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_primary(),
        };

        self.depth -= 1;
        expr
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Lexeme::Number(v) => Ok(Expr::Literal(v)),
            Lexeme::Identifier(name) => Ok(Expr::Token(name)),
            Lexeme::LParen => {
                let inner = self.parse_expression()?;
                match self.advance() {
                    Lexeme::RParen => Ok(inner),
                    other => Err(self.error(format!("expected ')', found {}", other.describe()))),
                }
            }
            other => Err(self.error(format!("unexpected {}", other.describe()))),
        }
    }
}

// ---------------------------------------------------------------------------
// Dated tokens
// ---------------------------------------------------------------------------

fn dated_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\[(\d{4}-\d{2}-\d{2})\]")
            .expect("dated token pattern is a valid regex")
    })
}

/// An account pinned to an explicit date, written `Name[YYYY-MM-DD]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatedToken {
    pub account: String,
    pub date: NaiveDate,
    placeholder: String,
}

impl DatedToken {
    /// Key callers bind this token under, the token as written in the formula.
    pub fn binding_name(&self) -> String {
        format!("{}[{}]", self.account, self.date.format("%Y-%m-%d"))
    }
}

/// Rewrites every `Name[YYYY-MM-DD]` into a plain identifier the parser accepts.
pub fn substitute_dated_tokens(formula: &str) -> Result<(String, Vec<DatedToken>)> {
    let mut rewritten = String::with_capacity(formula.len());
    let mut dated: Vec<DatedToken> = Vec::new();
    let mut last = 0;

    for caps in dated_token_pattern().captures_iter(formula) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let account = &caps[1];
        let raw_date = &caps[2];
        let date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d").map_err(|_| {
            MetricEngineError::FormulaSyntax {
                position: whole.start(),
                message: format!("invalid date '{}' in dated token", raw_date),
            }
        })?;

        let placeholder = format!("__{}_{}__", account, date.format("%Y%m%d"));
        rewritten.push_str(&formula[last..whole.start()]);
        rewritten.push_str(&placeholder);
        last = whole.end();

        if !dated.iter().any(|d| d.placeholder == placeholder) {
            dated.push(DatedToken {
                account: account.to_string(),
                date,
                placeholder,
            });
        }
    }

    rewritten.push_str(&formula[last..]);
    Ok((rewritten, dated))
}

// ---------------------------------------------------------------------------
// Formula
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    text: String,
    expr: Expr,
    tokens: Vec<String>,
    dated: Vec<DatedToken>,
}

impl Formula {
    pub fn parse(text: &str) -> Result<Self> {
        let (rewritten, dated) = substitute_dated_tokens(text)?;
        let expr = Parser::new(tokenize(&rewritten)?).parse()?;

        let mut identifiers = Vec::new();
        expr.collect_tokens(&mut identifiers);
        let tokens = identifiers
            .into_iter()
            .filter(|name| !dated.iter().any(|d| &d.placeholder == name))
            .collect();

        Ok(Self {
            text: text.to_string(),
            expr,
            tokens,
            dated,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Undated identifiers, in order of first appearance.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn dated_tokens(&self) -> &[DatedToken] {
        &self.dated
    }

    /// Every name `evaluate` requires a binding for.
    pub fn binding_names(&self) -> Vec<String> {
        self.tokens
            .iter()
            .cloned()
            .chain(self.dated.iter().map(DatedToken::binding_name))
            .collect()
    }

    /// Fails with `UnboundToken` before any arithmetic if a name lacks a binding.
    /// Division by zero and non-finite results evaluate to `Ok(None)`.
    pub fn evaluate(&self, bindings: &BTreeMap<String, f64>) -> Result<Option<f64>> {
        let mut values: BTreeMap<&str, f64> = BTreeMap::new();

        for token in &self.tokens {
            let value = bindings
                .get(token)
                .ok_or_else(|| MetricEngineError::UnboundToken(token.clone()))?;
            values.insert(token.as_str(), *value);
        }

        for dated in &self.dated {
            let name = dated.binding_name();
            let value = bindings
                .get(&name)
                .ok_or(MetricEngineError::UnboundToken(name))?;
            values.insert(dated.placeholder.as_str(), *value);
        }

        Ok(self.expr.evaluate(&values))
    }
}

pub fn evaluate(formula: &str, bindings: &BTreeMap<String, f64>) -> Result<Option<f64>> {
    Formula::parse(formula)?.evaluate(bindings)
}
