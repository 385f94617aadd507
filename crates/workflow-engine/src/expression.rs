//! Expression evaluator and string interpolator.
//!
//! Hand-rolled rather than built on an external expression crate: the
//! condition grammar is small enough that a recursive-descent parser is
//! simpler than pulling in `evalexpr`/`jmespath` for it.

use common::types::JsonValue;
use std::fmt;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("unexpected end of expression")]
    UnexpectedEof,
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("operands are not comparable: {0} vs {1}")]
    Incomparable(String, String),
}

type Result<T> = std::result::Result<T, ExpressionError>;

// ─────────────────────────────────── Paths ─────────────────────────────────

/// Resolves a dotted/bracketed path (`a.b[0].c`) against a JSON context.
/// Returns `None` on any missing segment, matching JS-style optional access
/// rather than erroring.
pub fn get_value_by_path(ctx: &JsonValue, path: &str) -> Option<JsonValue> {
    let mut current = ctx.clone();
    for segment in split_path(path) {
        current = match segment {
            PathSegment::Key(key) => current.as_object()?.get(&key)?.clone(),
            PathSegment::Index(idx) => current.as_array()?.get(idx)?.clone(),
        };
    }
    Some(current)
}

enum PathSegment {
    Key(String),
    Index(usize),
}

fn split_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                let mut index = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    index.push(c);
                }
                if let Ok(idx) = index.parse::<usize>() {
                    segments.push(PathSegment::Index(idx));
                } else if !index.is_empty() {
                    segments.push(PathSegment::Key(index));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    segments
}

// ────────────────────────────── Interpolation ──────────────────────────────

/// Substitutes `{{path}}` and `${path}` occurrences in `template` with the
/// stringified value resolved from `ctx`; unresolved paths become `""`.
pub fn interpolate(template: &str, ctx: &JsonValue) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if template[i..].starts_with("{{") {
            if let Some(end) = template[i + 2..].find("}}") {
                let marker_len = 2 + end + 2;
                let path = template[i + 2..i + 2 + end].trim();
                match get_value_by_path(ctx, path) {
                    Some(value) => out.push_str(&stringify(value)),
                    None => out.push_str(&template[i..i + marker_len]),
                }
                i += marker_len;
                continue;
            }
        } else if template[i..].starts_with("${") {
            if let Some(end) = template[i + 2..].find('}') {
                let marker_len = 2 + end + 1;
                let path = template[i + 2..i + 2 + end].trim();
                match get_value_by_path(ctx, path) {
                    Some(value) => out.push_str(&stringify(value)),
                    None => out.push_str(&template[i..i + marker_len]),
                }
                i += marker_len;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// `Null` still stringifies to an empty string — only an unresolved *path*
/// leaves its `{{..}}`/`${..}` marker unchanged.
fn stringify(value: JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s,
        other => other.to_string(),
    }
}

// ──────────────────────────────── Conditions ───────────────────────────────

/// Evaluates a boolean expression with `&&`, `||`, `!`, and the comparison
/// operators `== != < <= > >=` over path operands and literals.
pub fn evaluate_condition(expr: &str, ctx: &JsonValue) -> Result<bool> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0, ctx };
    let value = parser.parse_or()?;
    parser.expect_eof()?;
    Ok(truthy(&value))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err(ExpressionError::UnterminatedString);
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| ExpressionError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.' || chars[i] == '[' || chars[i] == ']')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(text),
                });
            }
            _ => return Err(ExpressionError::UnexpectedToken(c.to_string())),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'a JsonValue,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_eof(&self) -> Result<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(ExpressionError::UnexpectedToken(format!("{:?}", self.tokens[self.pos])))
        }
    }

    fn parse_or(&mut self) -> Result<JsonValue> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let truthy_left = truthy(&left);
            let right = self.parse_and()?;
            left = JsonValue::Bool(truthy_left || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<JsonValue> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let truthy_left = truthy(&left);
            let right = self.parse_not()?;
            left = JsonValue::Bool(truthy_left && truthy(&right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<JsonValue> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let operand = self.parse_not()?;
            return Ok(JsonValue::Bool(!truthy(&operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<JsonValue> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(Token::Eq),
            Some(Token::Ne) => Some(Token::Ne),
            Some(Token::Lt) => Some(Token::Lt),
            Some(Token::Le) => Some(Token::Le),
            Some(Token::Gt) => Some(Token::Gt),
            Some(Token::Ge) => Some(Token::Ge),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.advance();
        let right = self.parse_operand()?;
        let result = match op {
            Token::Eq => deep_eq(&left, &right),
            Token::Ne => !deep_eq(&left, &right),
            Token::Lt | Token::Le | Token::Gt | Token::Ge => {
                let ordering = numeric_compare(&left, &right)?;
                match op {
                    Token::Lt => ordering.is_lt(),
                    Token::Le => ordering.is_le(),
                    Token::Gt => ordering.is_gt(),
                    Token::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                }
            }
            _ => unreachable!(),
        };
        Ok(JsonValue::Bool(result))
    }

    fn parse_operand(&mut self) -> Result<JsonValue> {
        match self.advance().ok_or(ExpressionError::UnexpectedEof)? {
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(ExpressionError::UnexpectedToken(format!("{other:?}"))),
                }
            }
            Token::Not => {
                let operand = self.parse_operand()?;
                Ok(JsonValue::Bool(!truthy(&operand)))
            }
            Token::Number(n) => Ok(serde_json::Number::from_f64(n).map(JsonValue::Number).unwrap_or(JsonValue::Null)),
            Token::Str(s) => Ok(JsonValue::String(s)),
            Token::True => Ok(JsonValue::Bool(true)),
            Token::False => Ok(JsonValue::Bool(false)),
            Token::Null => Ok(JsonValue::Null),
            Token::Ident(path) => Ok(get_value_by_path(self.ctx, &path).unwrap_or(JsonValue::Null)),
            other => Err(ExpressionError::UnexpectedToken(format!("{other:?}"))),
        }
    }
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

/// Deep structural equality: numbers compare by value,
/// objects/arrays compare element-wise regardless of key order for objects.
fn deep_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        (JsonValue::Array(x), JsonValue::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| deep_eq(a, b))
        }
        (JsonValue::Object(x), JsonValue::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|v2| deep_eq(v, v2)))
        }
        _ => a == b,
    }
}

fn numeric_compare(a: &JsonValue, b: &JsonValue) -> Result<std::cmp::Ordering> {
    let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) else {
        return Err(ExpressionError::Incomparable(describe(a), describe(b)));
    };
    x.partial_cmp(&y).ok_or_else(|| ExpressionError::Incomparable(describe(a), describe(b)))
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn describe(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "null".to_string(),
        other => other.to_string(),
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
