//! Condition evaluator for workflow steps.
//!
//! Whitelisted grammar only; nothing here can execute code.
//! - Field access: dotted paths (`fetch.status`, `user.profile.name`), bare
//!   or wrapped as `${fetch.status}`
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Logical: `&&`/`and`, `||`/`or`, `!`/`not`, parentheses
//! - Literals: strings (single/double quoted), numbers,
//!   `true`/`false`/`null` (also `True`/`False`/`None`)
//!
//! A missing field resolves to null, so `missing == 1` is false, not an error.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("parse error in condition: {message}")]
    Parse { message: String },
}

fn parse_err(message: impl Into<String>) -> ExpressionError {
    ExpressionError::Parse {
        message: message.into(),
    }
}

/// Evaluate `expression` against `context` and return its truthiness.
pub fn evaluate(expression: &str, context: &Map<String, Value>) -> Result<bool, ExpressionError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(parse_err("empty expression"));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        context,
    };
    let value = parser.or_expr()?;
    if let Some(tok) = parser.peek() {
        return Err(parse_err(format!("unexpected token {tok:?}")));
    }
    Ok(truthy(&value))
}

/// Resolve a dotted path (`a.b.c`) in the context; array segments may be indices.
pub fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Python-style truthiness: null, false, 0, "" and empty collections are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let eq = next == Some('=');
                tokens.push(match (c, eq) {
                    ('>', true) => Token::Ge,
                    ('>', false) => Token::Gt,
                    ('<', true) => Token::Le,
                    _ => Token::Lt,
                });
                i += if eq { 2 } else { 1 };
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '$' if next == Some('{') => {
                let start = i + 2;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .map(|p| start + p)
                    .ok_or_else(|| parse_err("unterminated ${...} reference"))?;
                let path: String = chars[start..end].iter().collect();
                tokens.push(Token::Path(path.trim().to_string()));
                i = end + 1;
            }
            '"' | '\'' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == c)
                    .map(|p| start + p)
                    .ok_or_else(|| parse_err("unterminated string literal"))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| parse_err(format!("invalid number '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" | "True" => Token::Bool(true),
                    "false" | "False" => Token::Bool(false),
                    "null" | "None" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Path(word),
                });
            }
            other => return Err(parse_err(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

/// Precedence (low → high): or, and, not, comparison, primary.
struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    context: &'a Map<String, Value>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn or_expr(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.not_expr()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.not_expr()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Value, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let v = self.not_expr()?;
            return Ok(Value::Bool(!truthy(&v)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, ExpressionError> {
        let left = self.primary()?;
        let op = match self.peek() {
            Some(t @ (Token::Eq | Token::Ne | Token::Gt | Token::Lt | Token::Ge | Token::Le)) => {
                t.clone()
            }
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.primary()?;
        Ok(Value::Bool(compare(&left, &right, &op)))
    }

    fn primary(&mut self) -> Result<Value, ExpressionError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Num(n)) => Ok(serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Path(p)) => Ok(lookup(self.context, &p).cloned().unwrap_or(Value::Null)),
            Some(Token::LParen) => {
                let v = self.or_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(v),
                    _ => Err(parse_err("missing closing parenthesis")),
                }
            }
            Some(other) => Err(parse_err(format!("expected a value, got {other:?}"))),
            None => Err(parse_err("unexpected end of expression")),
        }
    }
}

fn compare(left: &Value, right: &Value, op: &Token) -> bool {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (a, b) => (a == b).then_some(Ordering::Equal),
    };

    match (op, ordering) {
        (Token::Eq, o) => o == Some(Ordering::Equal),
        (Token::Ne, o) => o != Some(Ordering::Equal),
        (Token::Gt, Some(o)) => o == Ordering::Greater,
        (Token::Lt, Some(o)) => o == Ordering::Less,
        (Token::Ge, Some(o)) => o != Ordering::Less,
        (Token::Le, Some(o)) => o != Ordering::Greater,
        _ => false,
    }
}
