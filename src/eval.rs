//! Named-value evaluation for templated statements.
//!
//! Token references (`#{order.id}`) and `if` test expressions
//! (`custID != null && limit > 0`) are resolved against a set of named
//! values ("beans") supplied per execution. The evaluator is pluggable:
//! anything implementing [`Evaluator`] can back the SQL builder; the
//! default [`BeanContext`] evaluates dotted paths over JSON values and a
//! small boolean expression grammar:
//!
//! - operands: named paths, `null`, `true`/`false`, numbers, `'...'` or
//!   `"..."` strings, parenthesized expressions
//! - comparisons: `==` `!=` `>` `>=` `<` `<=`
//! - connectives: `&&` `||` `!`
//!
//! A bare operand is tested for truthiness (non-null, non-zero, non-empty).

use crate::error::{DbError, DbResult};
use serde_json::{Map, Value};

/// Resolves and assigns named values by dotted path and evaluates boolean
/// test expressions against them.
pub trait Evaluator {
    /// Value at the path; `Value::Null` when absent.
    fn value(&self, path: &str) -> Value;

    /// Assigns the value at the path, creating intermediate objects.
    fn set_value(&mut self, path: &str, value: Value);

    /// Evaluates a boolean test expression.
    fn test(&self, expr: &str) -> DbResult<bool>;
}

/// The default evaluator: a map of named JSON values.
#[derive(Debug, Clone, Default)]
pub struct BeanContext {
    beans: Map<String, Value>,
}

impl BeanContext {
    pub fn new() -> Self {
        Self { beans: Map::new() }
    }

    pub fn from_map(beans: Map<String, Value>) -> Self {
        Self { beans }
    }

    pub fn beans(&self) -> &Map<String, Value> {
        &self.beans
    }

    pub fn into_beans(self) -> Map<String, Value> {
        self.beans
    }

    pub fn set_bean(&mut self, name: impl Into<String>, value: Value) {
        self.beans.insert(name.into(), value);
    }

    pub fn clear(&mut self) {
        self.beans.clear();
    }
}

impl Evaluator for BeanContext {
    fn value(&self, path: &str) -> Value {
        let mut current: &Value = &Value::Null;
        for (i, seg) in path.split('.').enumerate() {
            let seg = seg.trim();
            current = if i == 0 {
                match self.beans.get(seg) {
                    Some(v) => v,
                    None => return Value::Null,
                }
            } else {
                match current {
                    Value::Object(map) => match map.get(seg) {
                        Some(v) => v,
                        None => return Value::Null,
                    },
                    _ => return Value::Null,
                }
            };
        }
        current.clone()
    }

    fn set_value(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').map(str::trim).collect();
        let (head, rest) = match segments.split_first() {
            Some(split) => split,
            None => return,
        };
        if rest.is_empty() {
            self.beans.insert(head.to_string(), value);
            return;
        }
        let slot = self
            .beans
            .entry(head.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let mut current = slot;
        for seg in &rest[..rest.len() - 1] {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            current = current
                .as_object_mut()
                .expect("just ensured object")
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current
            .as_object_mut()
            .expect("just ensured object")
            .insert(rest[rest.len() - 1].to_string(), value);
    }

    fn test(&self, expr: &str) -> DbResult<bool> {
        let tokens = lex(expr)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            ctx: self,
        };
        let result = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(DbError::parse(format!(
                "trailing input in test expression: '{expr}'"
            )));
        }
        Ok(truthy(&result))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Null,
    True,
    False,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn lex(expr: &str) -> DbResult<Vec<Token>> {
    let bytes: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
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
            '=' | '!' | '>' | '<' | '&' | '|' => {
                let next = bytes.get(i + 1).copied();
                let (token, used) = match (c, next) {
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::Ne, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('&', Some('&')) => (Token::And, 2),
                    ('|', Some('|')) => (Token::Or, 2),
                    ('>', _) => (Token::Gt, 1),
                    ('<', _) => (Token::Lt, 1),
                    ('!', _) => (Token::Not, 1),
                    _ => {
                        return Err(DbError::parse(format!(
                            "unexpected '{c}' in test expression: '{expr}'"
                        )));
                    }
                };
                tokens.push(token);
                i += used;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(DbError::parse(format!(
                                "unterminated string in test expression: '{expr}'"
                            )));
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == '.') {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    DbError::parse(format!("bad number '{text}' in test expression"))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_alphanumeric() || bytes[i] == '_' || bytes[i] == '.')
                {
                    i += 1;
                }
                let word: String = bytes[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "null" => Token::Null,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            _ => {
                return Err(DbError::parse(format!(
                    "unexpected '{c}' in test expression: '{expr}'"
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'a BeanContext,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn or_expr(&mut self) -> DbResult<Value> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.and_expr()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> DbResult<Value> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.unary()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> DbResult<Value> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let v = self.unary()?;
            return Ok(Value::Bool(!truthy(&v)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> DbResult<Value> {
        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq | Token::Ne | Token::Gt | Token::Ge | Token::Lt | Token::Le) => {
                self.next().expect("peeked")
            }
            _ => return Ok(left),
        };
        let right = self.operand()?;
        Ok(Value::Bool(compare(&op, &left, &right)?))
    }

    fn operand(&mut self) -> DbResult<Value> {
        match self.next() {
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Number(n)) => Ok(serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Ident(path)) => Ok(self.ctx.value(&path)),
            Some(Token::LParen) => {
                let v = self.or_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(v),
                    _ => Err(DbError::parse("missing ')' in test expression")),
                }
            }
            other => Err(DbError::parse(format!(
                "expected operand in test expression, found {other:?}"
            ))),
        }
    }
}

fn compare(op: &Token, left: &Value, right: &Value) -> DbResult<bool> {
    use std::cmp::Ordering;

    // Equality covers null on either side; ordering requires comparable
    // operands.
    if matches!(op, Token::Eq | Token::Ne) {
        let equal = match (left, right) {
            (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
            _ => left == right,
        };
        return Ok(if *op == Token::Eq { equal } else { !equal });
    }

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let ordering = ordering.ok_or_else(|| {
        DbError::parse(format!("operands not comparable: {left} vs {right}"))
    })?;
    Ok(match op {
        Token::Gt => ordering == Ordering::Greater,
        Token::Ge => ordering != Ordering::Less,
        Token::Lt => ordering == Ordering::Less,
        Token::Le => ordering != Ordering::Greater,
        _ => unreachable!("comparison operator"),
    })
}
