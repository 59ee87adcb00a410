//! Row relevance conditions for trigger rules.
//!
//! A condition is either a Rust closure receiving `(row, after, deleted)` or
//! a filter expression parsed from text, such as:
//! - `status = 'open'`
//! - `priority >= 2 AND owner_id IS NOT NULL`
//! - `region IN ('eu', 'us') OR NOT archived = true`
//!
//! For update events the closure sees the old row first and the new row as
//! `after`; a filter expression matches when either version matches.

use crate::error::{LiveError, Result};
use crate::notice::RowChange;
use crate::row::Row;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

type ConditionFn = dyn Fn(&Row, Option<&Row>, bool) -> bool + Send + Sync;

/// Predicate deciding whether a row event is relevant to a subscription.
#[derive(Clone)]
pub enum Condition {
    Func(Arc<ConditionFn>),
    Filter(Filter),
}

impl Condition {
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&Row, Option<&Row>, bool) -> bool + Send + Sync + 'static,
    {
        Condition::Func(Arc::new(f))
    }

    /// Parse a filter expression.
    pub fn parse(source: &str) -> Result<Self> {
        Filter::parse(source).map(Condition::Filter)
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        match (self, change) {
            (Condition::Func(f), RowChange::Insert(row)) => f(row, None, false),
            (Condition::Func(f), RowChange::Delete(row)) => f(row, None, true),
            (Condition::Func(f), RowChange::Update { before, after }) => {
                f(before, Some(after), false)
            }
            (Condition::Filter(filter), RowChange::Insert(row) | RowChange::Delete(row)) => {
                filter.eval(row)
            }
            (Condition::Filter(filter), RowChange::Update { before, after }) => {
                filter.eval(before) || filter.eval(after)
            }
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Func(_) => f.write_str("Condition::Func"),
            Condition::Filter(filter) => write!(f, "Condition::Filter({:?})", filter.source),
        }
    }
}

/// A parsed filter expression and the text it came from.
#[derive(Debug, Clone)]
pub struct Filter {
    source: String,
    expr: Expr,
}

impl Filter {
    pub fn parse(source: &str) -> Result<Self> {
        let expr = parse_expr(source)
            .map_err(|e| LiveError::InvalidArgument(format!("condition '{source}': {e}")))?;
        Ok(Filter {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, row: &Row) -> bool {
        eval_expr(&self.expr, row)
    }

    /// Columns the expression reads.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        collect_columns(&self.expr, &mut columns);
        columns.sort();
        columns.dedup();
        columns
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Compare { column: String, op: CompareOp, value: Value },
    In { column: String, values: Vec<Value> },
    IsNull { column: String },
    IsNotNull { column: String },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Op(CompareOp),
    Comma,
    And,
    Or,
    Not,
    Is,
    In,
    Null,
    LParen,
    RParen,
    Eof,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Lexer {
            chars: input.chars().peekable(),
        }
    }

    fn take_while<P: Fn(char) -> bool>(&mut self, first: char, pred: P) -> String {
        let mut out = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if !pred(c) {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out
    }

    fn number(&mut self, first: char) -> std::result::Result<Token, String> {
        let text = self.take_while(first, |c| c.is_ascii_digit() || c == '.');
        if let Ok(i) = text.parse::<i64>() {
            return Ok(Token::Literal(Value::from(i)));
        }
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(|n| Token::Literal(Value::Number(n)))
            .ok_or_else(|| format!("bad number '{text}'"))
    }

    fn quoted(&mut self, quote: char) -> std::result::Result<Token, String> {
        let mut text = String::new();
        while let Some(c) = self.chars.next() {
            if c == quote {
                // SQL style doubled quote
                if self.chars.peek() == Some(&quote) {
                    self.chars.next();
                    text.push(quote);
                    continue;
                }
                return Ok(Token::Literal(Value::String(text)));
            }
            text.push(c);
        }
        Err("unterminated string".to_string())
    }

    fn next_token(&mut self) -> std::result::Result<Token, String> {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
        let Some(c) = self.chars.next() else {
            return Ok(Token::Eof);
        };
        let followed_by_eq = |lexer: &mut Self| {
            if lexer.chars.peek() == Some(&'=') {
                lexer.chars.next();
                true
            } else {
                false
            }
        };
        match c {
            '(' => Ok(Token::LParen),
            ')' => Ok(Token::RParen),
            ',' => Ok(Token::Comma),
            '=' => {
                followed_by_eq(self);
                Ok(Token::Op(CompareOp::Eq))
            }
            '!' if followed_by_eq(self) => Ok(Token::Op(CompareOp::Ne)),
            '!' => Ok(Token::Not),
            '<' if self.chars.peek() == Some(&'>') => {
                self.chars.next();
                Ok(Token::Op(CompareOp::Ne))
            }
            '<' if followed_by_eq(self) => Ok(Token::Op(CompareOp::Le)),
            '<' => Ok(Token::Op(CompareOp::Lt)),
            '>' if followed_by_eq(self) => Ok(Token::Op(CompareOp::Ge)),
            '>' => Ok(Token::Op(CompareOp::Gt)),
            '\'' | '"' => self.quoted(c),
            '-' if self.chars.peek().is_some_and(|d| d.is_ascii_digit()) => {
                let next = self.chars.next().unwrap_or('0');
                match self.number(next)? {
                    Token::Literal(Value::Number(n)) => {
                        let negated = n
                            .as_i64()
                            .map(|i| Value::from(-i))
                            .or_else(|| n.as_f64().map(|f| Value::from(-f)))
                            .unwrap_or(Value::Null);
                        Ok(Token::Literal(negated))
                    }
                    other => Ok(other),
                }
            }
            _ if c.is_ascii_digit() => self.number(c),
            _ if c.is_alphabetic() || c == '_' => {
                let word = self.take_while(c, |c| c.is_alphanumeric() || c == '_' || c == '.');
                Ok(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "IN" => Token::In,
                    "NULL" => Token::Null,
                    "TRUE" => Token::Literal(Value::Bool(true)),
                    "FALSE" => Token::Literal(Value::Bool(false)),
                    _ => Token::Ident(word),
                })
            }
            _ => Err(format!("unexpected character '{c}'")),
        }
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

type ParseResult<T> = std::result::Result<T, String>;

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> ParseResult<Self> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Parser { lexer, current })
    }

    fn bump(&mut self) -> ParseResult<Token> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn eat(&mut self, expected: &Token) -> ParseResult<()> {
        if &self.current != expected {
            return Err(format!("expected {expected:?}, found {:?}", self.current));
        }
        self.bump().map(|_| ())
    }

    fn or_expr(&mut self) -> ParseResult<Expr> {
        let mut left = self.and_expr()?;
        while self.current == Token::Or {
            self.bump()?;
            left = Expr::Or(Box::new(left), Box::new(self.and_expr()?));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> ParseResult<Expr> {
        let mut left = self.unary()?;
        while self.current == Token::And {
            self.bump()?;
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.current == Token::Not {
            self.bump()?;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.current == Token::LParen {
            self.bump()?;
            let inner = self.or_expr()?;
            self.eat(&Token::RParen)?;
            return Ok(inner);
        }
        self.predicate()
    }

    fn literal(&mut self) -> ParseResult<Value> {
        match self.bump()? {
            Token::Literal(v) => Ok(v),
            Token::Null => Ok(Value::Null),
            other => Err(format!("expected literal, found {other:?}")),
        }
    }

    fn predicate(&mut self) -> ParseResult<Expr> {
        let column = match self.bump()? {
            Token::Ident(name) => name,
            other => return Err(format!("expected column name, found {other:?}")),
        };

        match self.bump()? {
            Token::Is => {
                let negated = self.current == Token::Not;
                if negated {
                    self.bump()?;
                }
                self.eat(&Token::Null)?;
                Ok(if negated {
                    Expr::IsNotNull { column }
                } else {
                    Expr::IsNull { column }
                })
            }
            Token::In => {
                self.eat(&Token::LParen)?;
                let mut values = vec![self.literal()?];
                while self.current == Token::Comma {
                    self.bump()?;
                    values.push(self.literal()?);
                }
                self.eat(&Token::RParen)?;
                Ok(Expr::In { column, values })
            }
            Token::Op(op) => {
                let value = self.literal()?;
                Ok(Expr::Compare { column, op, value })
            }
            other => Err(format!("expected operator after '{column}', found {other:?}")),
        }
    }
}

fn parse_expr(input: &str) -> ParseResult<Expr> {
    let mut parser = Parser::new(input)?;
    let expr = parser.or_expr()?;
    if parser.current != Token::Eof {
        return Err(format!("trailing input at {:?}", parser.current));
    }
    Ok(expr)
}

fn eval_expr(expr: &Expr, row: &Row) -> bool {
    match expr {
        Expr::Compare { column, op, value } => row
            .get(column)
            .and_then(|actual| compare(actual, value))
            .is_some_and(|ord| match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
            }),
        Expr::In { column, values } => row.get(column).is_some_and(|actual| {
            values
                .iter()
                .any(|v| compare(actual, v) == Some(Ordering::Equal))
        }),
        Expr::IsNull { column } => row.get(column).map_or(true, Value::is_null),
        Expr::IsNotNull { column } => row.get(column).is_some_and(|v| !v.is_null()),
        Expr::And(l, r) => eval_expr(l, row) && eval_expr(r, row),
        Expr::Or(l, r) => eval_expr(l, row) || eval_expr(r, row),
        Expr::Not(inner) => !eval_expr(inner, row),
    }
}

/// SQL-like comparison: NULL compares to nothing, mismatched types never
/// compare, `false` sorts before `true`.
fn compare(actual: &Value, literal: &Value) -> Option<Ordering> {
    match (actual, literal) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn collect_columns(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Compare { column, .. }
        | Expr::In { column, .. }
        | Expr::IsNull { column }
        | Expr::IsNotNull { column } => out.push(column.clone()),
        Expr::And(l, r) | Expr::Or(l, r) => {
            collect_columns(l, out);
            collect_columns(r, out);
        }
        Expr::Not(inner) => collect_columns(inner, out),
    }
}
