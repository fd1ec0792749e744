//! Guard expressions and guard evaluation.
//!
//! A guard is either a compiled closure or an expression in a small,
//! read-only boolean language. Expressions can reference:
//!
//! - `context.path` - the event context overlaid on the stored context
//!   (event keys win); `ctx.path` is an alias
//! - `record.path` - the stored record context only
//! - `event.path` - the event context only
//!
//! Paths may be nested (`context.order.customer.verified`). Supported
//! operators:
//!
//! - `context.field` - truthy check
//! - `==`, `!=` - equality (strings, numbers, booleans, null)
//! - `>`, `>=`, `<`, `<=` - numeric comparison
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping
//!
//! Examples:
//! - `context.score >= 60`
//! - `event.amount > 100 && record.approved`
//! - `!context.disabled`
//! - `context.status == "active"`

use crate::error::{CoreError, GuardError};
use crate::record::{Context, StateRecord};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Which part of the guard input a field reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Event context first, then the stored context.
    Merged,
    /// Stored record context only.
    Record,
    /// Event context only.
    Event,
}

/// A field reference inside a guard expression.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub scope: Scope,
    pub path: String,
}

/// A parsed guard expression.
#[derive(Debug, Clone)]
pub enum GuardExpr {
    /// Field is truthy.
    Truthy(FieldRef),
    /// Equality comparison.
    Eq(FieldRef, Value),
    /// Inequality comparison.
    Ne(FieldRef, Value),
    /// Greater than.
    Gt(FieldRef, f64),
    /// Greater or equal.
    Ge(FieldRef, f64),
    /// Less than.
    Lt(FieldRef, f64),
    /// Less or equal.
    Le(FieldRef, f64),
    /// Logical AND.
    And(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical OR.
    Or(Box<GuardExpr>, Box<GuardExpr>),
    /// Logical NOT.
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty guard expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(invalid(format!(
                "unexpected trailing input: '{}'",
                &parser.input[parser.pos..]
            )));
        }
        Ok(expr)
    }

    /// Evaluates the expression. Missing fields read as null.
    pub fn evaluate(&self, input: &GuardInput<'_>) -> bool {
        match self {
            GuardExpr::Truthy(field) => is_truthy(input.lookup(field)),
            GuardExpr::Eq(field, expected) => values_equal(input.lookup(field), expected),
            GuardExpr::Ne(field, expected) => !values_equal(input.lookup(field), expected),
            GuardExpr::Gt(field, n) => compare(input.lookup(field), |v| v > *n),
            GuardExpr::Ge(field, n) => compare(input.lookup(field), |v| v >= *n),
            GuardExpr::Lt(field, n) => compare(input.lookup(field), |v| v < *n),
            GuardExpr::Le(field, n) => compare(input.lookup(field), |v| v <= *n),
            GuardExpr::And(left, right) => left.evaluate(input) && right.evaluate(input),
            GuardExpr::Or(left, right) => left.evaluate(input) || right.evaluate(input),
            GuardExpr::Not(inner) => !inner.evaluate(input),
        }
    }
}

/// Read-only view handed to guards: the stored record plus the event context.
#[derive(Debug, Clone, Copy)]
pub struct GuardInput<'a> {
    pub record: &'a StateRecord,
    pub event: &'a Context,
}

impl<'a> GuardInput<'a> {
    pub fn new(record: &'a StateRecord, event: &'a Context) -> Self {
        Self { record, event }
    }

    /// Looks up a dotted path in the merged view (event first).
    pub fn get(&self, path: &str) -> Option<&'a Value> {
        get_path(self.event, path).or_else(|| get_path(&self.record.context, path))
    }

    /// Like [`get`](Self::get) but reports a missing binding as an error.
    pub fn require(&self, path: &str) -> Result<&'a Value, GuardError> {
        self.get(path)
            .ok_or_else(|| GuardError::MissingBinding(path.to_string()))
    }

    /// Reads a numeric binding from the merged view.
    pub fn number(&self, path: &str) -> Result<f64, GuardError> {
        self.require(path)?
            .as_f64()
            .ok_or_else(|| GuardError::TypeMismatch {
                field: path.to_string(),
                expected: "number",
            })
    }

    fn lookup(&self, field: &FieldRef) -> &'a Value {
        let found = match field.scope {
            Scope::Merged => self.get(&field.path),
            Scope::Record => get_path(&self.record.context, &field.path),
            Scope::Event => get_path(self.event, &field.path),
        };
        found.unwrap_or(&Value::Null)
    }
}

fn get_path<'v>(map: &'v Context, path: &str) -> Option<&'v Value> {
    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        // Integers compare exactly; f64 would merge values above 2^53.
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                a == b
            } else if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                a == b
            } else {
                a.as_f64()
                    .zip(b.as_f64())
                    .map(|(a, b)| (a - b).abs() < f64::EPSILON)
                    .unwrap_or(false)
            }
        }
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

fn compare(value: &Value, op: impl Fn(f64) -> bool) -> bool {
    value.as_f64().map(op).unwrap_or(false)
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidGuard {
        reason: reason.into(),
    }
}

fn to_f64(text: &str) -> Result<f64, CoreError> {
    text.parse::<f64>()
        .map_err(|_| invalid(format!("invalid number: '{}'", text)))
}

/// Maximum nesting of `(` and `!` in one expression.
const MAX_DEPTH: usize = 64;

/// Recursive descent parser for guard expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
        }
    }

    /// Runs `f` one nesting level deeper.
    fn nested(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<GuardExpr, CoreError>,
    ) -> Result<GuardExpr, CoreError> {
        if self.depth >= MAX_DEPTH {
            return Err(invalid("expression nested too deeply"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn parse_expr(&mut self) -> Result<GuardExpr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.nested(Self::parse_unary)?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.nested(Self::parse_expr)?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(invalid("expected ')'"));
            }
            self.pos += 1;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, CoreError> {
        let field = self.parse_field()?;
        self.skip_whitespace();

        // Two-character operators must be tried before their prefixes.
        if self.peek_str("==") {
            self.pos += 2;
            return Ok(GuardExpr::Eq(field, self.parse_value()?));
        }
        if self.peek_str("!=") {
            self.pos += 2;
            return Ok(GuardExpr::Ne(field, self.parse_value()?));
        }
        if self.peek_str(">=") {
            self.pos += 2;
            return Ok(GuardExpr::Ge(field, self.parse_number()?));
        }
        if self.peek_str("<=") {
            self.pos += 2;
            return Ok(GuardExpr::Le(field, self.parse_number()?));
        }
        if self.peek_char() == Some('>') {
            self.pos += 1;
            return Ok(GuardExpr::Gt(field, self.parse_number()?));
        }
        if self.peek_char() == Some('<') {
            self.pos += 1;
            return Ok(GuardExpr::Lt(field, self.parse_number()?));
        }

        Ok(GuardExpr::Truthy(field))
    }

    fn parse_field(&mut self) -> Result<FieldRef, CoreError> {
        self.skip_whitespace();

        let scope = [
            ("context.", Scope::Merged),
            ("ctx.", Scope::Merged),
            ("record.", Scope::Record),
            ("event.", Scope::Event),
        ]
        .into_iter()
        .find(|(prefix, _)| self.peek_str(prefix));

        let Some((prefix, scope)) = scope else {
            return Err(invalid(
                "field must start with 'context.', 'ctx.', 'record.' or 'event.'",
            ));
        };
        self.pos += prefix.len();

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let path = &self.input[start..self.pos];
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(invalid(format!("invalid field path '{}{}'", prefix, path)));
        }

        Ok(FieldRef {
            scope,
            path: path.to_string(),
        })
    }

    fn parse_value(&mut self) -> Result<Value, CoreError> {
        self.skip_whitespace();

        for (literal, value) in [
            ("true", Value::Bool(true)),
            ("false", Value::Bool(false)),
            ("null", Value::Null),
        ] {
            if self.peek_str(literal) {
                self.pos += literal.len();
                return Ok(value);
            }
        }

        if self.peek_char() == Some('"') {
            return self.parse_string_value();
        }

        let text = self.scan_number();
        if !text.contains('.') {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Value::from(n));
            }
            if let Ok(n) = text.parse::<u64>() {
                return Ok(Value::from(n));
            }
        }
        let num = to_f64(text)?;
        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("non-finite number: {}", num)))
    }

    fn parse_string_value(&mut self) -> Result<Value, CoreError> {
        // Opening quote already peeked by the caller.
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            match c {
                '"' => return Ok(Value::String(out)),
                '\\' => {
                    let escaped = self
                        .peek_char()
                        .ok_or_else(|| invalid("unterminated string"))?;
                    self.pos += escaped.len_utf8();
                    out.push(escaped);
                }
                _ => out.push(c),
            }
        }

        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<f64, CoreError> {
        let text = self.scan_number();
        to_f64(text)
    }

    /// Consumes an optionally signed decimal literal.
    fn scan_number(&mut self) -> &'a str {
        self.skip_whitespace();
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek_char() == Some('.') {
            self.pos += 1;
            while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }

        &self.input[start..self.pos]
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

/// Signature of a compiled guard predicate.
pub type GuardFn = dyn Fn(&GuardInput<'_>) -> Result<bool, GuardError> + Send + Sync;

/// A transition guard.
#[derive(Clone)]
pub enum Guard {
    /// Parsed expression, with its source text.
    Expr { source: String, expr: GuardExpr },
    /// Named closure predicate.
    Predicate { name: String, func: Arc<GuardFn> },
}

impl Guard {
    /// Parses an expression guard.
    pub fn expr(source: &str) -> Result<Self, CoreError> {
        Ok(Guard::Expr {
            source: source.trim().to_string(),
            expr: GuardExpr::parse(source)?,
        })
    }

    /// Wraps a closure as a named guard.
    pub fn predicate<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&GuardInput<'_>) -> Result<bool, GuardError> + Send + Sync + 'static,
    {
        Guard::Predicate {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Expression source, or `@name` for predicates.
    pub fn describe(&self) -> String {
        match self {
            Guard::Expr { source, .. } => source.clone(),
            Guard::Predicate { name, .. } => format!("@{}", name),
        }
    }

    fn check(&self, input: &GuardInput<'_>) -> Result<bool, GuardError> {
        match self {
            Guard::Expr { expr, .. } => Ok(expr.evaluate(input)),
            Guard::Predicate { func, .. } => func(input),
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Guard").field(&self.describe()).finish()
    }
}

/// Evaluates guards, failing closed.
pub struct GuardEvaluator;

impl GuardEvaluator {
    /// Evaluates an optional guard (None = always true).
    ///
    /// A guard that returns an error is logged and counts as `false`.
    pub fn evaluate(guard: Option<&Guard>, record: &StateRecord, event: &Context) -> bool {
        let Some(guard) = guard else {
            return true;
        };

        match guard.check(&GuardInput::new(record, event)) {
            Ok(passed) => passed,
            Err(e) => {
                tracing::warn!(
                    machine = %record.machine_id,
                    entity = %record.entity_id,
                    guard = %guard.describe(),
                    "guard evaluation failed, treating as false: {}",
                    e
                );
                false
            }
        }
    }
}
