//! Policy conditions.
//!
//! A resolved policy may carry a condition; the manager evaluates it
//! against the exchange before instantiating the policy and leaves the
//! policy out of the chain when it is false.
//!
//! [`ExpressionConditionEvaluator`] understands a small expression language:
//!
//! ```text
//! expr    := or
//! or      := and ('||' and)*
//! and     := unary ('&&' unary)*
//! unary   := '!' unary | compare
//! compare := primary (('==' | '!=' | 'matches') primary)?
//! primary := 'true' | 'false' | string | reference | '(' expr ')'
//! string  := '\'' chars '\''
//! reference := '#request.method' | '#request.path'
//!            | '#request.headers[' string ']'
//!            | '#context.attributes[' string ']'
//! ```
//!
//! The whole expression may be wrapped in `{ }`. The right-hand side of
//! `matches` must be a string literal; it is compiled as a regex once, when
//! the expression is first parsed.
//!
//! # Example
//!
//! ```
//! use tollgate_core::ExecutionContext;
//! use tollgate_policy::condition::{ConditionEvaluator, ExpressionConditionEvaluator};
//!
//! let request = http::Request::builder()
//!     .method("POST")
//!     .uri("/orders")
//!     .header("x-tenant", "acme")
//!     .body(())
//!     .unwrap();
//! let ctx = ExecutionContext::new(request);
//!
//! let evaluator = ExpressionConditionEvaluator::new();
//! let condition = "{#request.method == 'POST' && #request.headers['x-tenant'] == 'acme'}";
//! assert!(evaluator.evaluate(condition, &ctx).unwrap());
//! assert!(!evaluator.evaluate("#request.path matches '^/admin'", &ctx).unwrap());
//! ```

use crate::error::ConditionError;
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;
use tollgate_core::ExecutionContext;

/// Decides whether a conditional policy applies to an exchange.
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluates `condition` against the exchange.
    fn evaluate(&self, condition: &str, ctx: &ExecutionContext) -> Result<bool, ConditionError>;
}

/// Evaluator for the built-in expression language.
///
/// Parsed expressions are cached by source text.
#[derive(Debug, Default)]
pub struct ExpressionConditionEvaluator {
    cache: DashMap<String, Arc<Expr>>,
}

impl ExpressionConditionEvaluator {
    /// Creates an evaluator with an empty expression cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a condition without evaluating it.
    ///
    /// Useful to reject malformed conditions when they are configured.
    pub fn validate(&self, condition: &str) -> Result<(), ConditionError> {
        self.parse(condition).map(|_| ())
    }

    fn parse(&self, condition: &str) -> Result<Arc<Expr>, ConditionError> {
        if let Some(expr) = self.cache.get(condition) {
            return Ok(Arc::clone(expr.value()));
        }

        let expr = Arc::new(Parser::parse(condition)?);
        self.cache.insert(condition.to_string(), Arc::clone(&expr));
        Ok(expr)
    }
}

impl ConditionEvaluator for ExpressionConditionEvaluator {
    fn evaluate(&self, condition: &str, ctx: &ExecutionContext) -> Result<bool, ConditionError> {
        let expr = self.parse(condition)?;
        match expr.eval(ctx).map_err(|reason| evaluate_error(condition, reason))? {
            Value::Bool(value) => Ok(value),
            other => Err(evaluate_error(
                condition,
                format!("expected a boolean result, got {}", other.type_name()),
            )),
        }
    }
}

fn evaluate_error(condition: &str, reason: String) -> ConditionError {
    ConditionError::Evaluate {
        condition: condition.to_string(),
        reason,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Bool(bool),
    Str(String),
    Null,
}

impl Value {
    const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Str(_) => "string",
            Self::Null => "null",
        }
    }

    fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }
}

#[derive(Debug)]
enum Reference {
    Method,
    Path,
    Header(String),
    Attribute(String),
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Reference(Reference),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Matches(Box<Expr>, Regex),
}

impl Expr {
    fn eval(&self, ctx: &ExecutionContext) -> Result<Value, String> {
        Ok(match self {
            Self::Literal(value) => value.clone(),
            Self::Reference(reference) => resolve(reference, ctx),
            Self::Not(inner) => Value::Bool(!inner.eval_bool(ctx)?),
            Self::And(left, right) => Value::Bool(left.eval_bool(ctx)? && right.eval_bool(ctx)?),
            Self::Or(left, right) => Value::Bool(left.eval_bool(ctx)? || right.eval_bool(ctx)?),
            Self::Eq(left, right) => Value::Bool(left.eval(ctx)? == right.eval(ctx)?),
            Self::Ne(left, right) => Value::Bool(left.eval(ctx)? != right.eval(ctx)?),
            Self::Matches(left, pattern) => match left.eval(ctx)? {
                Value::Str(s) => Value::Bool(pattern.is_match(&s)),
                Value::Null => Value::Bool(false),
                Value::Bool(_) => return Err("'matches' needs a string on its left".to_string()),
            },
        })
    }

    fn eval_bool(&self, ctx: &ExecutionContext) -> Result<bool, String> {
        match self.eval(ctx)? {
            Value::Bool(value) => Ok(value),
            other => Err(format!("expected a boolean operand, got {}", other.type_name())),
        }
    }
}

fn resolve(reference: &Reference, ctx: &ExecutionContext) -> Value {
    match reference {
        Reference::Method => Value::Str(ctx.request().method().as_str().to_string()),
        Reference::Path => Value::Str(ctx.request().uri().path().to_string()),
        Reference::Header(name) => ctx
            .request()
            .headers()
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .map_or(Value::Null, |v| Value::Str(v.to_string())),
        Reference::Attribute(name) => ctx.attribute(name).map_or(Value::Null, Value::from_json),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    True,
    False,
    Str(String),
    Reference(String),
    Index(String),
    Eq,
    Ne,
    Matches,
    Not,
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(at, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '\'' => {
                chars.next();
                tokens.push(Token::Str(read_string(&mut chars, at)?));
            }
            '[' => {
                chars.next();
                let Some((quote_at, '\'')) = chars.next() else {
                    return Err(format!("expected a quoted key after '[' at {at}"));
                };
                let key = read_string(&mut chars, quote_at)?;
                if !matches!(chars.next(), Some((_, ']'))) {
                    return Err(format!("unclosed '[' at {at}"));
                }
                tokens.push(Token::Index(key));
            }
            '#' => {
                chars.next();
                let mut path = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                        path.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Reference(path));
            }
            '=' | '!' | '&' | '|' => {
                chars.next();
                let doubled = chars.peek().map(|&(_, next)| next);
                let token = match (c, doubled) {
                    ('=', Some('=')) => Token::Eq,
                    ('!', Some('=')) => Token::Ne,
                    ('&', Some('&')) => Token::And,
                    ('|', Some('|')) => Token::Or,
                    ('!', _) => {
                        tokens.push(Token::Not);
                        continue;
                    }
                    _ => return Err(format!("unexpected '{c}' at {at}")),
                };
                chars.next();
                tokens.push(token);
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "matches" => Token::Matches,
                    _ => return Err(format!("unknown identifier '{word}' at {at}")),
                });
            }
            _ => return Err(format!("unexpected '{c}' at {at}")),
        }
    }

    Ok(tokens)
}

/// Reads a single-quoted string whose opening quote was consumed.
///
/// `\'` and `\\` are the only escapes.
fn read_string(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>, start: usize) -> Result<String, String> {
    let mut value = String::new();
    loop {
        match chars.next() {
            Some((_, '\'')) => return Ok(value),
            Some((_, '\\')) => match chars.next() {
                Some((_, c @ ('\'' | '\\'))) => value.push(c),
                Some((_, c)) => {
                    value.push('\\');
                    value.push(c);
                }
                None => break,
            },
            Some((_, c)) => value.push(c),
            None => break,
        }
    }
    Err(format!("unterminated string starting at {start}"))
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn parse(condition: &str) -> Result<Expr, ConditionError> {
        let parse_error = |reason: String| ConditionError::Parse {
            condition: condition.to_string(),
            reason,
        };

        let source = condition.trim();
        let source = source
            .strip_prefix('{')
            .and_then(|inner| inner.strip_suffix('}'))
            .unwrap_or(source);

        let tokens = tokenize(source).map_err(parse_error)?;
        if tokens.is_empty() {
            return Err(parse_error("empty expression".to_string()));
        }

        let mut parser = Self { tokens, position: 0 };
        let expr = parser.or().map_err(parse_error)?;
        if let Some(token) = parser.peek() {
            return Err(parse_error(format!("unexpected trailing {token:?}")));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut expr = self.and()?;
        while self.eat(&Token::Or) {
            expr = Expr::Or(Box::new(expr), Box::new(self.and()?));
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut expr = self.unary()?;
        while self.eat(&Token::And) {
            expr = Expr::And(Box::new(expr), Box::new(self.unary()?));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, String> {
        let left = self.primary()?;
        if self.eat(&Token::Eq) {
            Ok(Expr::Eq(Box::new(left), Box::new(self.primary()?)))
        } else if self.eat(&Token::Ne) {
            Ok(Expr::Ne(Box::new(left), Box::new(self.primary()?)))
        } else if self.eat(&Token::Matches) {
            match self.next() {
                Some(Token::Str(pattern)) => {
                    let regex = Regex::new(&pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
                    Ok(Expr::Matches(Box::new(left), regex))
                }
                other => Err(format!("'matches' expects a string pattern, got {other:?}")),
            }
        } else {
            Ok(left)
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::LParen) => {
                let expr = self.or()?;
                if self.eat(&Token::RParen) {
                    Ok(expr)
                } else {
                    Err("missing ')'".to_string())
                }
            }
            Some(Token::Reference(path)) => self.reference(&path).map(Expr::Reference),
            Some(token) => Err(format!("unexpected {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn reference(&mut self, path: &str) -> Result<Reference, String> {
        match path {
            "request.method" => Ok(Reference::Method),
            "request.path" => Ok(Reference::Path),
            "request.headers" | "context.attributes" => {
                let Some(Token::Index(key)) = self.next() else {
                    return Err(format!("#{path} needs a ['name'] index"));
                };
                Ok(if path == "request.headers" {
                    Reference::Header(key.to_ascii_lowercase())
                } else {
                    Reference::Attribute(key)
                })
            }
            _ => Err(format!("unknown reference #{path}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        let request = http::Request::builder()
            .method("GET")
            .uri("/api/v1/orders?page=2")
            .header("X-Api-Key", "secret")
            .body(())
            .unwrap();
        let mut ctx = ExecutionContext::new(request);
        ctx.set_attribute("plan", "gold");
        ctx.set_attribute("trusted", true);
        ctx
    }

    fn eval(condition: &str) -> Result<bool, ConditionError> {
        ExpressionConditionEvaluator::new().evaluate(condition, &ctx())
    }

    #[test]
    fn test_literals() {
        assert!(eval("true").unwrap());
        assert!(!eval("false").unwrap());
        assert!(!eval("{false}").unwrap());
        assert!(eval("  { true }  ").unwrap());
    }

    #[test]
    fn test_request_references() {
        assert!(eval("#request.method == 'GET'").unwrap());
        assert!(eval("#request.path == '/api/v1/orders'").unwrap());
        assert!(eval("#request.headers['x-api-key'] == 'secret'").unwrap());
        assert!(eval("#request.headers['X-API-KEY'] == 'secret'").unwrap());
        assert!(eval("#request.headers['missing'] != 'secret'").unwrap());
    }

    #[test]
    fn test_attributes() {
        assert!(eval("#context.attributes['plan'] == 'gold'").unwrap());
        assert!(eval("#context.attributes['trusted']").unwrap());
        assert!(!eval("#context.attributes['missing'] == 'gold'").unwrap());
    }

    #[test]
    fn test_boolean_operators() {
        assert!(eval("#request.method == 'GET' && !(#request.path == '/')").unwrap());
        assert!(eval("false || #request.method != 'POST'").unwrap());
        // && binds tighter than ||
        assert!(eval("true || false && false").unwrap());
        assert!(!eval("!true").unwrap());
    }

    #[test]
    fn test_matches() {
        assert!(eval("#request.path matches '^/api/v[0-9]+/'").unwrap());
        assert!(!eval("#request.headers['missing'] matches '.*'").unwrap());
    }

    #[test]
    fn test_string_escapes() {
        assert!(eval(r"'it\'s' == 'it\'s'").unwrap());
    }

    #[test]
    fn test_parse_errors() {
        for condition in [
            "",
            "{}",
            "#request.method ==",
            "#request.unknown == 'x'",
            "#request.headers == 'x'",
            "(true",
            "true false",
            "'unterminated",
            "#request.path matches '('",
            "#request.path matches #request.method",
            "maybe",
            "a = b",
        ] {
            assert!(
                matches!(eval(condition), Err(ConditionError::Parse { .. })),
                "expected parse error for {condition:?}"
            );
        }
    }

    #[test]
    fn test_non_boolean_result_is_evaluation_error() {
        assert!(matches!(
            eval("#request.method"),
            Err(ConditionError::Evaluate { .. })
        ));
        assert!(matches!(
            eval("!#context.attributes['plan']"),
            Err(ConditionError::Evaluate { .. })
        ));
    }

    #[test]
    fn test_parsed_expressions_are_cached() {
        let evaluator = ExpressionConditionEvaluator::new();
        let ctx = ctx();
        assert!(evaluator.evaluate("#request.method == 'GET'", &ctx).unwrap());
        assert!(evaluator.evaluate("#request.method == 'GET'", &ctx).unwrap());
        assert_eq!(evaluator.cache.len(), 1);
        assert!(evaluator.validate("#request.path matches '^/'").is_ok());
    }
}
