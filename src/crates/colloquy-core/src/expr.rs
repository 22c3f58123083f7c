//! Expression language for branch guards, while conditions, and set steps
//!
//! A deliberately small language over the active flow's slots:
//!
//! - literals: `"x"` / `'x'`, numbers, `true`, `false`, `null`
//! - slot references by bare identifier: `origin`, `guest_count`
//! - predicates: `is_set(slot)`, `is_empty(slot)`
//! - unary: `!` / `not`, numeric `-`
//! - binary: `==` `!=` `<` `<=` `>` `>=`, `&&`/`and`, `||`/`or`, `+` `-`
//! - parentheses
//!
//! Expressions are parsed once at compile time and cached in the compiled
//! node, so runtime evaluation never re-parses. A missing slot evaluates to
//! `null`; ordered comparisons against `null` are false rather than errors,
//! which keeps half-filled flows from crashing their own guards.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Expression parse failure (surfaced as a validation error at compile time)
#[derive(Debug, Error, PartialEq)]
#[error("invalid expression '{source_text}': {reason}")]
pub struct ExprError {
    /// The original expression text
    pub source_text: String,
    /// What went wrong
    pub reason: String,
}

/// A parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal JSON scalar
    Literal(Value),
    /// Active-flow slot reference
    Slot(String),
    /// `is_set(slot)`
    IsSet(String),
    /// `is_empty(slot)`
    IsEmpty(String),
    /// Logical or numeric negation
    Unary(UnaryOp, Box<Expr>),
    /// Binary operation
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
}

impl Expr {
    /// Parse an expression from text
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        Parser::new(input).parse()
    }

    /// Evaluate against a slot map; missing slots are `null`
    pub fn eval(&self, slots: &HashMap<String, Value>) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Slot(name) => slots.get(name).cloned().unwrap_or(Value::Null),
            Expr::IsSet(name) => {
                Value::Bool(slots.get(name).map(|v| !v.is_null()).unwrap_or(false))
            }
            Expr::IsEmpty(name) => {
                let empty = match slots.get(name) {
                    None => true,
                    Some(Value::Null) => true,
                    Some(Value::String(s)) => s.is_empty(),
                    Some(Value::Array(a)) => a.is_empty(),
                    Some(Value::Object(o)) => o.is_empty(),
                    Some(_) => false,
                };
                Value::Bool(empty)
            }
            Expr::Unary(op, inner) => {
                let v = inner.eval(slots);
                match op {
                    UnaryOp::Not => Value::Bool(!truthy(&v)),
                    UnaryOp::Neg => match as_number(&v) {
                        Some(n) => serde_json::json!(-n),
                        None => Value::Null,
                    },
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                match op {
                    // Short-circuit before evaluating the right side.
                    BinaryOp::And => {
                        let l = lhs.eval(slots);
                        if !truthy(&l) {
                            return Value::Bool(false);
                        }
                        return Value::Bool(truthy(&rhs.eval(slots)));
                    }
                    BinaryOp::Or => {
                        let l = lhs.eval(slots);
                        if truthy(&l) {
                            return Value::Bool(true);
                        }
                        return Value::Bool(truthy(&rhs.eval(slots)));
                    }
                    _ => {}
                }
                let l = lhs.eval(slots);
                let r = rhs.eval(slots);
                match op {
                    BinaryOp::Eq => Value::Bool(loose_eq(&l, &r)),
                    BinaryOp::Ne => Value::Bool(!loose_eq(&l, &r)),
                    BinaryOp::Lt => ordered(&l, &r, |o| o == std::cmp::Ordering::Less),
                    BinaryOp::Le => ordered(&l, &r, |o| o != std::cmp::Ordering::Greater),
                    BinaryOp::Gt => ordered(&l, &r, |o| o == std::cmp::Ordering::Greater),
                    BinaryOp::Ge => ordered(&l, &r, |o| o != std::cmp::Ordering::Less),
                    BinaryOp::Add => match (as_number(&l), as_number(&r)) {
                        (Some(a), Some(b)) => serde_json::json!(a + b),
                        _ => match (&l, &r) {
                            (Value::String(a), Value::String(b)) => {
                                Value::String(format!("{}{}", a, b))
                            }
                            _ => Value::Null,
                        },
                    },
                    BinaryOp::Sub => match (as_number(&l), as_number(&r)) {
                        (Some(a), Some(b)) => serde_json::json!(a - b),
                        _ => Value::Null,
                    },
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                }
            }
        }
    }

    /// Whether this expression is guaranteed to produce a boolean
    ///
    /// Used by the compiler to detect boolean branch guards missing an arm.
    pub fn is_boolean_shaped(&self) -> bool {
        matches!(
            self,
            Expr::IsSet(_)
                | Expr::IsEmpty(_)
                | Expr::Unary(UnaryOp::Not, _)
                | Expr::Binary(
                    BinaryOp::Eq
                        | BinaryOp::Ne
                        | BinaryOp::Lt
                        | BinaryOp::Le
                        | BinaryOp::Gt
                        | BinaryOp::Ge
                        | BinaryOp::And
                        | BinaryOp::Or,
                    _,
                    _
                )
        ) || matches!(self, Expr::Literal(Value::Bool(_)))
    }

    /// Render an evaluated value the way branch case keys are written
    pub fn stringify(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Null => "null".to_string(),
            other => other.to_string(),
        }
    }
}

/// Truthiness for guard positions
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    if l == r {
        return true;
    }
    // "4" == 4 across the string/number seam; NLU output is stringly.
    if let (Some(a), Some(b)) = (as_number(l), as_number(r)) {
        return a == b;
    }
    false
}

fn ordered(l: &Value, r: &Value, test: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    let ord = match (as_number(l), as_number(r)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (l, r) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    };
    Value::Bool(ord.map(&test).unwrap_or(false))
}

// --- tokenizer -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
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
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '=' | '!' | '<' | '>' | '&' | '|' | '+' | '-' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = match two.as_str() {
                    "==" | "!=" | "<=" | ">=" | "&&" | "||" => {
                        i += 2;
                        match two.as_str() {
                            "==" => "==",
                            "!=" => "!=",
                            "<=" => "<=",
                            ">=" => ">=",
                            "&&" => "&&",
                            _ => "||",
                        }
                    }
                    _ => {
                        i += 1;
                        match c {
                            '=' => return Err("single '=' is not an operator; use '=='".to_string()),
                            '!' => "!",
                            '<' => "<",
                            '>' => ">",
                            '+' => "+",
                            '-' => "-",
                            '&' | '|' => return Err(format!("incomplete operator '{}'", c)),
                            _ => unreachable!(),
                        }
                    }
                };
                tokens.push(Token::Op(op));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number '{}'", text))?;
                tokens.push(Token::Num(num));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

// --- parser ----------------------------------------------------------------

struct Parser {
    source_text: String,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            source_text: input.to_string(),
            tokens: Vec::new(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, ExprError> {
        self.tokens = tokenize(&self.source_text).map_err(|reason| self.err(reason))?;
        if self.tokens.is_empty() {
            return Err(self.err("empty expression".to_string()));
        }
        let expr = self.parse_or()?;
        if self.pos < self.tokens.len() {
            return Err(self.err(format!("trailing input at token {}", self.pos)));
        }
        Ok(expr)
    }

    fn err(&self, reason: String) -> ExprError {
        ExprError {
            source_text: self.source_text.clone(),
            reason,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        loop {
            let is_or = match self.peek() {
                Some(Token::Op("||")) => true,
                Some(Token::Ident(id)) if id == "or" => true,
                _ => break,
            };
            debug_assert!(is_or);
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let is_and = match self.peek() {
                Some(Token::Op("&&")) => true,
                Some(Token::Ident(id)) if id == "and" => true,
                _ => break,
            };
            debug_assert!(is_and);
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => Some(BinaryOp::Eq),
            Some(Token::Op("!=")) => Some(BinaryOp::Ne),
            Some(Token::Op("<")) => Some(BinaryOp::Lt),
            Some(Token::Op("<=")) => Some(BinaryOp::Le),
            Some(Token::Op(">")) => Some(BinaryOp::Gt),
            Some(Token::Op(">=")) => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.parse_additive()?;
            return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinaryOp::Add,
                Some(Token::Op("-")) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Op("!")) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Ident(id)) if id == "not" => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Op("-")) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(Expr::Literal(serde_json::json!(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.err("expected ')'".to_string())),
                }
            }
            Some(Token::Ident(id)) => match id.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "is_set" | "is_empty" => {
                    let is_set = id == "is_set";
                    if self.advance() != Some(Token::LParen) {
                        return Err(self.err(format!("{} requires a parenthesised slot name", id)));
                    }
                    let slot = match self.advance() {
                        Some(Token::Ident(slot)) => slot,
                        Some(Token::Str(slot)) => slot,
                        _ => return Err(self.err(format!("{} requires a slot name", id))),
                    };
                    if self.advance() != Some(Token::RParen) {
                        return Err(self.err("expected ')'".to_string()));
                    }
                    Ok(if is_set {
                        Expr::IsSet(slot)
                    } else {
                        Expr::IsEmpty(slot)
                    })
                }
                _ => Ok(Expr::Slot(id)),
            },
            other => Err(self.err(format!("unexpected token {:?}", other))),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Slot(s) => write!(f, "{}", s),
            Expr::IsSet(s) => write!(f, "is_set({})", s),
            Expr::IsEmpty(s) => write!(f, "is_empty({})", s),
            Expr::Unary(UnaryOp::Not, e) => write!(f, "!{}", e),
            Expr::Unary(UnaryOp::Neg, e) => write!(f, "-{}", e),
            Expr::Binary(op, l, r) => {
                let sym = match op {
                    BinaryOp::Eq => "==",
                    BinaryOp::Ne => "!=",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::And => "&&",
                    BinaryOp::Or => "||",
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                };
                write!(f, "({} {} {})", l, sym, r)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn slots(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_literals() {
        let s = HashMap::new();
        assert_eq!(Expr::parse("true").unwrap().eval(&s), json!(true));
        assert_eq!(Expr::parse("42").unwrap().eval(&s), json!(42.0));
        assert_eq!(Expr::parse("\"hi\"").unwrap().eval(&s), json!("hi"));
        assert_eq!(Expr::parse("'hi'").unwrap().eval(&s), json!("hi"));
        assert_eq!(Expr::parse("null").unwrap().eval(&s), Value::Null);
    }

    #[test]
    fn test_slot_reference_and_missing_slot() {
        let s = slots(&[("origin", json!("Madrid"))]);
        assert_eq!(Expr::parse("origin").unwrap().eval(&s), json!("Madrid"));
        assert_eq!(Expr::parse("destination").unwrap().eval(&s), Value::Null);
    }

    #[test]
    fn test_comparisons() {
        let s = slots(&[("count", json!(3))]);
        assert_eq!(Expr::parse("count < 5").unwrap().eval(&s), json!(true));
        assert_eq!(Expr::parse("count >= 3").unwrap().eval(&s), json!(true));
        assert_eq!(Expr::parse("count == 3").unwrap().eval(&s), json!(true));
        assert_eq!(Expr::parse("count != 3").unwrap().eval(&s), json!(false));
        // String/number seam: NLU output is often stringly.
        let s = slots(&[("count", json!("3"))]);
        assert_eq!(Expr::parse("count == 3").unwrap().eval(&s), json!(true));
    }

    #[test]
    fn test_null_comparisons_are_false() {
        let s = HashMap::new();
        assert_eq!(Expr::parse("missing < 5").unwrap().eval(&s), json!(false));
        assert_eq!(Expr::parse("missing > 5").unwrap().eval(&s), json!(false));
    }

    #[test]
    fn test_logical_operators_and_wordy_aliases() {
        let s = slots(&[("a", json!(true)), ("b", json!(false))]);
        assert_eq!(Expr::parse("a && b").unwrap().eval(&s), json!(false));
        assert_eq!(Expr::parse("a || b").unwrap().eval(&s), json!(true));
        assert_eq!(Expr::parse("a and b").unwrap().eval(&s), json!(false));
        assert_eq!(Expr::parse("a or b").unwrap().eval(&s), json!(true));
        assert_eq!(Expr::parse("not b").unwrap().eval(&s), json!(true));
        assert_eq!(Expr::parse("!b").unwrap().eval(&s), json!(true));
    }

    #[test]
    fn test_is_set_and_is_empty() {
        let s = slots(&[("origin", json!("Madrid")), ("notes", json!(""))]);
        assert_eq!(Expr::parse("is_set(origin)").unwrap().eval(&s), json!(true));
        assert_eq!(Expr::parse("is_set(destination)").unwrap().eval(&s), json!(false));
        assert_eq!(Expr::parse("is_empty(notes)").unwrap().eval(&s), json!(true));
        assert_eq!(Expr::parse("is_empty(origin)").unwrap().eval(&s), json!(false));
    }

    #[test]
    fn test_arithmetic() {
        let s = slots(&[("n", json!(2))]);
        assert_eq!(Expr::parse("n + 1").unwrap().eval(&s), json!(3.0));
        assert_eq!(Expr::parse("n - 3").unwrap().eval(&s), json!(-1.0));
        assert_eq!(Expr::parse("-n").unwrap().eval(&s), json!(-2.0));
    }

    #[test]
    fn test_parentheses_and_precedence() {
        let s = slots(&[("n", json!(2))]);
        assert_eq!(
            Expr::parse("n + 1 == 3 && n < 10").unwrap().eval(&s),
            json!(true)
        );
        assert_eq!(Expr::parse("(n + 1) - 1 == n").unwrap().eval(&s), json!(true));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("a = b").is_err());
        assert!(Expr::parse("(a").is_err());
        assert!(Expr::parse("\"unterminated").is_err());
        assert!(Expr::parse("a ==").is_err());
        assert!(Expr::parse("a b").is_err());
    }

    #[test]
    fn test_boolean_shaped_detection() {
        assert!(Expr::parse("a == b").unwrap().is_boolean_shaped());
        assert!(Expr::parse("is_set(a)").unwrap().is_boolean_shaped());
        assert!(Expr::parse("!a").unwrap().is_boolean_shaped());
        assert!(!Expr::parse("a").unwrap().is_boolean_shaped());
        assert!(!Expr::parse("a + 1").unwrap().is_boolean_shaped());
    }

    #[test]
    fn test_stringify_matches_case_keys() {
        assert_eq!(Expr::stringify(&json!(true)), "true");
        assert_eq!(Expr::stringify(&json!("madrid")), "madrid");
        assert_eq!(Expr::stringify(&json!(42)), "42");
        assert_eq!(Expr::stringify(&Value::Null), "null");
    }
}
