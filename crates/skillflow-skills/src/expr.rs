//! Predicate expressions for conditional branches and while-loops.
//!
//! ```text
//! expr    := or
//! or      := and ( ("||" | "or") and )*
//! and     := unary ( ("&&" | "and") unary )*
//! unary   := ("!" | "not") unary | compare
//! compare := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary )?
//! primary := "(" expr ")" | number | string | true | false | null | reference
//! ```
//!
//! A bare reference or literal is tested for truthiness: `null`, `false`,
//! `0`, `""`, `[]` and `{}` are false.

use serde_json::Value;
use std::cmp::Ordering;

use skillflow_core::{FlowError, Result};

use crate::path::Reference;
use crate::resolver::{ResolveContext, resolve_reference};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ref(Reference),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ref(String),
    Num(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CmpOp),
}

/// A parsed predicate, ready to evaluate against any [`ResolveContext`].
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    root: Expr,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            source,
        };
        let root = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, ctx: &dyn ResolveContext) -> Result<bool> {
        Ok(truthy(&eval(&self.root, ctx)?))
    }

    /// Every reference the predicate reads.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        collect_refs(&self.root, &mut out);
        out
    }
}

fn collect_refs<'a>(e: &'a Expr, out: &mut Vec<&'a Reference>) {
    match e {
        Expr::Literal(_) => {}
        Expr::Ref(r) => out.push(r),
        Expr::Not(inner) => collect_refs(inner, out),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Cmp(_, a, b) => {
            collect_refs(a, out);
            collect_refs(b, out);
        }
    }
}

/// JSON truthiness.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval(e: &Expr, ctx: &dyn ResolveContext) -> Result<Value> {
    Ok(match e {
        Expr::Literal(v) => v.clone(),
        Expr::Ref(r) => resolve_reference(r, ctx)?,
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, ctx)?)),
        Expr::And(a, b) => Value::Bool(truthy(&eval(a, ctx)?) && truthy(&eval(b, ctx)?)),
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, ctx)?) || truthy(&eval(b, ctx)?)),
        Expr::Cmp(op, a, b) => {
            let (l, r) = (eval(a, ctx)?, eval(b, ctx)?);
            Value::Bool(compare(*op, &l, &r))
        }
    })
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> bool {
    let ordering = match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        CmpOp::Eq => ordering.map_or_else(|| l == r, |o| o == Ordering::Equal),
        CmpOp::Ne => ordering.map_or_else(|| l != r, |o| o != Ordering::Equal),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

// ── Lexer ──────────────────────────────────────────────────────

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let err = |msg: String| FlowError::Validation(format!("invalid predicate '{src}': {msg}"));
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
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
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(err(format!("expected '{c}{c}'")));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let eq_next = chars.get(i + 1) == Some(&'=');
                let tok = match (c, eq_next) {
                    ('=', true) => Token::Op(CmpOp::Eq),
                    ('=', false) => return Err(err("use '==' for equality".into())),
                    ('!', true) => Token::Op(CmpOp::Ne),
                    ('!', false) => Token::Not,
                    ('<', true) => Token::Op(CmpOp::Le),
                    ('<', false) => Token::Op(CmpOp::Lt),
                    ('>', true) => Token::Op(CmpOp::Ge),
                    _ => Token::Op(CmpOp::Gt),
                };
                i += if eq_next { 2 } else { 1 };
                tokens.push(tok);
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string".into())),
                        Some('\\') => {
                            if let Some(&next) = chars.get(i + 1) {
                                s.push(next);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '$' | '@' => {
                let start = i;
                while i < chars.len() && !is_delimiter(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ref(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E')) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| err(format!("bad number '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(err(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '=' | '!' | '<' | '>' | '&' | '|')
}

// ── Parser ─────────────────────────────────────────────────────

struct Parser<'s> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'s str,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> FlowError {
        FlowError::Validation(format!("invalid predicate '{}': {msg}", self.source))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr> {
        let left = self.primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Cmp(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                other => Err(self.error(&format!("unknown identifier '{other}'"))),
            },
            Some(Token::Ref(text)) => match Reference::parse(&text) {
                Some(r) => Ok(Expr::Ref(r?)),
                None => Err(self.error(&format!("'{text}' is not a reference"))),
            },
            Some(_) => Err(self.error("unexpected token")),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticContext;
    use serde_json::json;

    fn ctx() -> StaticContext {
        StaticContext::new(json!({"mode": "fast", "count": 3, "tags": []}))
            .with_output("check", json!({"status": "ok", "code": 200, "items": [1, 2]}))
    }

    fn holds(src: &str) -> bool {
        Predicate::parse(src).unwrap().eval(&ctx()).unwrap()
    }

    #[test]
    fn comparisons() {
        assert!(holds("$inputs.count == 3"));
        assert!(holds("$inputs.count >= 3"));
        assert!(!holds("$inputs.count > 3"));
        assert!(holds("@check.outputs.status == 'ok'"));
        assert!(holds("@check.outputs.code != 500"));
        assert!(holds("\"a\" < \"b\""));
    }

    #[test]
    fn boolean_connectives_and_grouping() {
        assert!(holds("$inputs.mode == 'fast' && @check.outputs.code == 200"));
        assert!(holds("$inputs.mode == 'slow' || !($inputs.count < 1)"));
        assert!(holds("not $inputs.tags and $inputs.count"));
        assert!(!holds("($inputs.count == 3) && false"));
    }

    #[test]
    fn truthiness_of_bare_values() {
        assert!(holds("@check.outputs.items"));
        assert!(!holds("$inputs.tags"));
        assert!(!holds("$inputs.missing"));
        assert!(!holds("null"));
        assert!(!holds("0"));
    }

    #[test]
    fn mixed_type_ordering_is_false() {
        assert!(!holds("$inputs.mode < 3"));
        assert!(holds("$inputs.mode != 3"));
    }

    #[test]
    fn negative_numbers() {
        assert!(holds("-1 < 0"));
    }

    #[test]
    fn loop_reference_outside_loop_fails_at_eval() {
        let p = Predicate::parse("$loop.index < 3").unwrap();
        assert!(matches!(p.eval(&ctx()), Err(FlowError::Resolution(_))));
    }

    #[test]
    fn lists_references() {
        let p = Predicate::parse("@a.outputs.x == 1 && ($inputs.y || @b.outputs)").unwrap();
        let nodes: Vec<_> = p.references().iter().filter_map(|r| r.node()).collect();
        assert_eq!(nodes, vec!["a", "b"]);
    }

    #[test]
    fn rejects_malformed() {
        assert!(Predicate::parse("$inputs.a = 1").is_err());
        assert!(Predicate::parse("($inputs.a").is_err());
        assert!(Predicate::parse("foo").is_err());
        assert!(Predicate::parse("1 2").is_err());
        assert!(Predicate::parse("'open").is_err());
        assert!(Predicate::parse("").is_err());
    }
}
