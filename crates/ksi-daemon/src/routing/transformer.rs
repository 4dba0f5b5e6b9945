//! Condition expressions and mapping templates for routing rules.
//!
//! Conditions are a restricted boolean language over the incoming envelope:
//! dotted field paths, literals, comparisons, `and`/`or`/`not`, parentheses.
//! `agent_id == 'abc' and result.kind == 'x'` is representative. Evaluation
//! is total over well-formed input; a type mismatch in an ordering
//! comparison is an evaluation error, which suppresses only the rule that
//! raised it.
//!
//! Mapping templates build the re-emitted `data`. A value that is exactly
//! `"{{path}}"` resolves to the raw JSON value at that dotted path (array
//! indices allowed, e.g. `result.choices.0`); `{{path}}` embedded in a
//! longer string interpolates; an unresolved path becomes `null`; anything
//! else passes through literally.

use serde_json::{Map, Value};

use ksi_core::envelope::EventContext;

// ── Condition expressions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed condition tree.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Field(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Op(CmpOp),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
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
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] as char != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(format!("unterminated string starting at byte {i}"));
                }
                tokens.push(Token::Str(src[start..j].to_string()));
                i = j + 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Eq));
                    i += 2;
                } else {
                    return Err("single '=' is not an operator; use '=='".to_string());
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    return Err("'!' is not an operator; use 'not'".to_string());
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let text = &src[start..i];
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number {text:?}"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &src[start..i];
                tokens.push(match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "none" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                });
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
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

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            Ok(Expr::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_cmp()
        }
    }

    fn parse_cmp(&mut self) -> Result<Expr, String> {
        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let right = self.parse_operand()?;
            Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
        } else {
            Ok(left)
        }
    }

    fn parse_operand(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Ident(path)) => Ok(Expr::Field(path)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

/// Parse a condition source string.
pub fn parse_condition(src: &str) -> Result<Expr, String> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err("empty condition".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!(
            "trailing tokens after expression at position {}",
            parser.pos
        ));
    }
    Ok(expr)
}

impl Expr {
    /// Evaluate against an envelope's data and context.
    pub fn eval(&self, data: &Value, ctx: &EventContext) -> Result<bool, String> {
        Ok(truthy(&self.value(data, ctx)?))
    }

    fn value(&self, data: &Value, ctx: &EventContext) -> Result<Value, String> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(path) => Ok(resolve_field(path, data, ctx)),
            Expr::Not(inner) => Ok(Value::Bool(!inner.eval(data, ctx)?)),
            Expr::And(l, r) => Ok(Value::Bool(l.eval(data, ctx)? && r.eval(data, ctx)?)),
            Expr::Or(l, r) => Ok(Value::Bool(l.eval(data, ctx)? || r.eval(data, ctx)?)),
            Expr::Cmp(op, l, r) => {
                let lv = l.value(data, ctx)?;
                let rv = r.value(data, ctx)?;
                compare(*op, &lv, &rv).map(Value::Bool)
            }
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, String> {
    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::Ne => Ok(!values_equal(left, right)),
        _ => {
            let ordering = if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
                a.partial_cmp(&b)
            } else if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
                Some(a.cmp(b))
            } else {
                None
            };
            let Some(ordering) = ordering else {
                return Err(format!(
                    "cannot order {left} against {right}"
                ));
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    // Numbers compare numerically so 1 == 1.0 holds.
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Resolve a condition variable: data fields first, then the agent/client
/// attribution from context.
fn resolve_field(path: &str, data: &Value, ctx: &EventContext) -> Value {
    if let Some(found) = lookup_path(data, path) {
        return found;
    }
    match path {
        "_agent_id" | "agent_id" => ctx
            .agent_id
            .as_ref()
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null),
        "_client_id" | "client_id" => ctx
            .client_id
            .as_ref()
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

// ── Mapping templates ────────────────────────────────────────────────────────

/// Look up a dotted path; numeric segments index arrays.
pub fn lookup_path(source: &Value, path: &str) -> Option<Value> {
    let mut current = source;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Render a mapping against the original event data.
pub fn render_mapping(mapping: &Value, source: &Value) -> Value {
    match mapping {
        Value::String(s) => render_template(s, source),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), render_mapping(v, source));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_mapping(v, source)).collect())
        }
        literal => literal.clone(),
    }
}

fn render_template(template: &str, source: &Value) -> Value {
    let trimmed = template.trim();
    // Whole-string template: substitute the raw JSON value.
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !inner.contains("{{") {
            return lookup_path(source, inner.trim()).unwrap_or(Value::Null);
        }
    }
    if !template.contains("{{") {
        return Value::String(template.to_string());
    }
    // Embedded templates interpolate as text.
    let mut out = String::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let path = after[..close].trim();
        match lookup_path(source, path) {
            Some(Value::String(s)) => out.push_str(&s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str("null"),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}
