//! Path evaluator used for output extraction and `$(...)$` stamping tags.
//!
//! Accepts a small JSONPath subset: an optional `{...}` wrapper, an optional `$`
//! root, dot-separated field names, `[n]` indices and `['key']` / `["key"]`
//! bracketed keys (for keys containing dots, e.g. label names).

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    Parse,
    NotFound,
    TypeMismatch,
}

impl EvalErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::NotFound => "not_found",
            Self::TypeMismatch => "type_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("evaluate [{expression}]: {}: {detail}", .kind.as_str())]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub expression: String,
    pub detail: String,
}

impl EvalError {
    fn new(kind: EvalErrorKind, expression: &str, detail: impl Into<String>) -> Self {
        Self { kind, expression: expression.to_string(), detail: detail.into() }
    }
}

pub trait Evaluator: Send + Sync {
    fn evaluate_json_path(&self, expression: &str, document: &Value) -> Result<Value, EvalError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPathEvaluator;

impl Evaluator for JsonPathEvaluator {
    fn evaluate_json_path(&self, expression: &str, document: &Value) -> Result<Value, EvalError> {
        let segments = parse_path(expression)?;
        let mut cur = document;
        for seg in segments.iter() {
            cur = match (seg, cur) {
                (Segment::Key(k), Value::Object(map)) => map
                    .get(k)
                    .ok_or_else(|| EvalError::new(EvalErrorKind::NotFound, expression, format!("no field [{}]", k)))?,
                (Segment::Index(i), Value::Array(arr)) => arr
                    .get(*i)
                    .ok_or_else(|| EvalError::new(EvalErrorKind::NotFound, expression, format!("index [{}] out of range", i)))?,
                (Segment::Key(k), other) => {
                    return Err(EvalError::new(EvalErrorKind::TypeMismatch, expression, format!("field [{}] on {}", k, type_name(other))))
                }
                (Segment::Index(i), other) => {
                    return Err(EvalError::new(EvalErrorKind::TypeMismatch, expression, format!("index [{}] on {}", i, type_name(other))))
                }
            };
        }
        Ok(cur.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_path(expression: &str) -> Result<Vec<Segment>, EvalError> {
    let parse_err = |detail: &str| EvalError::new(EvalErrorKind::Parse, expression, detail);
    let mut s = expression.trim();
    if let Some(inner) = s.strip_prefix('{') {
        s = inner.strip_suffix('}').ok_or_else(|| parse_err("unbalanced braces"))?.trim();
    }
    s = s.strip_prefix('$').unwrap_or(s);
    if s.is_empty() {
        return Err(parse_err("empty path"));
    }

    let chars: Vec<char> = s.chars().collect();
    let mut out = Vec::new();
    let mut i = 0usize;
    // A leading bare key is allowed (`spec.foo`), as is a leading dot (`.spec.foo`).
    let mut expect_key = chars[0] != '.' && chars[0] != '[';
    while i < chars.len() {
        match chars[i] {
            '.' if !expect_key => {
                i += 1;
                expect_key = true;
            }
            '[' => {
                i += 1;
                match chars.get(i).copied() {
                    Some(quote @ ('\'' | '"')) => {
                        let start = i + 1;
                        let end = chars[start..].iter().position(|c| *c == quote).map(|p| p + start).ok_or_else(|| parse_err("unterminated quoted key"))?;
                        if chars.get(end + 1) != Some(&']') {
                            return Err(parse_err("expected ']' after quoted key"));
                        }
                        out.push(Segment::Key(chars[start..end].iter().collect()));
                        i = end + 2;
                    }
                    _ => {
                        let start = i;
                        let end = chars[start..].iter().position(|c| *c == ']').map(|p| p + start).ok_or_else(|| parse_err("unterminated index"))?;
                        let raw: String = chars[start..end].iter().collect();
                        let idx = raw.parse::<usize>().map_err(|_| parse_err("index must be a non-negative integer"))?;
                        out.push(Segment::Index(idx));
                        i = end + 1;
                    }
                }
                expect_key = false;
            }
            _ if expect_key => {
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    let c = chars[i];
                    if !(c.is_alphanumeric() || c == '_' || c == '-') {
                        return Err(parse_err("unsupported character in field name"));
                    }
                    i += 1;
                }
                if i == start {
                    return Err(parse_err("empty field name"));
                }
                out.push(Segment::Key(chars[start..i].iter().collect()));
                expect_key = false;
            }
            _ => return Err(parse_err("expected '.' or '['")),
        }
    }
    if expect_key {
        return Err(parse_err("trailing '.'"));
    }
    Ok(out)
}
