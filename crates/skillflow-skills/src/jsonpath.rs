//! A small JSONPath subset used by export paths and the `jsonpath` transform.
//!
//! Supported: `$`, `.key`, `['key']`, `["key"]`, `[n]`, `[-n]`, `[*]`, `.*`
//! and recursive descent `..key`.

use serde_json::Value;

use skillflow_core::{FlowError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(i64),
    Wildcard,
    Descend(String),
}

/// A compiled path query.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    steps: Vec<Step>,
}

impl JsonPath {
    /// Compile an expression. A leading `$` is optional; `body.items` is
    /// read as `$.body.items`.
    pub fn compile(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let err = |msg: &str| FlowError::Transform(format!("invalid jsonpath '{expr}': {msg}"));

        let mut rest = expr.strip_prefix('$').unwrap_or(expr);
        let mut steps = Vec::new();

        // Bare form: first key without a leading dot.
        if !rest.is_empty() && !rest.starts_with('.') && !rest.starts_with('[') {
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            steps.push(Step::Key(rest[..end].to_string()));
            rest = &rest[end..];
        }

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix("..") {
                let end = after.find(['.', '[']).unwrap_or(after.len());
                let key = &after[..end];
                if key.is_empty() {
                    return Err(err("'..' must be followed by a key"));
                }
                steps.push(Step::Descend(key.to_string()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(['.', '[']).unwrap_or(after.len());
                let key = &after[..end];
                match key {
                    "" => return Err(err("empty key")),
                    "*" => steps.push(Step::Wildcard),
                    k => steps.push(Step::Key(k.to_string())),
                }
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let close = after.find(']').ok_or_else(|| err("unterminated '['"))?;
                let inner = after[..close].trim();
                let step = if inner == "*" {
                    Step::Wildcard
                } else if let Some(quoted) = strip_quotes(inner) {
                    Step::Key(quoted.to_string())
                } else {
                    Step::Index(inner.parse::<i64>().map_err(|_| err("bad index"))?)
                };
                steps.push(step);
                rest = &after[close + 1..];
            } else {
                return Err(err("unexpected character"));
            }
        }
        Ok(Self { steps })
    }

    /// All matches, in document order.
    pub fn query<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![root];
        for step in &self.steps {
            let mut next = Vec::new();
            for v in current {
                match step {
                    Step::Key(k) => {
                        if let Some(child) = v.get(k.as_str()) {
                            next.push(child);
                        }
                    }
                    Step::Index(i) => {
                        if let Value::Array(items) = v {
                            let idx = if *i < 0 { items.len() as i64 + i } else { *i };
                            if let Some(child) = usize::try_from(idx).ok().and_then(|i| items.get(i)) {
                                next.push(child);
                            }
                        }
                    }
                    Step::Wildcard => match v {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                    Step::Descend(k) => descend(v, k, &mut next),
                }
            }
            current = next;
        }
        current
    }

    /// Zero matches → `null`, one → that value, many → an array.
    pub fn extract(&self, root: &Value) -> Value {
        let mut matches = self.query(root);
        match matches.len() {
            0 => Value::Null,
            1 => matches.remove(0).clone(),
            _ => Value::Array(matches.into_iter().cloned().collect()),
        }
    }
}

fn strip_quotes(s: &str) -> Option<&str> {
    s.strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
}

fn descend<'a>(v: &'a Value, key: &str, out: &mut Vec<&'a Value>) {
    match v {
        Value::Object(map) => {
            if let Some(hit) = map.get(key) {
                out.push(hit);
            }
            for child in map.values() {
                descend(child, key, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                descend(child, key, out);
            }
        }
        _ => {}
    }
}

/// Compile and extract in one step.
pub fn extract(root: &Value, expr: &str) -> Result<Value> {
    Ok(JsonPath::compile(expr)?.extract(root))
}
