//! Dotted/indexed value paths and the three template reference forms.

use serde_json::Value;
use std::fmt;

use skillflow_core::{FlowError, NodeId, Result};

/// One step of a value path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Parse `a.b[0].c`, `items.0.name` or `[2]` into segments.
///
/// An empty string is the empty path (the whole value).
pub fn parse_path(path: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut key = String::new();

    let flush = |key: &mut String, segments: &mut Vec<Segment>| {
        if !key.is_empty() {
            segments.push(Segment::Key(std::mem::take(key)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if key.is_empty() && !matches!(segments.last(), Some(Segment::Index(_))) {
                    return Err(FlowError::Resolution(format!("empty segment in path '{path}'")));
                }
                flush(&mut key, &mut segments);
                if chars.peek().is_none() {
                    return Err(FlowError::Resolution(format!("path '{path}' ends with '.'")));
                }
            }
            '[' => {
                flush(&mut key, &mut segments);
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) => digits.push(d),
                        None => {
                            return Err(FlowError::Resolution(format!(
                                "unterminated index in path '{path}'"
                            )));
                        }
                    }
                }
                let idx = digits.trim().parse::<usize>().map_err(|_| {
                    FlowError::Resolution(format!("invalid index '[{digits}]' in path '{path}'"))
                })?;
                segments.push(Segment::Index(idx));
            }
            ']' => {
                return Err(FlowError::Resolution(format!("unexpected ']' in path '{path}'")));
            }
            other => key.push(other),
        }
    }
    flush(&mut key, &mut segments);
    Ok(segments)
}

/// Walk `segments` into `value`. Any missing step yields `None`.
///
/// A key segment that looks like a number also indexes arrays, so
/// `items.0` and `items[0]` are equivalent.
pub fn lookup<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = value;
    for seg in segments {
        current = match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(k)?,
            (Segment::Key(k), Value::Array(items)) => items.get(k.parse::<usize>().ok()?)?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Like [`lookup`] but a missing value becomes `null`.
pub fn lookup_or_null(value: &Value, segments: &[Segment]) -> Value {
    lookup(value, segments).cloned().unwrap_or(Value::Null)
}

pub fn display_path(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
            Segment::Index(i) => out.push_str(&format!("[{i}]")),
        }
    }
    out
}

// ── References ─────────────────────────────────────────────────

/// A template reference expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `$inputs.<path>`
    Input(Vec<Segment>),
    /// `@<node>.outputs.<path>`
    NodeOutput { node: NodeId, path: Vec<Segment> },
    /// `$loop.<name>.<path>`
    Loop { name: String, path: Vec<Segment> },
}

fn is_node_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl Reference {
    /// Classify a string. `None` means the string is a literal.
    ///
    /// A string that is recognisably a reference but has a malformed path
    /// is an error rather than a literal.
    pub fn parse(s: &str) -> Option<Result<Reference>> {
        if let Some(rest) = s.strip_prefix("$inputs") {
            let path = match rest.chars().next() {
                None => "",
                Some('.') => &rest[1..],
                Some('[') => rest,
                Some(_) => return None,
            };
            return Some(parse_path(path).map(Reference::Input));
        }
        if let Some(rest) = s.strip_prefix("$loop.") {
            let parsed = parse_path(rest).and_then(|segs| {
                let mut segs = segs.into_iter();
                match segs.next() {
                    Some(Segment::Key(name)) => Ok(Reference::Loop {
                        name,
                        path: segs.collect(),
                    }),
                    _ => Err(FlowError::Resolution(format!(
                        "loop reference '{s}' must start with a variable name"
                    ))),
                }
            });
            return Some(parsed);
        }
        if let Some(rest) = s.strip_prefix('@') {
            let id_len = rest.find(|c: char| !is_node_id_char(c)).unwrap_or(rest.len());
            if id_len == 0 {
                return None;
            }
            let (node, tail) = rest.split_at(id_len);
            let tail = tail.strip_prefix(".outputs")?;
            let path = match tail.chars().next() {
                None => "",
                Some('.') if tail.len() > 1 => &tail[1..],
                Some('[') => tail,
                Some(_) => return None,
            };
            let node = node.to_string();
            return Some(parse_path(path).map(|path| Reference::NodeOutput { node, path }));
        }
        None
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            Reference::NodeOutput { node, .. } => Some(node),
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |head: String, path: &[Segment]| {
            if path.is_empty() {
                head
            } else {
                format!("{head}.{}", display_path(path))
            }
        };
        match self {
            Reference::Input(path) => f.write_str(&join("$inputs".into(), path)),
            Reference::NodeOutput { node, path } => {
                f.write_str(&join(format!("@{node}.outputs"), path))
            }
            Reference::Loop { name, path } => f.write_str(&join(format!("$loop.{name}"), path)),
        }
    }
}

/// Collect every reference found in string leaves of a template.
pub fn template_references(template: &Value, out: &mut Vec<Result<Reference>>) {
    match template {
        Value::String(s) => {
            if let Some(r) = Reference::parse(s) {
                out.push(r);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| template_references(v, out)),
        Value::Object(map) => map.values().for_each(|v| template_references(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(k: &str) -> Segment {
        Segment::Key(k.into())
    }

    #[test]
    fn parses_mixed_paths() {
        assert_eq!(
            parse_path("a.b[2].c").unwrap(),
            vec![key("a"), key("b"), Segment::Index(2), key("c")]
        );
        assert_eq!(parse_path("[0]").unwrap(), vec![Segment::Index(0)]);
        assert!(parse_path("").unwrap().is_empty());
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a[x]").is_err());
        assert!(parse_path("a[1").is_err());
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let v = json!({"items": [{"name": "x"}, {"name": "y"}]});
        let segs = parse_path("items[1].name").unwrap();
        assert_eq!(lookup(&v, &segs), Some(&json!("y")));
        let segs = parse_path("items.0.name").unwrap();
        assert_eq!(lookup(&v, &segs), Some(&json!("x")));
        assert_eq!(lookup_or_null(&v, &parse_path("items[9]").unwrap()), Value::Null);
        assert_eq!(lookup_or_null(&v, &parse_path("nope.deeper").unwrap()), Value::Null);
    }

    #[test]
    fn classifies_reference_forms() {
        assert_eq!(
            Reference::parse("$inputs.url").unwrap().unwrap(),
            Reference::Input(vec![key("url")])
        );
        assert_eq!(
            Reference::parse("@fetch.outputs.body").unwrap().unwrap(),
            Reference::NodeOutput {
                node: "fetch".into(),
                path: vec![key("body")]
            }
        );
        assert_eq!(
            Reference::parse("@fetch.outputs").unwrap().unwrap(),
            Reference::NodeOutput {
                node: "fetch".into(),
                path: vec![]
            }
        );
        assert_eq!(
            Reference::parse("$loop.item.id").unwrap().unwrap(),
            Reference::Loop {
                name: "item".into(),
                path: vec![key("id")]
            }
        );
    }

    #[test]
    fn plain_strings_are_literals() {
        assert!(Reference::parse("hello").is_none());
        assert!(Reference::parse("@someone").is_none());
        assert!(Reference::parse("$inputsX").is_none());
        assert!(Reference::parse("user@example.com").is_none());
    }

    #[test]
    fn malformed_reference_is_error() {
        assert!(Reference::parse("$inputs.a[").unwrap().is_err());
        assert!(Reference::parse("$loop.[0]").unwrap().is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["$inputs.a.b[1]", "@n.outputs.x", "$loop.item"] {
            assert_eq!(Reference::parse(s).unwrap().unwrap().to_string(), s);
        }
    }

    #[test]
    fn collects_nested_references() {
        let t = json!({"a": "$inputs.x", "b": ["@n.outputs.y", "lit", 3]});
        let mut refs = Vec::new();
        template_references(&t, &mut refs);
        assert_eq!(refs.len(), 2);
    }
}
