//! Secondary parameter transforms applied after structural resolution.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use skillflow_core::{FlowError, Result};

use crate::jsonpath::JsonPath;
use crate::path::{lookup, parse_path};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformEngine {
    #[default]
    None,
    #[serde(alias = "jsonpath_ng")]
    Jsonpath,
    #[serde(alias = "jinja2")]
    Template,
}

/// `parameter_transform` block of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterTransform {
    #[serde(default)]
    pub engine: TransformEngine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Values visible to a template besides the resolved `value`.
#[derive(Debug, Clone, Default)]
pub struct TransformScope {
    pub inputs: Value,
    /// Flattened innermost-first loop bindings.
    pub loop_vars: Value,
}

impl ParameterTransform {
    pub fn jsonpath(expression: impl Into<String>) -> Self {
        Self {
            engine: TransformEngine::Jsonpath,
            expression: Some(expression.into()),
        }
    }

    pub fn template(expression: impl Into<String>) -> Self {
        Self {
            engine: TransformEngine::Template,
            expression: Some(expression.into()),
        }
    }

    /// Check the expression compiles without applying it.
    pub fn check(&self) -> Result<()> {
        match (self.engine, self.expression.as_deref()) {
            (TransformEngine::Jsonpath, Some(expr)) => JsonPath::compile(expr).map(|_| ()),
            (TransformEngine::Template, Some(expr)) => placeholders(expr).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Apply the transform to an already-resolved value.
    pub fn apply(&self, value: Value, scope: &TransformScope) -> Result<Value> {
        let Some(expr) = self.expression.as_deref() else {
            return Ok(value);
        };
        match self.engine {
            TransformEngine::None => Ok(value),
            TransformEngine::Jsonpath => Ok(JsonPath::compile(expr)?.extract(&value)),
            TransformEngine::Template => render(expr, value, scope),
        }
    }
}

/// Split a template into literal text and `{{ path }}` placeholders.
fn placeholders(template: &str) -> Result<Vec<(bool, &str)>> {
    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        parts.push((false, &rest[..open]));
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| {
            FlowError::Transform(format!("unterminated '{{{{' in template '{template}'"))
        })?;
        let path = after[..close].trim();
        if path.is_empty() {
            return Err(FlowError::Transform(format!("empty placeholder in template '{template}'")));
        }
        parts.push((true, path));
        rest = &after[close + 2..];
    }
    parts.push((false, rest));
    Ok(parts)
}

fn render(template: &str, value: Value, scope: &TransformScope) -> Result<Value> {
    let root = json!({
        "value": value,
        "inputs": scope.inputs,
        "loop": scope.loop_vars,
    });

    let mut out = String::new();
    for (is_placeholder, text) in placeholders(template)? {
        if !is_placeholder {
            out.push_str(text);
            continue;
        }
        let segments = parse_path(text).map_err(|e| FlowError::Transform(e.to_string()))?;
        match segments.first() {
            Some(crate::path::Segment::Key(k)) if matches!(k.as_str(), "value" | "inputs" | "loop") => {}
            _ => {
                return Err(FlowError::Transform(format!(
                    "placeholder '{text}' must start with value, inputs or loop"
                )));
            }
        }
        match lookup(&root, &segments) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
        }
    }

    let trimmed = out.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            return Ok(parsed);
        }
    }
    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> TransformScope {
        TransformScope {
            inputs: json!({"user": "ana"}),
            loop_vars: json!({"index": 2}),
        }
    }

    #[test]
    fn none_engine_passes_through() {
        let t = ParameterTransform::default();
        assert_eq!(t.apply(json!({"a": 1}), &scope()).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn jsonpath_extracts_from_resolved_value() {
        let t = ParameterTransform::jsonpath("$.items[*].id");
        let v = json!({"items": [{"id": 1}, {"id": 2}]});
        assert_eq!(t.apply(v, &scope()).unwrap(), json!([1, 2]));

        let single = ParameterTransform::jsonpath("$.items[0].id");
        assert_eq!(single.apply(json!({"items": [{"id": 7}]}), &scope()).unwrap(), json!(7));
    }

    #[test]
    fn template_renders_text() {
        let t = ParameterTransform::template("hello {{ inputs.user }} #{{loop.index}}: {{ value.msg }}");
        let out = t.apply(json!({"msg": "hi"}), &scope()).unwrap();
        assert_eq!(out, json!("hello ana #2: hi"));
    }

    #[test]
    fn template_producing_json_is_parsed() {
        let t = ParameterTransform::template(r#"{"query": "{{ value.q }}", "limit": {{ value.n }}}"#);
        let out = t.apply(json!({"q": "rust", "n": 5}), &scope()).unwrap();
        assert_eq!(out, json!({"query": "rust", "limit": 5}));
    }

    #[test]
    fn template_errors() {
        assert!(ParameterTransform::template("{{ value").check().is_err());
        let bad_root = ParameterTransform::template("{{ other.x }}");
        assert!(matches!(bad_root.apply(json!(1), &scope()), Err(FlowError::Transform(_))));
    }

    #[test]
    fn engine_aliases_deserialize() {
        let t: ParameterTransform =
            serde_json::from_value(json!({"engine": "jinja2", "expression": "{{ value }}"})).unwrap();
        assert_eq!(t.engine, TransformEngine::Template);
    }
}
