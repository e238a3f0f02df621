//! Parameter Resolver: turns an `args_template` into concrete arguments.
//!
//! Resolution is a pure function of the template and a [`ResolveContext`].
//! Objects and arrays are walked element-wise; a string that is exactly one
//! reference expression is replaced wholesale by the referenced value; every
//! other value passes through unchanged.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use skillflow_core::{FlowError, Result};

use crate::path::{Reference, lookup_or_null};

/// Read-only view of a run's state, as seen by one node.
pub trait ResolveContext {
    /// The run's validated inputs.
    fn inputs(&self) -> &Value;

    /// Recorded output of a node, if it has one.
    fn node_output(&self, node: &str) -> Option<Arc<Value>>;

    /// Innermost binding of a loop variable. Outer loops are searched
    /// when the innermost scope does not bind `name`.
    fn loop_var(&self, name: &str) -> Option<Value>;

    /// Whether any loop scope is active.
    fn in_loop(&self) -> bool;
}

/// Resolve a single reference against `ctx`.
pub fn resolve_reference(reference: &Reference, ctx: &dyn ResolveContext) -> Result<Value> {
    match reference {
        Reference::Input(path) => Ok(lookup_or_null(ctx.inputs(), path)),
        Reference::NodeOutput { node, path } => {
            let output = ctx.node_output(node).ok_or_else(|| {
                FlowError::Resolution(format!("node '{node}' has no recorded output"))
            })?;
            Ok(lookup_or_null(&output, path))
        }
        Reference::Loop { name, path } => {
            if !ctx.in_loop() {
                return Err(FlowError::Resolution(format!(
                    "'{reference}' used outside of a loop"
                )));
            }
            let bound = ctx.loop_var(name).ok_or_else(|| {
                FlowError::Resolution(format!("loop variable '{name}' is not bound"))
            })?;
            Ok(lookup_or_null(&bound, path))
        }
    }
}

/// Resolve a whole template.
pub fn resolve(template: &Value, ctx: &dyn ResolveContext) -> Result<Value> {
    match template {
        Value::String(s) => match Reference::parse(s) {
            Some(reference) => resolve_reference(&reference?, ctx),
            None => Ok(template.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, ctx))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// A self-contained [`ResolveContext`] built from plain maps.
///
/// Used for predicate evaluation in tooling and throughout the tests.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    pub inputs: Value,
    pub outputs: HashMap<String, Arc<Value>>,
    /// Innermost scope last.
    pub loops: Vec<HashMap<String, Value>>,
}

impl StaticContext {
    pub fn new(inputs: Value) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn with_output(mut self, node: &str, output: Value) -> Self {
        self.outputs.insert(node.to_string(), Arc::new(output));
        self
    }

    pub fn with_loop(mut self, vars: &[(&str, Value)]) -> Self {
        self.loops.push(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        );
        self
    }
}

impl ResolveContext for StaticContext {
    fn inputs(&self) -> &Value {
        &self.inputs
    }

    fn node_output(&self, node: &str) -> Option<Arc<Value>> {
        self.outputs.get(node).cloned()
    }

    fn loop_var(&self, name: &str) -> Option<Value> {
        self.loops.iter().rev().find_map(|scope| scope.get(name).cloned())
    }

    fn in_loop(&self) -> bool {
        !self.loops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> StaticContext {
        StaticContext::new(json!({"url": "http://x", "ids": [4, 5]}))
            .with_output("fetch", json!({"body": "abc", "meta": {"len": 3}}))
    }

    #[test]
    fn resolves_node_output_into_args() {
        let t = json!({"data": "@fetch.outputs.body"});
        assert_eq!(resolve(&t, &ctx()).unwrap(), json!({"data": "abc"}));
    }

    #[test]
    fn resolves_nested_structures() {
        let t = json!({
            "target": "$inputs.url",
            "list": ["$inputs.ids[1]", "@fetch.outputs.meta.len", "literal", 7, null],
            "flag": true
        });
        assert_eq!(
            resolve(&t, &ctx()).unwrap(),
            json!({"target": "http://x", "list": [5, 3, "literal", 7, null], "flag": true})
        );
    }

    #[test]
    fn whole_reference_keeps_type() {
        assert_eq!(resolve(&json!("$inputs.ids"), &ctx()).unwrap(), json!([4, 5]));
        assert_eq!(
            resolve(&json!("@fetch.outputs"), &ctx()).unwrap(),
            json!({"body": "abc", "meta": {"len": 3}})
        );
    }

    #[test]
    fn missing_key_is_null_but_missing_node_is_error() {
        assert_eq!(resolve(&json!("@fetch.outputs.nope"), &ctx()).unwrap(), Value::Null);
        assert_eq!(resolve(&json!("$inputs.absent"), &ctx()).unwrap(), Value::Null);
        let err = resolve(&json!("@ghost.outputs.x"), &ctx()).unwrap_err();
        assert!(matches!(err, FlowError::Resolution(_)));
    }

    #[test]
    fn loop_reference_outside_loop_is_error() {
        let err = resolve(&json!({"x": "$loop.item"}), &ctx()).unwrap_err();
        assert!(matches!(err, FlowError::Resolution(_)));
    }

    #[test]
    fn inner_loop_shadows_outer() {
        let c = ctx()
            .with_loop(&[("item", json!("outer")), ("index", json!(0))])
            .with_loop(&[("item", json!({"id": 9})), ("index", json!(2))]);
        assert_eq!(resolve(&json!("$loop.item.id"), &c).unwrap(), json!(9));
        assert_eq!(resolve(&json!("$loop.index"), &c).unwrap(), json!(2));
        assert!(resolve(&json!("$loop.unbound"), &c).is_err());
    }

    #[test]
    fn resolution_is_idempotent() {
        let t = json!({"a": "$inputs.url", "b": ["@fetch.outputs.body"]});
        let c = ctx();
        assert_eq!(resolve(&t, &c).unwrap(), resolve(&t, &c).unwrap());
    }

    #[test]
    fn failed_node_placeholder_resolves_to_null() {
        let c = ctx().with_output("broken", Value::Null);
        assert_eq!(resolve(&json!("@broken.outputs.anything"), &c).unwrap(), Value::Null);
    }
}
