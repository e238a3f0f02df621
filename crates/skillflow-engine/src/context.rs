//! Per-run mutable state seen by node execution.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use skillflow_core::{NodeId, RunId};
use skillflow_skills::{ResolveContext, TransformScope};

/// Inputs, recorded outputs and loop bindings of one run.
///
/// Cloning is cheap and shares the output map; loop scopes are per clone,
/// so a loop iteration pushes its bindings onto its own copy.
#[derive(Clone)]
pub struct ExecutionContext {
    run_id: RunId,
    inputs: Arc<Value>,
    outputs: Arc<RwLock<HashMap<NodeId, Arc<Value>>>>,
    /// Innermost scope last.
    loops: Vec<Arc<HashMap<String, Value>>>,
    /// Nesting depth of skill_call runs; the outermost run is 0.
    depth: usize,
    parent_run_id: Option<RunId>,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, inputs: Value) -> Self {
        Self {
            run_id,
            inputs: Arc::new(inputs),
            outputs: Arc::new(RwLock::new(HashMap::new())),
            loops: Vec::new(),
            depth: 0,
            parent_run_id: None,
        }
    }

    /// Fresh context for a nested skill run. Nothing is inherited except
    /// the depth counter and the parent link.
    pub fn child(&self, run_id: RunId, inputs: Value) -> Self {
        Self {
            depth: self.depth + 1,
            parent_run_id: Some(self.run_id),
            ..Self::new(run_id, inputs)
        }
    }

    /// Copy of this context with one more loop scope.
    pub fn with_loop(&self, bindings: HashMap<String, Value>) -> Self {
        let mut next = self.clone();
        next.loops.push(Arc::new(bindings));
        next
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn parent_run_id(&self) -> Option<RunId> {
        self.parent_run_id
    }

    /// Publish a node's output. Readers see either the old value or the
    /// whole new one.
    pub fn set_output(&self, node: &str, output: Value) {
        self.outputs.write().insert(node.to_string(), Arc::new(output));
    }

    pub fn output(&self, node: &str) -> Option<Arc<Value>> {
        self.outputs.read().get(node).cloned()
    }

    pub fn has_output(&self, node: &str) -> bool {
        self.outputs.read().contains_key(node)
    }

    /// Values a template transform may read besides the resolved value.
    pub fn transform_scope(&self) -> TransformScope {
        let mut flat = Map::new();
        for scope in &self.loops {
            for (k, v) in scope.iter() {
                flat.insert(k.clone(), v.clone());
            }
        }
        TransformScope {
            inputs: (*self.inputs).clone(),
            loop_vars: Value::Object(flat),
        }
    }
}

impl ResolveContext for ExecutionContext {
    fn inputs(&self) -> &Value {
        &self.inputs
    }

    fn node_output(&self, node: &str) -> Option<Arc<Value>> {
        self.output(node)
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
    use skillflow_skills::resolve;
    use uuid::Uuid;

    fn bindings(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn loop_scopes_shadow_and_share_outputs() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), json!({"n": 1}));
        let outer = ctx.with_loop(bindings(&[("item", json!("a")), ("index", json!(0))]));
        let inner = outer.with_loop(bindings(&[("item", json!("b"))]));

        assert_eq!(inner.loop_var("item"), Some(json!("b")));
        assert_eq!(inner.loop_var("index"), Some(json!(0)));
        assert!(!ctx.in_loop());

        inner.set_output("step", json!({"ok": true}));
        assert_eq!(ctx.output("step").as_deref(), Some(&json!({"ok": true})));

        let scope = inner.transform_scope();
        assert_eq!(scope.loop_vars, json!({"item": "b", "index": 0}));
    }

    #[test]
    fn child_inherits_nothing() {
        let parent = ExecutionContext::new(Uuid::new_v4(), json!({"secret": 1}));
        parent.set_output("a", json!(1));
        let child = parent.child(Uuid::new_v4(), json!({"x": 2}));

        assert_eq!(child.depth(), 1);
        assert_eq!(child.parent_run_id(), Some(parent.run_id()));
        assert!(!child.has_output("a"));
        assert_eq!(resolve(&json!("$inputs.secret"), &child).unwrap(), Value::Null);
    }
}
