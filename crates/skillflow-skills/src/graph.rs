//! Static validation of a skill graph and the execution plan derived from it.
//!
//! Everything here runs before a single node is launched. A cycle, a
//! dangling dependency, an inconsistent phase assignment or a reference to a
//! node that is not guaranteed to have finished is a [`FlowError::Graph`].

use std::collections::{BTreeSet, HashMap, HashSet};

use skillflow_core::{FlowError, NodeId, Result};

use crate::definition::{ConcurrencyMode, LoopType, NodeKind, SkillDefinition, SkillNode};
use crate::expr::Predicate;
use crate::path::{Reference, template_references};

/// Precomputed scheduling data for one skill version.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// All nodes in topological order (ties broken by declaration order).
    pub order: Vec<NodeId>,
    /// Nodes scheduled by the top-level scheduler, in topological order.
    pub top_level: Vec<NodeId>,
    /// Phases of top-level nodes. Sequential plans have one node per phase,
    /// full-parallel plans a single phase.
    pub phases: Vec<Vec<NodeId>>,
    pub mode: ConcurrencyMode,
    /// Concurrency cap declared by the skill, if any.
    pub max_parallel: Option<usize>,
    topo_index: HashMap<NodeId, usize>,
    dependents: HashMap<NodeId, Vec<NodeId>>,
    blocking: HashMap<NodeId, usize>,
    owner: HashMap<NodeId, NodeId>,
}

impl ExecutionPlan {
    /// Validate `def` and build its plan.
    pub fn build(def: &SkillDefinition) -> Result<Self> {
        let nodes = &def.graph.nodes;
        let by_id = index_nodes(nodes)?;

        for node in nodes {
            check_payload(node)?;
            for dep in &node.depends_on {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(FlowError::Graph(format!(
                        "node '{}' depends on unknown node '{dep}'",
                        node.id
                    )));
                }
            }
        }

        let order = topo_sort(nodes)?;
        let topo_index: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();

        let owner = embedded_owners(nodes, &by_id)?;
        let top_level: Vec<NodeId> =
            order.iter().filter(|id| !owner.contains_key(*id)).cloned().collect();

        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in nodes {
            for dep in &node.depends_on {
                dependents.entry(dep.clone()).or_default().push(node.id.clone());
            }
        }

        // Top-level nodes wait on top-level nodes only.
        for node in nodes.iter().filter(|n| !owner.contains_key(&n.id)) {
            if let Some(dep) = node.depends_on.iter().find(|d| owner.contains_key(*d)) {
                return Err(FlowError::Graph(format!(
                    "node '{}' depends on '{dep}', which only runs inside '{}'; depend on that node instead",
                    node.id, owner[dep]
                )));
            }
        }

        let before = guaranteed_before(nodes, &by_id, &owner, &order)?;
        check_references(nodes, &before, &owner)?;

        let phases = match def.graph.concurrency.mode {
            ConcurrencyMode::Sequential => top_level.iter().map(|id| vec![id.clone()]).collect(),
            ConcurrencyMode::FullParallel => vec![top_level.clone()],
            ConcurrencyMode::Phased => {
                check_phases(&def.graph.concurrency.phases, &top_level, &by_id, &owner)?
            }
        };

        if def.graph.concurrency.max_parallel == Some(0) {
            return Err(FlowError::Validation("concurrency.max_parallel must be at least 1".into()));
        }

        let blocking = blocking_weights(&top_level, &dependents);

        Ok(Self {
            order,
            top_level,
            phases,
            mode: def.graph.concurrency.mode,
            max_parallel: def.graph.concurrency.max_parallel,
            topo_index,
            dependents,
            blocking,
            owner,
        })
    }

    pub fn topo_index(&self, id: &str) -> usize {
        self.topo_index.get(id).copied().unwrap_or(usize::MAX)
    }

    /// Direct dependents of `id`.
    pub fn dependents(&self, id: &str) -> &[NodeId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every node reachable from `id` through dependents.
    pub fn transitive_dependents(&self, id: &str) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![id.to_string()];
        let mut out = Vec::new();
        while let Some(cur) = stack.pop() {
            for d in self.dependents(&cur) {
                if seen.insert(d.clone()) {
                    out.push(d.clone());
                    stack.push(d.clone());
                }
            }
        }
        out.sort_by_key(|n| self.topo_index(n));
        out
    }

    /// Number of top-level nodes transitively blocked by `id`.
    pub fn blocking_weight(&self, id: &str) -> usize {
        self.blocking.get(id).copied().unwrap_or(0)
    }

    /// Owning conditional/loop node of an embedded node.
    pub fn owner_of(&self, id: &str) -> Option<&str> {
        self.owner.get(id).map(String::as_str)
    }

    /// Sort a branch or body list into execution order.
    pub fn sorted(&self, list: &[NodeId]) -> Vec<NodeId> {
        let mut out = list.to_vec();
        out.sort_by_key(|id| self.topo_index(id));
        out
    }

    /// Embedded nodes owned (directly or not) by `owner`.
    pub fn members_of(&self, owner: &str) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .order
            .iter()
            .filter(|id| self.is_member_of(id, owner))
            .cloned()
            .collect();
        out.sort_by_key(|id| self.topo_index(id));
        out
    }

    /// Whether `id` runs inside `owner`, directly or through nested owners.
    pub fn is_member_of(&self, id: &str, owner: &str) -> bool {
        owned_by(&self.owner, id, owner)
    }
}

fn owned_by(owner: &HashMap<NodeId, NodeId>, id: &str, ancestor: &str) -> bool {
    let mut cur = owner.get(id);
    while let Some(o) = cur {
        if o == ancestor {
            return true;
        }
        cur = owner.get(o);
    }
    false
}

fn index_nodes(nodes: &[SkillNode]) -> Result<HashMap<&str, &SkillNode>> {
    let mut by_id = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if node.id.is_empty() {
            return Err(FlowError::Graph("node with empty id".into()));
        }
        if by_id.insert(node.id.as_str(), node).is_some() {
            return Err(FlowError::Graph(format!("duplicate node id '{}'", node.id)));
        }
    }
    Ok(by_id)
}

fn check_payload(node: &SkillNode) -> Result<()> {
    let bad = |msg: String| Err(FlowError::Graph(format!("node '{}': {msg}", node.id)));
    match &node.kind {
        NodeKind::ToolCall { server, tool } => {
            if server.is_empty() || tool.is_empty() {
                return bad("tool_call needs both server and tool".into());
            }
        }
        NodeKind::SkillCall { skill, .. } => {
            if skill.is_empty() {
                return bad("skill_call needs a skill id".into());
            }
        }
        NodeKind::Conditional { conditional } => {
            for branch in &conditional.branches {
                Predicate::parse(&branch.condition).map_err(|e| graph_err(&node.id, e))?;
            }
        }
        NodeKind::Loop { spec } => {
            if spec.max_iterations == 0 {
                return bad("loop max_iterations must be at least 1".into());
            }
            match spec.loop_type {
                LoopType::For => match spec.collection.as_deref().map(Reference::parse) {
                    Some(Some(Ok(_))) => {}
                    Some(Some(Err(e))) => return Err(graph_err(&node.id, e)),
                    _ => return bad("for loop needs a collection reference".into()),
                },
                LoopType::While => match &spec.condition {
                    Some(c) => {
                        Predicate::parse(c).map_err(|e| graph_err(&node.id, e))?;
                    }
                    None => return bad("while loop needs a condition".into()),
                },
                LoopType::ForRange => match &spec.range {
                    Some(r) if r.step != 0 => {}
                    Some(_) => return bad("for_range step must not be 0".into()),
                    None => return bad("for_range loop needs a range".into()),
                },
            }
            if spec.var == "index" {
                return bad("loop variable may not be named 'index'".into());
            }
        }
        NodeKind::Control => {}
    }
    if let Some(transform) = &node.parameter_transform {
        transform.check().map_err(|e| graph_err(&node.id, e))?;
    }
    Ok(())
}

fn graph_err(node: &str, e: FlowError) -> FlowError {
    FlowError::Graph(format!("node '{node}': {e}"))
}

/// Kahn's algorithm; among ready nodes the earliest declared goes first.
fn topo_sort(nodes: &[SkillNode]) -> Result<Vec<NodeId>> {
    let position: HashMap<&str, usize> =
        nodes.iter().enumerate().map(|(i, n)| (n.id.as_str(), i)).collect();
    let mut indegree: Vec<usize> = vec![0; nodes.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let unique: BTreeSet<&str> = node.depends_on.iter().map(String::as_str).collect();
        for dep in unique {
            let d = position[dep];
            indegree[i] += 1;
            children[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|i| indegree[*i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_first() {
        order.push(nodes[i].id.clone());
        for &c in &children[i] {
            indegree[c] -= 1;
            if indegree[c] == 0 {
                ready.insert(c);
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck: Vec<&str> = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, n)| n.id.as_str())
            .collect();
        return Err(FlowError::Graph(format!(
            "dependency cycle among nodes: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

/// Map each branch/body member to the node that owns it.
fn embedded_owners(
    nodes: &[SkillNode],
    by_id: &HashMap<&str, &SkillNode>,
) -> Result<HashMap<NodeId, NodeId>> {
    let mut owner: HashMap<NodeId, NodeId> = HashMap::new();
    for node in nodes {
        for list in node.embedded_lists() {
            for member in list {
                if !by_id.contains_key(member.as_str()) {
                    return Err(FlowError::Graph(format!(
                        "node '{}' embeds unknown node '{member}'",
                        node.id
                    )));
                }
                if member == &node.id {
                    return Err(FlowError::Graph(format!("node '{}' embeds itself", node.id)));
                }
                if owner.insert(member.clone(), node.id.clone()).is_some() {
                    return Err(FlowError::Graph(format!(
                        "node '{member}' is embedded more than once"
                    )));
                }
            }
        }
    }

    // Ownership chains must terminate at a top-level node.
    for start in owner.keys() {
        let mut seen = HashSet::new();
        let mut cur = start.as_str();
        while let Some(o) = owner.get(cur) {
            if !seen.insert(o.as_str()) {
                return Err(FlowError::Graph(format!(
                    "embedding cycle involving node '{start}'"
                )));
            }
            cur = o.as_str();
        }
    }
    Ok(owner)
}

/// For every node, the set of nodes guaranteed to be terminal before it starts.
fn guaranteed_before(
    nodes: &[SkillNode],
    by_id: &HashMap<&str, &SkillNode>,
    owner: &HashMap<NodeId, NodeId>,
    order: &[NodeId],
) -> Result<HashMap<NodeId, HashSet<NodeId>>> {
    // Owners are processed before their members; the embedding-cycle check
    // guarantees the depth computation terminates.
    let depth = |id: &str| {
        let mut d = 0;
        let mut cur = id;
        while let Some(o) = owner.get(cur) {
            d += 1;
            cur = o.as_str();
        }
        d
    };
    let topo: HashMap<&str, usize> =
        order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    let mut sequence: Vec<&SkillNode> = nodes.iter().collect();
    sequence.sort_by_key(|n| (depth(n.id.as_str()), topo[n.id.as_str()]));

    let mut before: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
    for node in sequence {
        let mut set = HashSet::new();
        let owner_before = owner.get(&node.id).map(|o| before.get(o).cloned().unwrap_or_default());

        for dep in &node.depends_on {
            if let (Some(o), Some(ob)) = (owner.get(&node.id), &owner_before) {
                let same_list = by_id[o.as_str()]
                    .embedded_lists()
                    .iter()
                    .any(|l| l.contains(dep) && l.contains(&node.id));
                if !same_list && !ob.contains(dep) {
                    return Err(FlowError::Graph(format!(
                        "node '{}' depends on '{dep}', which is not guaranteed to finish before '{o}' starts",
                        node.id
                    )));
                }
            }
            set.insert(dep.clone());
            if let Some(dep_before) = before.get(dep) {
                set.extend(dep_before.iter().cloned());
            }
        }
        if let Some(ob) = owner_before {
            set.extend(ob);
        }
        before.insert(node.id.clone(), set);
    }
    Ok(before)
}

fn check_references(
    nodes: &[SkillNode],
    before: &HashMap<NodeId, HashSet<NodeId>>,
    owner: &HashMap<NodeId, NodeId>,
) -> Result<()> {
    for node in nodes {
        let mut refs = Vec::new();
        template_references(&node.args_template, &mut refs);
        let mut parsed: Vec<Reference> = Vec::new();
        for r in refs {
            parsed.push(r.map_err(|e| graph_err(&node.id, e))?);
        }
        match &node.kind {
            NodeKind::Conditional { conditional } => {
                for branch in &conditional.branches {
                    let p = Predicate::parse(&branch.condition).map_err(|e| graph_err(&node.id, e))?;
                    parsed.extend(p.references().into_iter().cloned());
                }
            }
            NodeKind::Loop { spec } => {
                if let Some(c) = &spec.condition {
                    let p = Predicate::parse(c).map_err(|e| graph_err(&node.id, e))?;
                    // A while condition is re-checked after every pass, so it
                    // may read the loop's own body.
                    let own_body = |r: &Reference| {
                        spec.loop_type == LoopType::While
                            && r.node().is_some_and(|t| owned_by(owner, t, &node.id))
                    };
                    parsed.extend(p.references().into_iter().filter(|r| !own_body(r)).cloned());
                }
                if let Some(Some(Ok(r))) = spec.collection.as_deref().map(Reference::parse) {
                    parsed.push(r);
                }
            }
            _ => {}
        }

        let allowed = before.get(&node.id);
        for r in &parsed {
            if let Some(target) = r.node() {
                if !allowed.is_some_and(|set| set.contains(target)) {
                    return Err(FlowError::Graph(format!(
                        "node '{}' references '{r}' but does not depend on '{target}'",
                        node.id
                    )));
                }
            }
        }
    }
    Ok(())
}

fn check_phases(
    phases: &[Vec<NodeId>],
    top_level: &[NodeId],
    by_id: &HashMap<&str, &SkillNode>,
    owner: &HashMap<NodeId, NodeId>,
) -> Result<Vec<Vec<NodeId>>> {
    if phases.is_empty() {
        return Err(FlowError::Graph("phased concurrency declares no phases".into()));
    }
    let mut phase_of: HashMap<&str, usize> = HashMap::new();
    for (k, phase) in phases.iter().enumerate() {
        for id in phase {
            if !by_id.contains_key(id.as_str()) {
                return Err(FlowError::Graph(format!("phase {k} lists unknown node '{id}'")));
            }
            if owner.contains_key(id) {
                return Err(FlowError::Graph(format!(
                    "phase {k} lists '{id}', which only runs inside '{}'",
                    owner[id]
                )));
            }
            if phase_of.insert(id.as_str(), k).is_some() {
                return Err(FlowError::Graph(format!("node '{id}' is assigned to more than one phase")));
            }
        }
    }
    for id in top_level {
        let Some(&k) = phase_of.get(id.as_str()) else {
            return Err(FlowError::Graph(format!("node '{id}' is not assigned to any phase")));
        };
        for dep in &by_id[id.as_str()].depends_on {
            if let Some(&dk) = phase_of.get(dep.as_str()) {
                if dk > k {
                    return Err(FlowError::Graph(format!(
                        "node '{id}' in phase {k} depends on '{dep}' in later phase {dk}"
                    )));
                }
            }
        }
    }
    Ok(phases.to_vec())
}

fn blocking_weights(
    top_level: &[NodeId],
    dependents: &HashMap<NodeId, Vec<NodeId>>,
) -> HashMap<NodeId, usize> {
    let mut weights = HashMap::with_capacity(top_level.len());
    for id in top_level {
        let mut seen = HashSet::new();
        let mut stack = vec![id.as_str()];
        while let Some(cur) = stack.pop() {
            for d in dependents.get(cur).map(Vec::as_slice).unwrap_or(&[]) {
                if seen.insert(d.as_str()) {
                    stack.push(d.as_str());
                }
            }
        }
        weights.insert(id.clone(), seen.len());
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(nodes: serde_json::Value, concurrency: serde_json::Value) -> SkillDefinition {
        serde_json::from_value(json!({
            "id": "t",
            "graph": { "nodes": nodes, "concurrency": concurrency }
        }))
        .unwrap()
    }

    fn tool(id: &str, deps: &[&str]) -> serde_json::Value {
        json!({ "id": id, "kind": "tool_call", "server": "s", "tool": "t", "depends_on": deps })
    }

    fn seq() -> serde_json::Value {
        json!({ "mode": "sequential" })
    }

    #[test]
    fn topological_order_breaks_ties_by_declaration() {
        let d = def(
            json!([tool("c", &["a"]), tool("a", &[]), tool("b", &[]), tool("d", &["b", "c"])]),
            seq(),
        );
        let plan = ExecutionPlan::build(&d).unwrap();
        assert_eq!(plan.order, vec!["a", "b", "c", "d"]);
        assert_eq!(plan.phases.len(), 4);
    }

    #[test]
    fn cycle_is_graph_error() {
        let d = def(json!([tool("a", &["b"]), tool("b", &["a"]), tool("c", &[])]), seq());
        let err = ExecutionPlan::build(&d).unwrap_err();
        assert!(matches!(err, FlowError::Graph(ref m) if m.contains("cycle")));
    }

    #[test]
    fn self_dependency_is_cycle() {
        let d = def(json!([tool("a", &["a"])]), seq());
        assert!(matches!(ExecutionPlan::build(&d), Err(FlowError::Graph(_))));
    }

    #[test]
    fn dangling_dependency_is_graph_error() {
        let d = def(json!([tool("a", &["ghost"])]), seq());
        assert!(matches!(ExecutionPlan::build(&d), Err(FlowError::Graph(_))));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let d = def(json!([tool("a", &[]), tool("a", &[])]), seq());
        assert!(matches!(ExecutionPlan::build(&d), Err(FlowError::Graph(_))));
    }

    #[test]
    fn reference_without_dependency_rejected() {
        let mut b = tool("b", &[]);
        b["args_template"] = json!({ "x": "@a.outputs.y" });
        let d = def(json!([tool("a", &[]), b]), seq());
        let err = ExecutionPlan::build(&d).unwrap_err();
        assert!(err.to_string().contains("does not depend"));
    }

    #[test]
    fn transitive_reference_allowed() {
        let mut c = tool("c", &["b"]);
        c["args_template"] = json!({ "x": "@a.outputs.y" });
        let d = def(json!([tool("a", &[]), tool("b", &["a"]), c]), seq());
        assert!(ExecutionPlan::build(&d).is_ok());
    }

    #[test]
    fn phases_must_respect_dependencies() {
        let nodes = json!([tool("a", &[]), tool("b", &["a"])]);
        let bad = def(nodes.clone(), json!({ "mode": "phased", "phases": [["b"], ["a"]] }));
        assert!(matches!(ExecutionPlan::build(&bad), Err(FlowError::Graph(_))));

        let missing = def(nodes.clone(), json!({ "mode": "phased", "phases": [["a"]] }));
        assert!(matches!(ExecutionPlan::build(&missing), Err(FlowError::Graph(_))));

        let ok = def(nodes, json!({ "mode": "phased", "phases": [["a"], ["b"]], "max_parallel": 2 }));
        let plan = ExecutionPlan::build(&ok).unwrap();
        assert_eq!(plan.phases, vec![vec!["a".to_string()], vec!["b".to_string()]]);
        assert_eq!(plan.max_parallel, Some(2));
    }

    #[test]
    fn blocking_weights_count_transitive_dependents() {
        let d = def(
            json!([tool("a", &[]), tool("b", &["a"]), tool("c", &["b"]), tool("x", &[])]),
            json!({ "mode": "full_parallel" }),
        );
        let plan = ExecutionPlan::build(&d).unwrap();
        assert_eq!(plan.blocking_weight("a"), 2);
        assert_eq!(plan.blocking_weight("x"), 0);
        assert_eq!(plan.transitive_dependents("a"), vec!["b", "c"]);
        assert_eq!(plan.phases.len(), 1);
    }

    #[test]
    fn embedded_members_are_not_top_level() {
        let d = def(
            json!([
                tool("src", &[]),
                { "id": "loop", "kind": "loop", "depends_on": ["src"],
                  "loop": { "type": "for", "collection": "@src.outputs.items", "body": ["step"], "max_iterations": 10 } },
                { "id": "step", "kind": "tool_call", "server": "s", "tool": "t",
                  "args_template": { "v": "$loop.item", "from": "@src.outputs.meta" } },
                tool("after", &["loop"])
            ]),
            seq(),
        );
        let plan = ExecutionPlan::build(&d).unwrap();
        assert_eq!(plan.top_level, vec!["src", "loop", "after"]);
        assert_eq!(plan.owner_of("step"), Some("loop"));
        assert_eq!(plan.members_of("loop"), vec!["step"]);
    }

    #[test]
    fn top_level_cannot_depend_on_member() {
        let d = def(
            json!([
                { "id": "cond", "kind": "conditional",
                  "conditional": { "branches": [ { "condition": "true", "nodes": ["inner"] } ] } },
                tool("inner", &[]),
                tool("after", &["inner"])
            ]),
            seq(),
        );
        assert!(matches!(ExecutionPlan::build(&d), Err(FlowError::Graph(_))));
    }

    #[test]
    fn member_in_two_lists_rejected() {
        let d = def(
            json!([
                { "id": "cond", "kind": "conditional",
                  "conditional": { "branches": [ { "condition": "true", "nodes": ["inner"] } ],
                                   "default_branch": ["inner"] } },
                tool("inner", &[])
            ]),
            seq(),
        );
        assert!(matches!(ExecutionPlan::build(&d), Err(FlowError::Graph(_))));
    }

    #[test]
    fn while_condition_may_read_own_body() {
        let spin = |condition: &str| {
            json!({ "id": "spin", "kind": "loop",
                    "loop": { "type": "while", "condition": condition, "body": ["poll"], "max_iterations": 5 } })
        };
        let d = def(json!([spin("@poll.outputs.more == true"), tool("poll", &[])]), seq());
        let plan = ExecutionPlan::build(&d).unwrap();
        assert!(plan.is_member_of("poll", "spin"));

        // Nodes outside the body still need a dependency.
        let d = def(json!([spin("@other.outputs.more"), tool("poll", &[]), tool("other", &[])]), seq());
        assert!(matches!(ExecutionPlan::build(&d), Err(FlowError::Graph(_))));

        // A conditional's branch runs after its predicate, so it cannot be read.
        let d = def(
            json!([
                { "id": "cond", "kind": "conditional",
                  "conditional": { "branches": [ { "condition": "@inner.outputs.ok", "nodes": ["inner"] } ] } },
                tool("inner", &[])
            ]),
            seq(),
        );
        assert!(matches!(ExecutionPlan::build(&d), Err(FlowError::Graph(_))));
    }

    #[test]
    fn loop_payload_checks() {
        let d = def(
            json!([{ "id": "l", "kind": "loop",
                     "loop": { "type": "for_range", "range": { "end": 3, "step": 0 }, "body": [], "max_iterations": 5 } }]),
            seq(),
        );
        assert!(matches!(ExecutionPlan::build(&d), Err(FlowError::Graph(_))));

        let d = def(
            json!([{ "id": "l", "kind": "loop",
                     "loop": { "type": "while", "condition": "$inputs.x ==", "body": [], "max_iterations": 5 } }]),
            seq(),
        );
        assert!(matches!(ExecutionPlan::build(&d), Err(FlowError::Graph(_))));
    }

    #[test]
    fn zero_max_parallel_is_validation_error() {
        let d = def(json!([tool("a", &[])]), json!({ "mode": "full_parallel", "max_parallel": 0 }));
        assert!(matches!(ExecutionPlan::build(&d), Err(FlowError::Validation(_))));
    }
}
