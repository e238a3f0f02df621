#[cfg(test)]
mod tests {
    use serde_json::json;
    use skillflow_core::{FlowError, VersionSpec};
    use skillflow_skills::*;

    fn pipeline() -> SkillDefinition {
        SkillDefinition::from_json(
            &json!({
                "id": "mirror",
                "name": "Mirror a page",
                "description": "Fetch a URL and store its body",
                "tags": ["web"],
                "inputs_schema": {
                    "type": "object",
                    "properties": { "url": { "type": "string" } },
                    "required": ["url"]
                },
                "graph": {
                    "nodes": [
                        { "id": "fetch", "kind": "tool_call", "server": "web", "tool": "fetch",
                          "args_template": { "url": "$inputs.url" },
                          "export_outputs": { "body": "$.body" } },
                        { "id": "save", "kind": "tool_call", "server": "fs", "tool": "write",
                          "depends_on": ["fetch"],
                          "args_template": { "data": "@fetch.outputs.body" },
                          "parameter_transform": { "engine": "template",
                                                   "expression": "{\"data\": \"<{{ value.data }}>\"}" } }
                    ],
                    "concurrency": { "mode": "sequential" }
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    // ── Definition + plan ──────────────────────────────────────

    mod plan {
        use super::*;

        #[test]
        fn test_pipeline_plans_in_order() {
            let def = pipeline();
            let plan = ExecutionPlan::build(&def).unwrap();
            assert_eq!(plan.order, vec!["fetch", "save"]);
            assert_eq!(plan.dependents("fetch"), ["save".to_string()]);
        }

        #[test]
        fn test_inputs_schema_enforced() {
            let def = pipeline();
            assert!(def.validate_inputs(&json!({"url": "http://a"})).is_ok());
            let err = def.validate_inputs(&json!({"url": 3})).unwrap_err();
            assert!(matches!(err, FlowError::Validation(_)));
            assert!(def.validate_inputs(&json!({})).is_err());
        }

        #[test]
        fn test_tool_descriptor_advertises_version() {
            let def = pipeline();
            let tool = def.tool_descriptor();
            assert_eq!(tool.name, "skill__mirror");
            assert!(tool.description.ends_with("[Skill v1]"));
            assert_eq!(tool.input_schema["required"], json!(["url"]));
        }
    }

    // ── Resolution ─────────────────────────────────────────────

    mod resolution {
        use super::*;

        #[test]
        fn test_resolve_then_transform() {
            let def = pipeline();
            let save = def.node("save").unwrap();
            let ctx = StaticContext::new(json!({"url": "http://a"}))
                .with_output("fetch", json!({"body": "hello"}));

            let resolved = resolve(&save.args_template, &ctx).unwrap();
            assert_eq!(resolved, json!({"data": "hello"}));

            let scope = TransformScope { inputs: ctx.inputs.clone(), loop_vars: json!({}) };
            let out = save.parameter_transform.as_ref().unwrap().apply(resolved, &scope).unwrap();
            assert_eq!(out, json!({"data": "<hello>"}));
        }

        #[test]
        fn test_predicate_over_outputs() {
            let ctx = StaticContext::new(json!({"limit": 3}))
                .with_output("count", json!({"n": 5}));
            let p = Predicate::parse("@count.outputs.n > $inputs.limit && !false").unwrap();
            assert!(p.eval(&ctx).unwrap());
            let q = Predicate::parse("@count.outputs.n == 4 || $inputs.limit != 3").unwrap();
            assert!(!q.eval(&ctx).unwrap());
        }
    }

    // ── Storage ────────────────────────────────────────────────

    mod storage {
        use super::*;

        #[tokio::test]
        async fn test_file_store_roundtrip_keeps_graph() {
            let dir = tempfile::tempdir().unwrap();
            let store = FileSkillStore::new(dir.path());
            store.save(pipeline()).await.unwrap();

            let loaded = store.load("mirror", VersionSpec::Latest).await.unwrap();
            assert_eq!(loaded.graph.nodes.len(), 2);
            assert_eq!(loaded.node("fetch").unwrap().export_outputs["body"], "$.body");
            assert!(ExecutionPlan::build(&loaded).is_ok());

            let found = store.list(Some("mirror"), &["web".into()]).await.unwrap();
            assert_eq!(found.len(), 1);
            assert!(store.list(None, &["ops".into()]).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_unknown_version_is_not_found() {
            let store = InMemorySkillStore::new();
            store.insert(pipeline());
            assert!(store.load("mirror", VersionSpec::Exact(1)).await.is_ok());
            assert!(matches!(
                store.load("mirror", VersionSpec::Exact(2)).await,
                Err(FlowError::SkillNotFound(_))
            ));
        }
    }
}
