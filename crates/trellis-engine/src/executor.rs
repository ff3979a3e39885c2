//! The query executor
//!
//! Drives an expression's clauses in source order against a provider. All
//! working state lives in a per-call [`ExecutionContext`]; the executor
//! itself only holds the provider and the rule registry and may be shared
//! freely.

use std::sync::Arc;

use trellis_core::ast::{Clause, Expression};
use trellis_core::result::QueryResult;
use trellis_core::rules::RuleRegistry;
use trellis_kube::{Provider, synthesise_rules};

use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::{create, match_phase, mutate, ret};

pub struct QueryExecutor {
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) rules: Arc<RuleRegistry>,
}

impl QueryExecutor {
    pub fn new(provider: Arc<dyn Provider>, rules: Arc<RuleRegistry>) -> Self {
        Self { provider, rules }
    }

    /// Build an executor whose registry extends the static table with rules
    /// synthesised from the cluster's OpenAPI schema.
    pub async fn with_discovered_rules(provider: Arc<dyn Provider>) -> Result<Self> {
        let mut registry = RuleRegistry::with_static_rules();
        let field_paths = provider.open_api_field_paths().await?;
        for rule in synthesise_rules(&field_paths, provider.as_ref()).await {
            registry.add_synthesised(rule);
        }
        Ok(Self::new(provider, Arc::new(registry)))
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    /// Execute an expression. `namespace` is an operator-provided scope that
    /// overrides any namespace written in the query. An `IN` context list
    /// runs the expression against each context's provider and merges the
    /// results (list-federation only).
    pub async fn execute(
        &self,
        expression: &Expression,
        namespace: Option<&str>,
    ) -> Result<QueryResult> {
        if expression.contexts.is_empty() {
            return self.execute_single(expression, namespace).await;
        }
        let mut merged = QueryResult::default();
        for context in &expression.contexts {
            let provider = self.provider.for_context(context).await?;
            let sibling = QueryExecutor::new(provider, Arc::clone(&self.rules));
            merged.merge(sibling.execute_single(expression, namespace).await?);
        }
        Ok(merged)
    }

    async fn execute_single(
        &self,
        expression: &Expression,
        namespace: Option<&str>,
    ) -> Result<QueryResult> {
        validate(expression)?;
        let mut ctx = ExecutionContext::new(namespace);
        for clause in &expression.clauses {
            match clause {
                Clause::Match(m) => match_phase::run(self, &mut ctx, m).await?,
                Clause::Set(s) => mutate::run_set(self, &mut ctx, s).await?,
                Clause::Delete(d) => mutate::run_delete(self, &mut ctx, d).await?,
                Clause::Create(c) => create::run(self, &mut ctx, c).await?,
                Clause::Return(r) => ret::run(&mut ctx, r)?,
            }
        }
        Ok(ctx.into_result())
    }
}

/// Every MATCH node must name a kind. CREATE nodes may omit it only when
/// they reference a node bound earlier; that is checked at create time.
fn validate(expression: &Expression) -> Result<()> {
    for clause in &expression.clauses {
        if let Clause::Match(m) = clause {
            for node in &m.nodes {
                if node.kind.is_empty() {
                    return Err(EngineError::MissingKind(node.name.clone()));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use trellis_kube::{MockProvider, ResourceSpec};
    use trellis_parser::parse;

    fn make_executor(provider: MockProvider) -> (QueryExecutor, MockProvider) {
        let handle = provider.clone();
        (
            QueryExecutor::new(Arc::new(provider), Arc::new(RuleRegistry::with_static_rules())),
            handle,
        )
    }

    fn deployment(name: &str, namespace: &str, labels: Value, replicas: i64) -> Value {
        json!({
            "metadata": {
                "name": name,
                "namespace": namespace,
                "uid": format!("uid-{name}"),
                "labels": labels.clone(),
            },
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": labels},
                "template": {"metadata": {"labels": labels}},
            }
        })
    }

    fn service(name: &str, namespace: &str, selector: Value) -> Value {
        json!({
            "metadata": {"name": name, "namespace": namespace, "uid": format!("uid-{name}")},
            "spec": {"selector": selector, "ports": [{"port": 8080}]},
        })
    }

    fn pod(name: &str, namespace: &str, image: &str) -> Value {
        json!({
            "metadata": {"name": name, "namespace": namespace, "uid": format!("uid-{name}")},
            "spec": {"containers": [{"name": "main", "image": image}]},
        })
    }

    #[tokio::test]
    async fn test_service_deployment_traversal() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("d1", "default", json!({"app": "x"}), 1));
        provider.insert("deployments", deployment("other", "default", json!({"app": "y"}), 1));
        provider.insert("services", service("s1", "default", json!({"app": "x"})));
        let (executor, _) = make_executor(provider);

        let expr = parse("MATCH (d:Deployment)->(s:Service) RETURN d.metadata.name, s.metadata.name").unwrap();
        let result = executor.execute(&expr, None).await.unwrap();

        assert_eq!(result.data["d"][0]["name"], json!("d1"));
        assert_eq!(result.data["s"][0]["name"], json!("s1"));
        assert_eq!(result.data["d"].as_array().unwrap().len(), 1);

        let edges = &result.graph.edges;
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from, "Deployment/d1");
        assert_eq!(edges[0].to, "Service/s1");
        assert_eq!(edges[0].edge_type, "SERVICE_EXPOSE_DEPLOYMENT");
    }

    #[tokio::test]
    async fn test_graph_nodes_unique_by_id() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("d1", "default", json!({"app": "x"}), 1));
        provider.insert("services", service("s1", "default", json!({"app": "x"})));
        provider.insert("services", service("s2", "default", json!({"app": "x"})));
        let (executor, _) = make_executor(provider);

        // d1 pairs with both services; its node must appear once.
        let expr = parse("MATCH (d:Deployment)->(s:Service) RETURN d").unwrap();
        let result = executor.execute(&expr, None).await.unwrap();
        let d_nodes: Vec<_> = result.graph.nodes.iter().filter(|n| n.id == "Deployment/d1").collect();
        assert_eq!(d_nodes.len(), 1);
        assert_eq!(result.graph.edges.len(), 2);
    }

    #[tokio::test]
    async fn test_where_filter_and_set() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("web", "default", json!({"app": "w"}), 3));
        provider.insert("deployments", deployment("db", "default", json!({"app": "d"}), 3));
        let (executor, handle) = make_executor(provider);

        let expr = parse(r#"MATCH (d:Deployment) WHERE d.metadata.name = "web" SET d.spec.replicas = 0"#).unwrap();
        executor.execute(&expr, None).await.unwrap();

        let stored = handle.stored("deployments");
        let web = stored.iter().find(|d| d["metadata"]["name"] == json!("web")).unwrap();
        let db = stored.iter().find(|d| d["metadata"]["name"] == json!("db")).unwrap();
        assert_eq!(web["spec"]["replicas"], json!(0));
        assert_eq!(db["spec"]["replicas"], json!(3));
    }

    #[tokio::test]
    async fn test_set_idempotent_under_noop_values() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("web", "default", json!({"app": "w"}), 3));
        let (executor, handle) = make_executor(provider);

        let expr = parse(r#"MATCH (d:Deployment) WHERE d.metadata.name = "web" SET d.spec.replicas = 0 RETURN d.spec.replicas"#).unwrap();
        let first = executor.execute(&expr, None).await.unwrap();
        let after_first = handle.stored("deployments");
        let second = executor.execute(&expr, None).await.unwrap();
        let after_second = handle.stored("deployments");

        assert_eq!(after_first, after_second);
        assert_eq!(first.data["d"][0]["replicas"], json!(0));
        assert_eq!(second.data["d"][0]["replicas"], json!(0));
    }

    #[tokio::test]
    async fn test_set_mirrors_into_later_clauses() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("web", "default", json!({"app": "w"}), 3));
        let (executor, _) = make_executor(provider);

        let expr = parse("MATCH (d:Deployment) SET d.spec.replicas = 5 RETURN d.spec.replicas").unwrap();
        let result = executor.execute(&expr, None).await.unwrap();
        assert_eq!(result.data["d"][0]["replicas"], json!(5));
    }

    #[tokio::test]
    async fn test_aggregation_count_and_rows() {
        let provider = MockProvider::new();
        provider.insert("pods", pod("p1", "default", "nginx"));
        provider.insert("pods", pod("p2", "default", "nginx"));
        provider.insert("pods", pod("p3", "default", "redis"));
        let (executor, _) = make_executor(provider);

        let expr = parse("MATCH (p:Pod) RETURN COUNT{p.spec.containers[0].image} AS n, p.spec.containers[0].image").unwrap();
        let result = executor.execute(&expr, None).await.unwrap();

        assert_eq!(result.data["aggregate"]["n"], json!(3));
        let rows = result.data["p"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        let images: Vec<&str> = rows.iter().map(|r| r["image"].as_str().unwrap()).collect();
        assert_eq!(images, vec!["nginx", "nginx", "redis"]);
        // Aggregates never write into node rows.
        assert!(rows.iter().all(|r| r.get("n").is_none()));
    }

    #[tokio::test]
    async fn test_aggregation_sum() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("a", "default", json!({"app": "a"}), 2));
        provider.insert("deployments", deployment("b", "default", json!({"app": "b"}), 3));
        let (executor, _) = make_executor(provider);

        let expr = parse("MATCH (d:Deployment) RETURN SUM{d.spec.replicas} AS total").unwrap();
        let result = executor.execute(&expr, None).await.unwrap();
        assert_eq!(result.data["aggregate"]["total"], json!(5));
    }

    #[tokio::test]
    async fn test_namespace_scoping_via_wildcard_rule() {
        let provider = MockProvider::new();
        provider.insert("namespaces", json!({"metadata": {"name": "prod"}}));
        provider.insert("namespaces", json!({"metadata": {"name": "dev"}}));
        provider.insert("pods", pod("in-prod", "prod", "nginx"));
        provider.insert("pods", pod("in-dev", "dev", "nginx"));
        let (executor, _) = make_executor(provider);

        let expr = parse(r#"MATCH (n:Namespace {name: "prod"})->(p:Pod) RETURN p.metadata.name"#).unwrap();
        let result = executor.execute(&expr, None).await.unwrap();

        let rows = result.data["p"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("in-prod"));
        assert_eq!(result.graph.edges[0].edge_type, "NamespaceHasResource");
    }

    #[tokio::test]
    async fn test_ambiguous_kind_fails_before_listing() {
        let mut provider = MockProvider::new();
        provider.add_spec(ResourceSpec {
            group: "extensions".to_string(),
            version: "v1beta1".to_string(),
            resource: "ingresses".to_string(),
            kind: "Ingress".to_string(),
            singular: "ingress".to_string(),
            short_names: vec!["ing".to_string()],
            namespaced: true,
        });
        let (executor, handle) = make_executor(provider);

        let expr = parse("MATCH (i:Ingresses) RETURN i").unwrap();
        let error = executor.execute(&expr, None).await.unwrap_err();
        match error {
            EngineError::Kube(trellis_kube::KubeError::AmbiguousKind { candidates, .. }) => {
                assert!(candidates.contains(&"ingresses.extensions".to_string()));
                assert!(candidates.contains(&"ingresses.networking.k8s.io".to_string()));
            }
            other => panic!("expected ambiguity error, got {other:?}"),
        }
        assert_eq!(handle.operation_counts().lists, 0);
    }

    #[tokio::test]
    async fn test_relationship_fixed_point_monotonic() {
        let provider = MockProvider::new();
        // Chain: one deployment owns one replicaset owns two pods; noise at
        // every level.
        provider.insert("deployments", deployment("web", "default", json!({"app": "w"}), 1));
        provider.insert("deployments", deployment("noise", "default", json!({"app": "n"}), 1));
        provider.insert(
            "replicasets",
            json!({"metadata": {"name": "web-rs", "namespace": "default", "uid": "uid-rs", "ownerReferences": [{"name": "web"}]}}),
        );
        provider.insert(
            "replicasets",
            json!({"metadata": {"name": "stray-rs", "namespace": "default", "uid": "uid-stray", "ownerReferences": [{"name": "gone"}]}}),
        );
        provider.insert(
            "pods",
            json!({"metadata": {"name": "web-1", "namespace": "default", "ownerReferences": [{"name": "web-rs"}]}}),
        );
        provider.insert(
            "pods",
            json!({"metadata": {"name": "web-2", "namespace": "default", "ownerReferences": [{"name": "web-rs"}]}}),
        );
        provider.insert(
            "pods",
            json!({"metadata": {"name": "stray", "namespace": "default", "ownerReferences": [{"name": "stray-rs"}]}}),
        );
        let (executor, _) = make_executor(provider);

        let expr = parse(
            r#"MATCH (d:Deployment {name: "web"})->(rs:ReplicaSet)->(p:Pod) RETURN p.metadata.name"#,
        )
        .unwrap();
        let result = executor.execute(&expr, None).await.unwrap();

        let names: Vec<&str> = result.data["p"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["name"].as_str().unwrap())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"web-1"));
        assert!(names.contains(&"web-2"));
    }

    #[tokio::test]
    async fn test_missing_rule_is_fatal() {
        let provider = MockProvider::new();
        provider.insert("configmaps", json!({"metadata": {"name": "cm", "namespace": "default"}}));
        provider.insert("nodes", json!({"metadata": {"name": "n1"}}));
        let (executor, _) = make_executor(provider);

        let expr = parse("MATCH (c:ConfigMap)->(n:Node) RETURN c").unwrap();
        assert!(matches!(
            executor.execute(&expr, None).await,
            Err(EngineError::NoRuleFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_node_without_kind_fails() {
        let (executor, _) = make_executor(MockProvider::new());
        let expr = parse("MATCH (d) RETURN d").unwrap();
        assert!(matches!(
            executor.execute(&expr, None).await,
            Err(EngineError::MissingKind(_))
        ));
    }

    #[tokio::test]
    async fn test_name_and_label_selectors_conflict() {
        let (executor, _) = make_executor(MockProvider::new());
        let expr = parse(r#"MATCH (p:Pod {name: "x", app: "y"}) RETURN p"#).unwrap();
        assert!(matches!(
            executor.execute(&expr, None).await,
            Err(EngineError::SelectorConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_create_standalone_from_template() {
        let (executor, handle) = make_executor(MockProvider::new());

        let expr = parse(
            r#"CREATE (d:Deployment { metadata: { name: "web", labels: { app: "web" } }, spec: { replicas: 2 } })"#,
        )
        .unwrap();
        let result = executor.execute(&expr, None).await.unwrap();

        let stored = handle.stored("deployments");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["metadata"]["name"], json!("web"));
        assert_eq!(stored[0]["metadata"]["namespace"], json!("default"));
        assert_eq!(stored[0]["apiVersion"], json!("apps/v1"));
        assert_eq!(stored[0]["kind"], json!("Deployment"));
        assert_eq!(stored[0]["spec"]["replicas"], json!(2));
        assert_eq!(result.created.len(), 1);
        assert_eq!(result.created[0].name, "web");
    }

    #[tokio::test]
    async fn test_create_service_for_deployment_with_defaults() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("web", "prod", json!({"app": "web"}), 2));
        let (executor, handle) = make_executor(provider);

        let expr = parse(r#"MATCH (d:Deployment {name: "web"}) CREATE (d)->(s:Service)"#).unwrap();
        let result = executor.execute(&expr, None).await.unwrap();

        let stored = handle.stored("services");
        assert_eq!(stored.len(), 1);
        let svc = &stored[0];
        // The created side inherits the matched side's name.
        assert_eq!(svc["metadata"]["name"], json!("web"));
        assert_eq!(svc["metadata"]["namespace"], json!("prod"));
        // Selector copied from the deployment's matchLabels.
        assert_eq!(svc["spec"]["selector"], json!({"app": "web"}));
        // Port defaulted to 80: the deployment template exposes none.
        assert_eq!(svc["spec"]["ports"][0]["port"], json!(80));
        // The deployment owns the service.
        let refs = svc["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs[0]["kind"], json!("Deployment"));
        assert_eq!(refs[0]["uid"], json!("uid-web"));
        assert_eq!(result.created[0].resource, "services");
    }

    #[tokio::test]
    async fn test_create_relationship_property_overrides_default_port() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("web", "prod", json!({"app": "web"}), 2));
        let (executor, handle) = make_executor(provider);

        let expr = parse(r#"MATCH (d:Deployment {name: "web"}) CREATE (d)-[r:EXPOSE {port: 8080}]->(s:Service)"#)
            .unwrap();
        executor.execute(&expr, None).await.unwrap();

        let stored = handle.stored("services");
        assert_eq!(stored[0]["spec"]["ports"][0]["port"], json!(8080));
    }

    #[tokio::test]
    async fn test_create_rejects_bound_and_unbound_extremes() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("web", "prod", json!({"app": "w"}), 1));
        provider.insert("services", service("svc", "prod", json!({"app": "w"})));
        let (executor, _) = make_executor(provider.clone());

        let expr = parse("MATCH (d:Deployment)->(s:Service) CREATE (d)->(s)").unwrap();
        assert!(matches!(
            executor.execute(&expr, None).await,
            Err(EngineError::BothSidesExist { .. })
        ));

        let (executor, _) = make_executor(provider);
        let expr = parse("CREATE (d:Deployment)->(s:Service)").unwrap();
        assert!(matches!(
            executor.execute(&expr, None).await,
            Err(EngineError::NeitherSideExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_standalone_on_bound_node_fails() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("web", "prod", json!({"app": "w"}), 1));
        let (executor, _) = make_executor(provider);

        let expr = parse(r#"MATCH (d:Deployment {name: "web"}) CREATE (d)"#).unwrap();
        assert!(matches!(
            executor.execute(&expr, None).await,
            Err(EngineError::NodeAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_resources_and_binding() {
        let provider = MockProvider::new();
        provider.insert("deployments", deployment("web", "prod", json!({"app": "w"}), 1));
        provider.insert("deployments", deployment("db", "prod", json!({"app": "d"}), 1));
        let (executor, handle) = make_executor(provider);

        let expr = parse(r#"MATCH (d:Deployment {name: "web"}) DELETE d"#).unwrap();
        executor.execute(&expr, None).await.unwrap();

        let stored = handle.stored("deployments");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["metadata"]["name"], json!("db"));
    }

    #[tokio::test]
    async fn test_dry_run_creates_nothing() {
        let provider = MockProvider::new();
        provider.set_dry_run(true);
        let (executor, handle) = make_executor(provider);

        let expr = parse(r#"CREATE (n:Namespace {name: "sandbox"})"#).unwrap();
        executor.execute(&expr, None).await.unwrap();

        assert!(handle.stored("namespaces").is_empty());
        assert_eq!(handle.operation_counts().creates, 1);
    }

    #[tokio::test]
    async fn test_operator_namespace_overrides_query() {
        let provider = MockProvider::new();
        provider.insert("pods", pod("a", "prod", "nginx"));
        provider.insert("pods", pod("b", "dev", "nginx"));
        let (executor, _) = make_executor(provider);

        let expr = parse(r#"MATCH (p:Pod {namespace: "dev"}) RETURN p.metadata.name"#).unwrap();
        let result = executor.execute(&expr, Some("prod")).await.unwrap();
        let rows = result.data["p"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("a"));
    }

    #[tokio::test]
    async fn test_multi_context_execution_merges_results() {
        let staging = Arc::new(MockProvider::new());
        staging.insert("pods", pod("staging-pod", "default", "nginx"));
        let prod = Arc::new(MockProvider::new());
        prod.insert("pods", pod("prod-pod", "default", "nginx"));

        let mut root = MockProvider::new();
        root.register_context("staging", Arc::clone(&staging));
        root.register_context("prod", Arc::clone(&prod));
        let (executor, _) = make_executor(root);

        let expr = parse("IN staging, prod MATCH (p:Pod) RETURN p.metadata.name").unwrap();
        let result = executor.execute(&expr, None).await.unwrap();
        let names: Vec<&str> = result.data["p"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["staging-pod", "prod-pod"]);
    }

    #[tokio::test]
    async fn test_synthesised_rule_links_custom_kind() {
        let mut provider = MockProvider::new();
        provider.add_spec(ResourceSpec {
            group: "example.com".to_string(),
            version: "v1".to_string(),
            resource: "widgets".to_string(),
            kind: "Widget".to_string(),
            singular: "widget".to_string(),
            short_names: vec![],
            namespaced: true,
        });
        let mut field_paths = std::collections::BTreeMap::new();
        field_paths.insert("widgets".to_string(), vec!["spec.deploymentName".to_string()]);
        provider.set_field_paths(field_paths);

        provider.insert(
            "widgets",
            json!({"metadata": {"name": "w1", "namespace": "default"}, "spec": {"deploymentName": "web"}}),
        );
        provider.insert("deployments", deployment("web", "default", json!({"app": "w"}), 1));
        provider.insert("deployments", deployment("other", "default", json!({"app": "o"}), 1));

        let executor = QueryExecutor::with_discovered_rules(Arc::new(provider)).await.unwrap();
        let expr = parse("MATCH (w:Widget)->(d:Deployment) RETURN d.metadata.name").unwrap();
        let result = executor.execute(&expr, None).await.unwrap();

        let rows = result.data["d"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("web"));
    }
}
