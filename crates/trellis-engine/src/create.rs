//! CREATE evaluation
//!
//! Standalone nodes are created from their JSON template. A node created
//! through a relationship is filled in from the already-matched side using
//! the rule's criteria: the foreign side's field values are written into
//! the created template at the paired paths, with rule defaults covering
//! values the foreign resource lacks. The matched side becomes the owner
//! of the created resources.

use std::collections::HashSet;

use serde_json::{Value, json};

use trellis_core::ast::{CreateClause, NodePattern, Property};
use trellis_core::path;
use trellis_core::result::CreatedRef;
use trellis_kube::ResourceSpec;

use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::executor::QueryExecutor;
use crate::match_phase::resolve_rule;
use crate::owner_ref::attach_owner_references;

pub(crate) async fn run(
    executor: &QueryExecutor,
    ctx: &mut ExecutionContext,
    clause: &CreateClause,
) -> Result<()> {
    let relationship_nodes: HashSet<&str> = clause
        .relationships
        .iter()
        .flat_map(|r| [r.left_node.name.as_str(), r.right_node.name.as_str()])
        .collect();

    for node in &clause.nodes {
        if !relationship_nodes.contains(node.name.as_str()) {
            create_standalone(executor, ctx, node).await?;
        }
    }
    for relationship in &clause.relationships {
        let left = crate::match_phase::resolve_node(&clause.nodes, &relationship.left_node).clone();
        let right = crate::match_phase::resolve_node(&clause.nodes, &relationship.right_node).clone();
        create_from_relationship(executor, ctx, &left, &right, &relationship.properties).await?;
    }
    Ok(())
}

async fn create_standalone(
    executor: &QueryExecutor,
    ctx: &mut ExecutionContext,
    node: &NodePattern,
) -> Result<()> {
    if ctx.result_map.contains_key(&node.name) {
        return Err(EngineError::NodeAlreadyExists(node.name.clone()));
    }
    if node.kind.is_empty() {
        return Err(EngineError::MissingKind(node.name.clone()));
    }
    let spec = executor.provider.find_gvr(&node.kind).await?;
    let mut body = node.json_data.clone().unwrap_or_else(|| json!({}));
    let name = resolve_name(node, &mut body, None);
    let namespace = resolve_namespace(ctx, node, &body, &spec, None);
    finalise_body(&mut body, &spec, &name, namespace.as_deref());

    executor
        .provider
        .create_resource(&spec.resource, &name, namespace.as_deref(), body.clone())
        .await?;
    record_created(ctx, node, &spec, body, &name, namespace);
    Ok(())
}

async fn create_from_relationship(
    executor: &QueryExecutor,
    ctx: &mut ExecutionContext,
    left: &NodePattern,
    right: &NodePattern,
    rel_properties: &[Property],
) -> Result<()> {
    let left_bound = ctx.result_map.contains_key(&left.name);
    let right_bound = ctx.result_map.contains_key(&right.name);
    let (known, to_create) = match (left_bound, right_bound) {
        (true, true) => {
            return Err(EngineError::BothSidesExist {
                left: left.name.clone(),
                right: right.name.clone(),
            });
        }
        (false, false) => {
            return Err(EngineError::NeitherSideExists {
                left: left.name.clone(),
                right: right.name.clone(),
            });
        }
        (true, false) => (left, right),
        (false, true) => (right, left),
    };
    if to_create.kind.is_empty() {
        return Err(EngineError::MissingKind(to_create.name.clone()));
    }

    let created_spec = executor.provider.find_gvr(&to_create.kind).await?;
    let known_spec = ctx.spec(&known.name)?.clone();
    let rule = resolve_rule(&executor.rules, &created_spec, &known_spec)?;
    let created_is_a = rule.kind_a == created_spec.resource;
    let foreign_resources = ctx.resources(&known.name)?.clone();

    let mut body = to_create.json_data.clone().unwrap_or_else(|| json!({}));
    for (index, foreign) in foreign_resources.iter().enumerate() {
        for criterion in &rule.match_criteria {
            let (target, source) = if created_is_a {
                (&criterion.field_a, &criterion.field_b)
            } else {
                (&criterion.field_b, &criterion.field_a)
            };
            let target = concretise(target, index);
            let source_value = path::resolve_value(foreign, source)?;
            if !source_value.is_null() && target_absent(&body, &target)? {
                path::set_value(&mut body, &target, source_value, index)?;
            }
            for default in &criterion.default_props {
                let (target, source) = if created_is_a {
                    (&default.field_a, &default.field_b)
                } else {
                    (&default.field_b, &default.field_a)
                };
                let concrete = concretise(target, index);
                if !target_absent(&body, &concrete)? {
                    continue;
                }
                // A relationship property named like the target's leaf
                // overrides the rule default: `-[r:EXPOSE {port: 8080}]->`.
                let value = if let Some(property) =
                    rel_properties.iter().find(|p| p.key == leaf_segment(target))
                {
                    property.value.clone()
                } else if source.is_empty() {
                    default.default.clone()
                } else {
                    match path::resolve_value(foreign, source)? {
                        Value::Null => default.default.clone(),
                        found => found,
                    }
                };
                path::set_value(&mut body, &concrete, value, index)?;
            }
        }
    }

    let foreign_name = foreign_resources
        .first()
        .and_then(|r| r["metadata"]["name"].as_str());
    let name = resolve_name(to_create, &mut body, foreign_name);
    let foreign_namespace = foreign_resources
        .first()
        .and_then(|r| r["metadata"]["namespace"].as_str());
    let namespace = resolve_namespace(ctx, to_create, &body, &created_spec, foreign_namespace);
    finalise_body(&mut body, &created_spec, &name, namespace.as_deref());

    executor
        .provider
        .create_resource(&created_spec.resource, &name, namespace.as_deref(), body.clone())
        .await?;

    // Edges between the created resource and every foreign resource,
    // oriented dependent -> owner like MATCH emission.
    for foreign in &foreign_resources {
        let (from_kind, from_res, to_kind, to_res) = if created_is_a {
            (&created_spec.kind, &body, &known_spec.kind, foreign)
        } else {
            (&known_spec.kind, foreign, &created_spec.kind, &body)
        };
        let from = ctx.graph.add_resource(from_kind, from_res);
        let to = ctx.graph.add_resource(to_kind, to_res);
        if let (Some(from), Some(to)) = (from, to) {
            ctx.graph.add_edge(&from, &to, &rule.relationship_type);
        }
    }

    let created = CreatedRef {
        resource: created_spec.resource.clone(),
        name: name.clone(),
        namespace: namespace.clone(),
    };
    // The matched side owns what was created for it.
    if !executor.provider.dry_run() {
        attach_owner_references(
            executor.provider.as_ref(),
            &created,
            &known_spec.api_version(),
            &known_spec.kind,
            &foreign_resources,
        )
        .await?;
    }
    record_created(ctx, to_create, &created_spec, body, &name, namespace);
    Ok(())
}

/// Name preference: the foreign (match-side) resource's name, the node's
/// `name` property, the template's top-level `name` shorthand, the
/// template's `metadata.name`, then the node's own variable name. The
/// shorthand is removed from the body once consumed.
fn resolve_name(node: &NodePattern, body: &mut Value, foreign_name: Option<&str>) -> String {
    if let Some(name) = foreign_name {
        return name.to_string();
    }
    if let Some(name) = node.property("name").and_then(Value::as_str) {
        return name.to_string();
    }
    if let Some(name) = body.get("name").and_then(Value::as_str).map(str::to_string) {
        if let Some(map) = body.as_object_mut() {
            map.remove("name");
        }
        return name;
    }
    if let Some(name) = body["metadata"]["name"].as_str() {
        return name.to_string();
    }
    node.name.clone()
}

fn resolve_namespace(
    ctx: &ExecutionContext,
    node: &NodePattern,
    body: &Value,
    spec: &ResourceSpec,
    foreign_namespace: Option<&str>,
) -> Option<String> {
    if !spec.namespaced {
        return None;
    }
    ctx.namespace
        .clone()
        .or_else(|| body["metadata"]["namespace"].as_str().map(str::to_string))
        .or_else(|| {
            node.property("namespace")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| foreign_namespace.map(str::to_string))
        .or_else(|| Some("default".to_string()))
}

fn finalise_body(body: &mut Value, spec: &ResourceSpec, name: &str, namespace: Option<&str>) {
    if !body.is_object() {
        *body = json!({});
    }
    body["apiVersion"] = json!(spec.api_version());
    body["kind"] = json!(spec.kind);
    if !body["metadata"].is_object() {
        body["metadata"] = json!({});
    }
    body["metadata"]["name"] = json!(name);
    if let Some(namespace) = namespace {
        body["metadata"]["namespace"] = json!(namespace);
    }
}

fn record_created(
    ctx: &mut ExecutionContext,
    node: &NodePattern,
    spec: &ResourceSpec,
    body: Value,
    name: &str,
    namespace: Option<String>,
) {
    ctx.graph.add_resource(&spec.kind, &body);
    ctx.node_specs.insert(node.name.clone(), spec.clone());
    ctx.result_map.insert(node.name.clone(), vec![body]);
    ctx.created.push(CreatedRef {
        resource: spec.resource.clone(),
        name: name.to_string(),
        namespace,
    });
}

/// Replace `[]` markers with the concrete iteration index so both the
/// absence check and the write address the same element.
fn concretise(template_path: &str, index: usize) -> String {
    template_path.replace("[]", &format!("[{index}]"))
}

/// The final key of a path, brackets stripped: `$.spec.ports[].port` -> `port`.
fn leaf_segment(template_path: &str) -> &str {
    let leaf = template_path.rsplit('.').next().unwrap_or(template_path);
    leaf.trim_end_matches("[]").trim_end_matches("{}")
}

fn target_absent(body: &Value, target: &str) -> Result<bool> {
    Ok(path::resolve(body, target)?.is_absent())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concretise() {
        assert_eq!(
            concretise("$.spec.rules[].http.paths[].path", 2),
            "$.spec.rules[2].http.paths[2].path"
        );
    }

    #[test]
    fn test_leaf_segment() {
        assert_eq!(leaf_segment("$.spec.ports[].port"), "port");
        assert_eq!(leaf_segment("$.spec.selector"), "selector");
        assert_eq!(leaf_segment("$.metadata.labels{}"), "labels");
    }

    #[test]
    fn test_resolve_name_preference_order() {
        let mut node = NodePattern::new("svc", "Service");
        let mut body = json!({"name": "from-template", "metadata": {"name": "from-metadata"}});
        assert_eq!(resolve_name(&node, &mut body, Some("from-foreign")), "from-foreign");
        assert_eq!(resolve_name(&node, &mut body, None), "from-template");
        // The shorthand is consumed.
        assert!(body.get("name").is_none());
        assert_eq!(resolve_name(&node, &mut body, None), "from-metadata");

        node.properties.push(trellis_core::ast::Property {
            key: "name".to_string(),
            value: json!("from-property"),
        });
        assert_eq!(resolve_name(&node, &mut body, None), "from-property");

        let mut empty = json!({});
        let plain = NodePattern::new("svc", "Service");
        assert_eq!(resolve_name(&plain, &mut empty, None), "svc");
    }

    #[test]
    fn test_finalise_body_fills_identity() {
        let spec = ResourceSpec {
            group: "apps".to_string(),
            version: "v1".to_string(),
            resource: "deployments".to_string(),
            kind: "Deployment".to_string(),
            singular: "deployment".to_string(),
            short_names: vec![],
            namespaced: true,
        };
        let mut body = json!({"spec": {"replicas": 1}});
        finalise_body(&mut body, &spec, "web", Some("prod"));
        assert_eq!(body["apiVersion"], json!("apps/v1"));
        assert_eq!(body["kind"], json!("Deployment"));
        assert_eq!(body["metadata"]["name"], json!("web"));
        assert_eq!(body["metadata"]["namespace"], json!("prod"));
        assert_eq!(body["spec"]["replicas"], json!(1));
    }
}
