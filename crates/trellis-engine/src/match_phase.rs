//! MATCH evaluation
//!
//! Relationships are processed in passes: each pass applies every rule and
//! narrows the working sets, and passes repeat until nothing narrows
//! further, bounded at `2 x |relationships|` iterations. Updates only ever
//! shrink a result set, so the fixed point converges. Nodes untouched by
//! any relationship are materialised afterwards.

use std::collections::HashSet;

use serde_json::Value;

use trellis_core::ast::{KeyValuePair, MatchClause, NodePattern};
use trellis_core::path;
use trellis_core::rules::{ComparisonType, RelationshipRule, RuleRegistry};
use trellis_kube::ResourceSpec;

use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::executor::QueryExecutor;
use crate::filter;

pub(crate) async fn run(
    executor: &QueryExecutor,
    ctx: &mut ExecutionContext,
    clause: &MatchClause,
) -> Result<()> {
    if !clause.relationships.is_empty() {
        let max_passes = 2 * clause.relationships.len();
        for _pass in 0..max_passes {
            let mut changed = false;
            for relationship in &clause.relationships {
                let left = resolve_node(&clause.nodes, &relationship.left_node);
                let right = resolve_node(&clause.nodes, &relationship.right_node);
                changed |= process_relationship(executor, ctx, clause, left, right).await?;
            }
            if !changed {
                break;
            }
        }
    }

    // Node-only phase: materialise whatever no relationship touched.
    for node in &clause.nodes {
        if ctx.result_map.contains_key(&node.name) {
            continue;
        }
        let resources = fetch_node(executor, ctx, node, &clause.extra_filters).await?;
        let spec = ctx.spec(&node.name)?.clone();
        for resource in &resources {
            ctx.graph.add_resource(&spec.kind, resource);
        }
        ctx.result_map.insert(node.name.clone(), resources);
    }
    Ok(())
}

/// Apply one relationship; returns whether any working set shrank.
async fn process_relationship(
    executor: &QueryExecutor,
    ctx: &mut ExecutionContext,
    clause: &MatchClause,
    left: &NodePattern,
    right: &NodePattern,
) -> Result<bool> {
    let left_spec = node_spec(executor, ctx, left).await?;
    let right_spec = node_spec(executor, ctx, right).await?;
    let rule = resolve_rule(&executor.rules, &left_spec, &right_spec)?;

    if !ctx.result_map.contains_key(&left.name) {
        let resources = fetch_node(executor, ctx, left, &clause.extra_filters).await?;
        ctx.result_map.insert(left.name.clone(), resources);
    }
    if !ctx.result_map.contains_key(&right.name) {
        let resources = fetch_node(executor, ctx, right, &clause.extra_filters).await?;
        ctx.result_map.insert(right.name.clone(), resources);
    }

    // Index the working sets by the rule's dependent/owner roles.
    let (node_a, spec_a, node_b, spec_b) = if rule.kind_a == left_spec.resource {
        (left, &left_spec, right, &right_spec)
    } else {
        (right, &right_spec, left, &left_spec)
    };
    let resources_a = ctx.resources(&node_a.name)?.clone();
    let resources_b = ctx.resources(&node_b.name)?.clone();
    let outcome = apply_rule(&rule, &resources_a, &resources_b);

    for (a, b) in &outcome.pairs {
        let from = ctx.graph.add_resource(&spec_a.kind, a);
        let to = ctx.graph.add_resource(&spec_b.kind, b);
        if let (Some(from), Some(to)) = (from, to) {
            ctx.graph.add_edge(&from, &to, &rule.relationship_type);
        }
    }

    // Monotonicity: overwrite only when the new list is strictly smaller.
    let mut changed = false;
    if outcome.matched_a.len() < resources_a.len() {
        ctx.result_map.insert(node_a.name.clone(), outcome.matched_a);
        changed = true;
    }
    if outcome.matched_b.len() < resources_b.len() {
        ctx.result_map.insert(node_b.name.clone(), outcome.matched_b);
        changed = true;
    }
    Ok(changed)
}

/// The rule linking two resolved kinds. A namespace on either side forces
/// the namespace-membership rule, with the wildcard bound to the other kind.
pub(crate) fn resolve_rule(
    rules: &RuleRegistry,
    left: &ResourceSpec,
    right: &ResourceSpec,
) -> Result<RelationshipRule> {
    if left.resource == "namespaces" || right.resource == "namespaces" {
        let base = rules.namespace_rule().ok_or_else(|| EngineError::NoRuleFound {
            left: left.resource.clone(),
            right: right.resource.clone(),
        })?;
        let other = if left.resource == "namespaces" { right } else { left };
        let mut rule = base.clone();
        rule.kind_b = other.resource.clone();
        // The wildcard rule reads namespaces as kind_a; keep it that way and
        // only bind the other side.
        return Ok(rule);
    }
    rules
        .find_by_kinds(&left.resource, &right.resource)
        .cloned()
        .ok_or_else(|| EngineError::NoRuleFound {
            left: left.resource.clone(),
            right: right.resource.clone(),
        })
}

/// Resolve a node's spec, caching it on the context. A node mentioned
/// without a kind must already be bound by an earlier clause.
pub(crate) async fn node_spec(
    executor: &QueryExecutor,
    ctx: &mut ExecutionContext,
    node: &NodePattern,
) -> Result<ResourceSpec> {
    if let Some(spec) = ctx.node_specs.get(&node.name) {
        return Ok(spec.clone());
    }
    if node.kind.is_empty() {
        return Err(EngineError::MissingKind(node.name.clone()));
    }
    let spec = executor.provider.find_gvr(&node.kind).await?;
    ctx.node_specs.insert(node.name.clone(), spec.clone());
    Ok(spec)
}

/// Prefer the clause's merged node (it carries the kind and body of every
/// mention) over the relationship's own copy.
pub(crate) fn resolve_node<'a>(nodes: &'a [NodePattern], node: &'a NodePattern) -> &'a NodePattern {
    nodes.iter().find(|n| n.name == node.name).unwrap_or(node)
}

/// List a node's resources: properties partition into a field selector
/// (name), a label selector (everything else), and a namespace override.
/// Listings are cached by fingerprint; extra WHERE filters for this node
/// are applied to the outcome.
pub(crate) async fn fetch_node(
    executor: &QueryExecutor,
    ctx: &mut ExecutionContext,
    node: &NodePattern,
    extra_filters: &[KeyValuePair],
) -> Result<Vec<Value>> {
    let spec = node_spec(executor, ctx, node).await?;

    let mut name_selector: Option<String> = None;
    let mut labels: Vec<String> = Vec::new();
    let mut namespace_override: Option<String> = None;
    for property in &node.properties {
        let text = filter::string_form(&property.value);
        match property.key.as_str() {
            "name" | "metadata.name" => name_selector = Some(format!("metadata.name={text}")),
            "namespace" | "metadata.namespace" => namespace_override = Some(text),
            _ => labels.push(format!("{}={text}", property.key)),
        }
    }
    if name_selector.is_some() && !labels.is_empty() {
        return Err(EngineError::SelectorConflict(node.name.clone()));
    }
    // An operator-provided namespace overrides the pattern's.
    let namespace = ctx.namespace.clone().or(namespace_override);
    labels.sort();
    let label_selector = (!labels.is_empty()).then(|| labels.join(","));

    let fingerprint = format!(
        "{}/{}/{}/{}",
        namespace.as_deref().unwrap_or(""),
        spec.resource,
        name_selector.as_deref().unwrap_or(""),
        label_selector.as_deref().unwrap_or("")
    );
    let resources = if let Some(cached) = ctx.result_cache.get(&fingerprint) {
        cached.clone()
    } else {
        let listed = executor
            .provider
            .get_resources(
                &spec.resource,
                name_selector.as_deref(),
                label_selector.as_deref(),
                namespace.as_deref(),
            )
            .await?;
        ctx.result_cache.insert(fingerprint, listed.clone());
        listed
    };

    Ok(resources
        .into_iter()
        .filter(|resource| {
            extra_filters.iter().all(|f| {
                let (node_name, resource_path) = f.split_key();
                node_name != node.name || filter::evaluate(resource, resource_path, f)
            })
        })
        .collect())
}

pub(crate) struct RuleOutcome {
    pub matched_a: Vec<Value>,
    pub matched_b: Vec<Value>,
    /// Every matched `(a, b)` pair, for graph emission.
    pub pairs: Vec<(Value, Value)>,
}

/// Evaluate a rule over the cartesian product of the two working sets.
pub(crate) fn apply_rule(
    rule: &RelationshipRule,
    resources_a: &[Value],
    resources_b: &[Value],
) -> RuleOutcome {
    let mut outcome = RuleOutcome {
        matched_a: Vec::new(),
        matched_b: Vec::new(),
        pairs: Vec::new(),
    };
    let mut seen_a = HashSet::new();
    let mut seen_b = HashSet::new();
    for a in resources_a {
        for b in resources_b {
            if !criteria_match(rule, a, b) {
                continue;
            }
            outcome.pairs.push((a.clone(), b.clone()));
            if seen_a.insert(dedup_key(a)) {
                outcome.matched_a.push(a.clone());
            }
            if seen_b.insert(dedup_key(b)) {
                outcome.matched_b.push(b.clone());
            }
        }
    }
    outcome
}

fn criteria_match(rule: &RelationshipRule, a: &Value, b: &Value) -> bool {
    rule.match_criteria.iter().all(|criterion| {
        let value_a = path::resolve_value(a, &criterion.field_a).unwrap_or(Value::Null);
        let value_b = path::resolve_value(b, &criterion.field_b).unwrap_or(Value::Null);
        match criterion.comparison_type {
            ComparisonType::ExactMatch => path::fields_match(&value_a, &value_b),
            ComparisonType::ContainsAll => match (value_a.as_object(), value_b.as_object()) {
                (Some(labels), Some(wanted)) => path::contains_all(labels, wanted),
                _ => false,
            },
        }
    })
}

fn dedup_key(resource: &Value) -> String {
    resource["metadata"]["name"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| resource.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::rules::MatchCriterion;

    fn ownership_rule() -> RelationshipRule {
        RelationshipRule::new(
            "pods",
            "replicasets",
            "REPLICASET_OWN_POD",
            vec![MatchCriterion::exact(
                "$.metadata.ownerReferences[].name",
                "$.metadata.name",
            )],
        )
    }

    #[test]
    fn test_apply_rule_owner_reference() {
        let pods = vec![
            json!({"metadata": {"name": "web-1", "ownerReferences": [{"name": "web-rs"}]}}),
            json!({"metadata": {"name": "stray", "ownerReferences": [{"name": "other-rs"}]}}),
        ];
        let replicasets = vec![json!({"metadata": {"name": "web-rs"}})];
        let outcome = apply_rule(&ownership_rule(), &pods, &replicasets);
        assert_eq!(outcome.matched_a.len(), 1);
        assert_eq!(outcome.matched_a[0]["metadata"]["name"], json!("web-1"));
        assert_eq!(outcome.matched_b.len(), 1);
        assert_eq!(outcome.pairs.len(), 1);
    }

    #[test]
    fn test_apply_rule_contains_all() {
        let rule = RelationshipRule::new(
            "deployments",
            "services",
            "SERVICE_EXPOSE_DEPLOYMENT",
            vec![MatchCriterion::contains_all(
                "$.spec.selector.matchLabels",
                "$.spec.selector",
            )],
        );
        let deployments = vec![
            json!({"metadata": {"name": "d1"}, "spec": {"selector": {"matchLabels": {"app": "x", "tier": "web"}}}}),
            json!({"metadata": {"name": "d2"}, "spec": {"selector": {"matchLabels": {"app": "y"}}}}),
        ];
        let services = vec![json!({"metadata": {"name": "s1"}, "spec": {"selector": {"app": "x"}}})];
        let outcome = apply_rule(&rule, &deployments, &services);
        assert_eq!(outcome.matched_a.len(), 1);
        assert_eq!(outcome.matched_a[0]["metadata"]["name"], json!("d1"));
    }

    #[test]
    fn test_apply_rule_no_match_yields_empty_sets() {
        let pods = vec![json!({"metadata": {"name": "p"}})];
        let replicasets = vec![json!({"metadata": {"name": "rs"}})];
        let outcome = apply_rule(&ownership_rule(), &pods, &replicasets);
        assert!(outcome.matched_a.is_empty());
        assert!(outcome.matched_b.is_empty());
        assert!(outcome.pairs.is_empty());
    }

    #[test]
    fn test_apply_rule_deduplicates_matches() {
        // One pod owned by a replicaset matched twice keeps one entry.
        let pods = vec![json!({
            "metadata": {"name": "p", "ownerReferences": [{"name": "rs"}, {"name": "rs"}]}
        })];
        let replicasets = vec![json!({"metadata": {"name": "rs"}})];
        let outcome = apply_rule(&ownership_rule(), &pods, &replicasets);
        assert_eq!(outcome.matched_a.len(), 1);
        assert_eq!(outcome.matched_b.len(), 1);
    }
}
