//! Relationship-rule synthesis from schema field paths
//!
//! Any field path ending in `Name`, `Ref` or `KeyRef` names another kind:
//! `spec.serviceAccountName` on a Pod points at a ServiceAccount,
//! `spec.configMapRef` at a ConfigMap. When the candidate prefix resolves
//! to a real kind, a rule is synthesised linking the referencing resource
//! (dependent side) to the referenced one by `metadata.name`.

use std::collections::BTreeMap;

use trellis_core::rules::{MatchCriterion, RelationshipRule};

use crate::provider::Provider;

/// Suffixes that mark a reference field, longest first so `KeyRef` wins
/// over `Ref`.
const REFERENCE_SUFFIXES: [&str; 3] = ["KeyRef", "Ref", "Name"];

/// Synthesise rules from flattened field paths. Candidates that do not
/// resolve to a kind are silently skipped; ambiguous ones too.
pub async fn synthesise_rules(
    field_paths: &BTreeMap<String, Vec<String>>,
    provider: &dyn Provider,
) -> Vec<RelationshipRule> {
    let mut rules = Vec::new();
    for (resource_a, paths) in field_paths {
        for path in paths {
            let Some((candidate, suffix)) = reference_candidate(path) else {
                continue;
            };
            let Ok(spec_b) = provider.find_gvr(&candidate).await else {
                continue;
            };
            // Ref/KeyRef fields are objects whose `name` member carries the
            // referent; Name fields carry it directly.
            let field_a = if suffix == "Name" {
                format!("$.{path}")
            } else {
                format!("$.{path}.name")
            };
            rules.push(RelationshipRule::new(
                resource_a,
                &spec_b.resource,
                &format!(
                    "{}_{}_INSPEC_{}",
                    spec_b.resource.to_uppercase(),
                    suffix.to_uppercase(),
                    resource_a.to_uppercase()
                ),
                vec![MatchCriterion::exact(&field_a, "$.metadata.name")],
            ));
        }
    }
    rules
}

/// The kind candidate hiding in a path's final segment, with the suffix
/// that marked it. `spec.template.spec.serviceAccountName` yields
/// `("serviceAccount", "Name")`.
fn reference_candidate(path: &str) -> Option<(String, &'static str)> {
    let segment = path.rsplit('.').next().unwrap_or(path);
    let segment = segment.trim_end_matches("[]").trim_end_matches("{}");
    for suffix in REFERENCE_SUFFIXES {
        if let Some(prefix) = segment.strip_suffix(suffix) {
            if prefix.is_empty() {
                return None;
            }
            return Some((prefix.to_string(), suffix));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use trellis_core::rules::ComparisonType;

    #[test]
    fn test_reference_candidate() {
        assert_eq!(
            reference_candidate("spec.serviceAccountName"),
            Some(("serviceAccount".to_string(), "Name"))
        );
        assert_eq!(
            reference_candidate("spec.containers[].envFrom[].configMapRef"),
            Some(("configMap".to_string(), "Ref"))
        );
        assert_eq!(
            reference_candidate("spec.containers[].env[].valueFrom.secretKeyRef"),
            Some(("secret".to_string(), "KeyRef"))
        );
        assert_eq!(reference_candidate("spec.replicas"), None);
        assert_eq!(reference_candidate("spec.Name"), None);
    }

    #[tokio::test]
    async fn test_synthesise_rules_resolving_candidates_only() {
        let provider = MockProvider::new();
        let mut field_paths = BTreeMap::new();
        field_paths.insert(
            "pods".to_string(),
            vec![
                "spec.serviceAccountName".to_string(),
                "spec.containers[].env[].valueFrom.secretKeyRef".to_string(),
                "spec.bogusThingName".to_string(),
                "spec.replicas".to_string(),
            ],
        );

        let rules = synthesise_rules(&field_paths, &provider).await;
        assert_eq!(rules.len(), 2);

        let sa_rule = rules
            .iter()
            .find(|r| r.kind_b == "serviceaccounts")
            .expect("serviceaccount rule");
        assert_eq!(sa_rule.kind_a, "pods");
        assert_eq!(sa_rule.relationship_type, "SERVICEACCOUNTS_NAME_INSPEC_PODS");
        assert_eq!(sa_rule.match_criteria[0].field_a, "$.spec.serviceAccountName");
        assert_eq!(sa_rule.match_criteria[0].field_b, "$.metadata.name");
        assert_eq!(sa_rule.match_criteria[0].comparison_type, ComparisonType::ExactMatch);

        let secret_rule = rules.iter().find(|r| r.kind_b == "secrets").expect("secret rule");
        assert_eq!(
            secret_rule.match_criteria[0].field_a,
            "$.spec.containers[].env[].valueFrom.secretKeyRef.name"
        );
    }
}
