//! Relationship rules between resource kinds
//!
//! A rule links two kinds through one or more match criteria (pairs of
//! paths compared by ExactMatch or ContainsAll). Rules are directional:
//! `kind_a` is the dependent side of the arrow, `kind_b` the owner or
//! target. Kinds are stored as lowercase plurals.
//!
//! The static table below covers the built-in Kubernetes relationships
//! (owner chains, selector exposure, name references). Rules synthesised
//! from the cluster's OpenAPI schema extend the registry at startup but
//! never override a static rule for the same kind pair.

use once_cell::sync::Lazy;
use serde_json::{Value, json};

/// Tag forced onto any relationship where one side is a namespace.
pub const NAMESPACE_RELATIONSHIP_TYPE: &str = "NamespaceHasResource";

/// Wildcard kind accepted on the `kind_b` side of a rule.
pub const WILDCARD_KIND: &str = "*";

/// How the two resolved field values of a criterion are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonType {
    /// Deep any-level containment with scalar equality at the leaves.
    ExactMatch,
    /// Both paths resolve to maps; every key of B's map must be present in
    /// A's map with an equal value.
    ContainsAll,
}

/// A fill-in value used during CREATE when the foreign resource lacks a
/// source value. `field_a`/`field_b` address the A/B sides of the owning
/// rule; an empty source path means the default is always used.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultProp {
    pub field_a: String,
    pub field_b: String,
    pub default: Value,
}

/// One path-pair comparison of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCriterion {
    /// Path on the `kind_a` resource.
    pub field_a: String,
    /// Path on the `kind_b` resource.
    pub field_b: String,
    pub comparison_type: ComparisonType,
    pub default_props: Vec<DefaultProp>,
}

impl MatchCriterion {
    pub fn exact(field_a: &str, field_b: &str) -> Self {
        Self {
            field_a: field_a.to_string(),
            field_b: field_b.to_string(),
            comparison_type: ComparisonType::ExactMatch,
            default_props: Vec::new(),
        }
    }

    pub fn contains_all(field_a: &str, field_b: &str) -> Self {
        Self {
            field_a: field_a.to_string(),
            field_b: field_b.to_string(),
            comparison_type: ComparisonType::ContainsAll,
            default_props: Vec::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: Vec<DefaultProp>) -> Self {
        self.default_props = defaults;
        self
    }
}

/// A directional relationship rule between two kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipRule {
    /// Dependent side, lowercase plural.
    pub kind_a: String,
    /// Owner/target side, lowercase plural (may be `*` for the namespace rule).
    pub kind_b: String,
    /// Relationship tag, e.g. `SERVICE_EXPOSE_DEPLOYMENT`.
    pub relationship_type: String,
    pub match_criteria: Vec<MatchCriterion>,
}

impl RelationshipRule {
    pub fn new(kind_a: &str, kind_b: &str, tag: &str, criteria: Vec<MatchCriterion>) -> Self {
        Self {
            kind_a: kind_a.to_string(),
            kind_b: kind_b.to_string(),
            relationship_type: tag.to_string(),
            match_criteria: criteria,
        }
    }

    /// True when this rule links the two given kinds in either orientation.
    pub fn links(&self, left: &str, right: &str) -> bool {
        (self.kind_a == left && self.kind_b == right)
            || (self.kind_a == right && self.kind_b == left)
    }
}

fn owner_criteria() -> Vec<MatchCriterion> {
    vec![MatchCriterion::exact(
        "$.metadata.ownerReferences[].name",
        "$.metadata.name",
    )]
}

fn service_criteria(workload_selector: &str, container_port_path: &str) -> Vec<MatchCriterion> {
    vec![
        MatchCriterion::contains_all(workload_selector, "$.spec.selector").with_defaults(vec![
            DefaultProp {
                field_a: container_port_path.to_string(),
                field_b: "$.spec.ports[].port".to_string(),
                default: json!(80),
            },
        ]),
    ]
}

/// The canonical static rule table.
pub static STATIC_RULES: Lazy<Vec<RelationshipRule>> = Lazy::new(|| {
    vec![
        // Owner-reference chains.
        RelationshipRule::new("replicasets", "deployments", "DEPLOYMENT_OWN_REPLICASET", owner_criteria()),
        RelationshipRule::new("pods", "replicasets", "REPLICASET_OWN_POD", owner_criteria()),
        RelationshipRule::new("pods", "statefulsets", "STATEFULSET_OWN_POD", owner_criteria()),
        RelationshipRule::new("pods", "daemonsets", "DAEMONSET_OWN_POD", owner_criteria()),
        RelationshipRule::new("pods", "jobs", "JOB_OWN_POD", owner_criteria()),
        RelationshipRule::new("jobs", "cronjobs", "CRONJOB_OWN_JOB", owner_criteria()),
        RelationshipRule::new("pods", "cronjobs", "CRONJOB_OWN_POD", owner_criteria()),
        // Selector exposure.
        RelationshipRule::new(
            "pods",
            "services",
            "SERVICE_EXPOSE_POD",
            service_criteria("$.metadata.labels", "$.spec.containers[].ports[].containerPort"),
        ),
        RelationshipRule::new(
            "deployments",
            "services",
            "SERVICE_EXPOSE_DEPLOYMENT",
            service_criteria(
                "$.spec.selector.matchLabels",
                "$.spec.template.spec.containers[].ports[].containerPort",
            ),
        ),
        RelationshipRule::new(
            "statefulsets",
            "services",
            "SERVICE_EXPOSE_STATEFULSET",
            service_criteria(
                "$.spec.selector.matchLabels",
                "$.spec.template.spec.containers[].ports[].containerPort",
            ),
        ),
        RelationshipRule::new(
            "daemonsets",
            "services",
            "SERVICE_EXPOSE_DAEMONSET",
            service_criteria(
                "$.spec.selector.matchLabels",
                "$.spec.template.spec.containers[].ports[].containerPort",
            ),
        ),
        RelationshipRule::new(
            "replicasets",
            "services",
            "SERVICE_EXPOSE_REPLICASET",
            service_criteria(
                "$.spec.selector.matchLabels",
                "$.spec.template.spec.containers[].ports[].containerPort",
            ),
        ),
        // Ingress routing.
        RelationshipRule::new(
            "ingresses",
            "services",
            "INGRESS_ROUTE_SERVICE",
            vec![
                MatchCriterion::exact(
                    "$.spec.rules[].http.paths[].backend.service.name",
                    "$.metadata.name",
                )
                .with_defaults(vec![
                    DefaultProp {
                        field_a: "$.spec.rules[].http.paths[].pathType".to_string(),
                        field_b: String::new(),
                        default: json!("ImplementationSpecific"),
                    },
                    DefaultProp {
                        field_a: "$.spec.rules[].http.paths[].path".to_string(),
                        field_b: String::new(),
                        default: json!("/"),
                    },
                    DefaultProp {
                        field_a: "$.spec.rules[].http.paths[].backend.service.port.number".to_string(),
                        field_b: "$.spec.ports[].port".to_string(),
                        default: json!(80),
                    },
                ]),
            ],
        ),
        // Storage.
        RelationshipRule::new(
            "persistentvolumeclaims",
            "persistentvolumes",
            "PVC_BIND_PV",
            vec![MatchCriterion::exact("$.spec.volumeName", "$.metadata.name")],
        ),
        RelationshipRule::new(
            "persistentvolumeclaims",
            "storageclasses",
            "PVC_USE_STORAGECLASS",
            vec![MatchCriterion::exact("$.spec.storageClassName", "$.metadata.name")],
        ),
        // Service plumbing.
        RelationshipRule::new(
            "endpoints",
            "services",
            "SERVICE_HAS_ENDPOINTS",
            vec![MatchCriterion::exact("$.metadata.name", "$.metadata.name")],
        ),
        // Pod mounts and placement.
        RelationshipRule::new(
            "pods",
            "configmaps",
            "POD_MOUNT_CONFIGMAP",
            vec![MatchCriterion::exact("$.spec.volumes[].configMap.name", "$.metadata.name")],
        ),
        RelationshipRule::new(
            "pods",
            "secrets",
            "POD_MOUNT_SECRET",
            vec![MatchCriterion::exact("$.spec.volumes[].secret.secretName", "$.metadata.name")],
        ),
        RelationshipRule::new(
            "pods",
            "nodes",
            "POD_RUN_ON_NODE",
            vec![MatchCriterion::exact("$.spec.nodeName", "$.metadata.name")],
        ),
        RelationshipRule::new(
            "pods",
            "serviceaccounts",
            "POD_USE_SERVICEACCOUNT",
            vec![MatchCriterion::exact("$.spec.serviceAccountName", "$.metadata.name")],
        ),
        // Policy.
        RelationshipRule::new(
            "pods",
            "networkpolicies",
            "NETWORKPOLICY_APPLY_POD",
            vec![MatchCriterion::contains_all(
                "$.metadata.labels",
                "$.spec.podSelector.matchLabels",
            )],
        ),
        RelationshipRule::new(
            "pods",
            "poddisruptionbudgets",
            "PDB_PROTECT_POD",
            vec![MatchCriterion::contains_all(
                "$.metadata.labels",
                "$.spec.selector.matchLabels",
            )],
        ),
        // Autoscaling.
        RelationshipRule::new(
            "horizontalpodautoscalers",
            "deployments",
            "HPA_SCALE_DEPLOYMENT",
            vec![MatchCriterion::exact("$.spec.scaleTargetRef.name", "$.metadata.name")],
        ),
        // RBAC.
        RelationshipRule::new(
            "rolebindings",
            "roles",
            "ROLEBINDING_BIND_ROLE",
            vec![MatchCriterion::exact("$.roleRef.name", "$.metadata.name")],
        ),
        RelationshipRule::new(
            "clusterrolebindings",
            "clusterroles",
            "CLUSTERROLEBINDING_BIND_CLUSTERROLE",
            vec![MatchCriterion::exact("$.roleRef.name", "$.metadata.name")],
        ),
        // Admission webhooks.
        RelationshipRule::new(
            "mutatingwebhookconfigurations",
            "services",
            "MUTATINGWEBHOOK_CALL_SERVICE",
            vec![MatchCriterion::exact(
                "$.webhooks[].clientConfig.service.name",
                "$.metadata.name",
            )],
        ),
        RelationshipRule::new(
            "validatingwebhookconfigurations",
            "services",
            "VALIDATINGWEBHOOK_CALL_SERVICE",
            vec![MatchCriterion::exact(
                "$.webhooks[].clientConfig.service.name",
                "$.metadata.name",
            )],
        ),
        // Namespace membership (wildcard).
        RelationshipRule::new(
            "namespaces",
            WILDCARD_KIND,
            NAMESPACE_RELATIONSHIP_TYPE,
            vec![MatchCriterion::exact("$.metadata.name", "$.metadata.namespace")],
        ),
    ]
});

/// Insertion-ordered rule collection: the static table first, synthesised
/// rules appended behind it.
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    rules: Vec<RelationshipRule>,
    static_len: usize,
}

impl RuleRegistry {
    /// Registry seeded with the static table.
    pub fn with_static_rules() -> Self {
        let rules = STATIC_RULES.clone();
        let static_len = rules.len();
        Self { rules, static_len }
    }

    /// Empty registry, for tests that want full control over the table.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            static_len: 0,
        }
    }

    pub fn rules(&self) -> &[RelationshipRule] {
        &self.rules
    }

    /// Add a rule synthesised from schema inspection. Static rules are
    /// authoritative: a synthesised rule for a kind pair already covered by
    /// the static table is dropped. A second synthesised rule for the same
    /// pair contributes its criteria to the existing one instead.
    pub fn add_synthesised(&mut self, rule: RelationshipRule) {
        if self.rules[..self.static_len]
            .iter()
            .any(|r| r.links(&rule.kind_a, &rule.kind_b))
        {
            return;
        }
        if let Some(existing) = self.rules[self.static_len..]
            .iter_mut()
            .find(|r| r.links(&rule.kind_a, &rule.kind_b))
        {
            for criterion in rule.match_criteria {
                if !existing.match_criteria.contains(&criterion) {
                    existing.match_criteria.push(criterion);
                }
            }
            return;
        }
        self.rules.push(rule);
    }

    /// Look up a rule by its tag.
    pub fn find_by_tag(&self, tag: &str) -> Option<&RelationshipRule> {
        self.rules.iter().find(|r| r.relationship_type == tag)
    }

    /// Look up a rule linking two kinds, trying both orientations. The
    /// returned rule's own `kind_a` tells the caller which side matched as
    /// the dependent.
    pub fn find_by_kinds(&self, left: &str, right: &str) -> Option<&RelationshipRule> {
        self.rules.iter().find(|r| r.links(left, right))
    }

    /// The namespace wildcard rule.
    pub fn namespace_rule(&self) -> Option<&RelationshipRule> {
        self.find_by_tag(NAMESPACE_RELATIONSHIP_TYPE)
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_static_rules()
    }
}
