//! Query AST
//!
//! These structures represent a parsed query expression. An expression is an
//! ordered list of clauses, optionally preceded by a list of cluster contexts
//! (`IN ctx1, ctx2 ...`). The parser in `trellis-parser` is the only producer;
//! the executor in `trellis-engine` is the main consumer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete query expression: optional cluster contexts plus clauses in
/// source order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Expression {
    /// Cluster contexts named by an `IN` prefix; empty means "current context".
    pub contexts: Vec<String>,
    pub clauses: Vec<Clause>,
}

impl Expression {
    /// All MATCH clauses of this expression, in source order.
    pub fn match_clauses(&self) -> impl Iterator<Item = &MatchClause> {
        self.clauses.iter().filter_map(|c| match c {
            Clause::Match(m) => Some(m),
            _ => None,
        })
    }
}

/// One clause of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Match(MatchClause),
    Create(CreateClause),
    Set(SetClause),
    Delete(DeleteClause),
    Return(ReturnClause),
}

/// `MATCH (a:KindA)->(b:KindB), (c:KindC) WHERE a.x = 1`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchClause {
    pub nodes: Vec<NodePattern>,
    pub relationships: Vec<Relationship>,
    /// WHERE conditions; each key is `<nodeName>.<dotted.path>`.
    pub extra_filters: Vec<KeyValuePair>,
}

/// `CREATE (a:KindA)` or `CREATE (a)->(b:KindB)`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateClause {
    pub nodes: Vec<NodePattern>,
    pub relationships: Vec<Relationship>,
}

/// `SET a.spec.replicas = 0, a.metadata.labels.tier = "web"`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SetClause {
    pub key_value_pairs: Vec<KeyValuePair>,
}

/// `DELETE a, b`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteClause {
    pub node_ids: Vec<String>,
}

/// `RETURN a.metadata.name AS name, COUNT{a.spec.replicas} AS n`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReturnClause {
    pub items: Vec<ReturnItem>,
}

/// A node pattern: `(name:Kind)`, `(name:Kind {key: "value"})`, or
/// `(name:Kind { ...json template... })`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodePattern {
    /// Variable name; the sole key into the executor's result map.
    pub name: String,
    /// Resource kind as written in the query. May be empty for anonymous
    /// reference nodes (`(d)` in a CREATE following a MATCH).
    pub kind: String,
    /// Flat properties used for matching (name / labels / namespace).
    pub properties: Vec<Property>,
    /// Raw JSON template used by CREATE when the brace block carries nested
    /// structure.
    pub json_data: Option<Value>,
}

impl NodePattern {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Look up a flat property by key.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.iter().find(|p| p.key == key).map(|p| &p.value)
    }
}

/// A single `key: value` entry inside a node or relationship pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub key: String,
    pub value: Value,
}

/// Direction of a relationship token.
///
/// `->` is `Right`, `<-` is `Left`, `<-->` is `Both`, `--` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
    Both,
    None,
}

/// A relationship between two node patterns, e.g. `(a:A)-[r:Rel {k: 1}]->(b:B)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub direction: Direction,
    /// Properties attached to the relationship token itself.
    pub properties: Vec<Property>,
    pub left_node: NodePattern,
    pub right_node: NodePattern,
}

/// Comparison operators usable in WHERE filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanEquals,
    LessThanEquals,
    Contains,
    RegexCompare,
}

impl std::fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Equals => "=",
            Self::NotEquals => "!=",
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterThanEquals => ">=",
            Self::LessThanEquals => "<=",
            Self::Contains => "CONTAINS",
            Self::RegexCompare => "=~",
        };
        f.write_str(s)
    }
}

/// A `key <op> value` pair, used by WHERE filters and SET assignments.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValuePair {
    /// `<nodeName>.<dotted.path>`
    pub key: String,
    pub value: Value,
    pub operator: ComparisonOperator,
}

impl KeyValuePair {
    /// Split the key into its node name and the path within the resource.
    /// `"d.spec.replicas"` yields `("d", "spec.replicas")`.
    pub fn split_key(&self) -> (&str, &str) {
        match self.key.split_once('.') {
            Some((node, path)) => (node, path),
            None => (self.key.as_str(), ""),
        }
    }
}

/// Aggregation functions usable in RETURN items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
}

/// One RETURN item: a JSONPath (prefixed by the node name), an optional
/// alias, and an optional aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnItem {
    /// `<nodeName>` or `<nodeName>.<dotted.path>`.
    pub json_path: String,
    pub alias: Option<String>,
    pub aggregate: Option<Aggregate>,
}

impl ReturnItem {
    pub fn new(json_path: impl Into<String>) -> Self {
        Self {
            json_path: json_path.into(),
            alias: None,
            aggregate: None,
        }
    }

    /// The node identifier this item refers to.
    pub fn node_id(&self) -> &str {
        self.json_path
            .split_once('.')
            .map_or(self.json_path.as_str(), |(node, _)| node)
    }

    /// The path within the resource, without the node prefix. Empty when the
    /// item names the node alone.
    pub fn resource_path(&self) -> &str {
        self.json_path.split_once('.').map_or("", |(_, path)| path)
    }

    /// Key under which the value lands in the output: the alias when given,
    /// the last path segment otherwise.
    pub fn output_key(&self) -> &str {
        if let Some(alias) = &self.alias {
            return alias;
        }
        let path = self.resource_path();
        if path.is_empty() {
            self.node_id()
        } else {
            path.rsplit('.').next().unwrap_or(path)
        }
    }
}
