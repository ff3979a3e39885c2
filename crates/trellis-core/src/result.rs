//! Query results and the result graph
//!
//! A `QueryResult` lives only for one execute call: the `data` map keyed by
//! node name (plus the synthetic `aggregate` key) and the deduplicated
//! graph of matched nodes and edges.

use serde::Serialize;
use serde_json::{Map, Value};

/// A node of the result graph. `id` is `"{kind}/{name}"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl GraphNode {
    pub fn new(kind: &str, name: &str, namespace: Option<String>) -> Self {
        Self {
            id: format!("{kind}/{name}"),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace,
        }
    }
}

/// An edge of the result graph, tagged with the relationship type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: String,
}

/// The graph view of a query result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Identity of a resource created during the execute call, so callers can
/// attach owner references afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedRef {
    /// Lowercase plural resource.
    pub resource: String,
    pub name: String,
    pub namespace: Option<String>,
}

/// Result of one execute call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    /// Keyed by node name; each entry is a list of per-resource output maps.
    /// Aggregates land under the `aggregate` key.
    pub data: Map<String, Value>,
    pub graph: ResultGraph,
    /// Resources created by CREATE clauses, in creation order.
    #[serde(skip)]
    pub created: Vec<CreatedRef>,
}

impl QueryResult {
    /// Merge another result into this one (used for multi-context queries).
    /// Data lists are concatenated; graph deduplication is by node id and
    /// undirected edge identity.
    pub fn merge(&mut self, other: QueryResult) {
        for (key, value) in other.data {
            match self.data.get_mut(&key) {
                Some(Value::Array(existing)) => {
                    if let Value::Array(incoming) = value {
                        existing.extend(incoming);
                    } else {
                        existing.push(value);
                    }
                }
                Some(_) | None => {
                    self.data.insert(key, value);
                }
            }
        }
        for node in other.graph.nodes {
            if !self.graph.nodes.iter().any(|n| n.id == node.id) {
                self.graph.nodes.push(node);
            }
        }
        for edge in other.graph.edges {
            let duplicate = self.graph.edges.iter().any(|e| {
                e.edge_type == edge.edge_type
                    && ((e.from == edge.from && e.to == edge.to)
                        || (e.from == edge.to && e.to == edge.from))
            });
            if !duplicate {
                self.graph.edges.push(edge);
            }
        }
        self.created.extend(other.created);
    }
}
