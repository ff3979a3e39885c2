//! Result-graph assembly with deduplication
//!
//! Nodes are unique by id (`{kind}/{name}`); edges are unique treating an
//! edge and its reverse as the same link.

use std::collections::HashSet;

use serde_json::Value;

use trellis_core::result::{GraphEdge, GraphNode, ResultGraph};

#[derive(Default)]
pub struct GraphAccumulator {
    nodes: Vec<GraphNode>,
    node_ids: HashSet<String>,
    edges: Vec<GraphEdge>,
    edge_keys: HashSet<(String, String, String)>,
}

impl GraphAccumulator {
    /// Add a resource as a graph node. Returns the node id, or `None` when
    /// the resource has no name.
    pub fn add_resource(&mut self, kind: &str, resource: &Value) -> Option<String> {
        let name = resource["metadata"]["name"].as_str()?;
        // The namespace of a Namespace itself is meaningless in the graph.
        let namespace = if kind == "Namespace" {
            None
        } else {
            resource["metadata"]["namespace"].as_str().map(str::to_string)
        };
        let node = GraphNode::new(kind, name, namespace);
        let id = node.id.clone();
        if self.node_ids.insert(id.clone()) {
            self.nodes.push(node);
        }
        Some(id)
    }

    pub fn add_edge(&mut self, from: &str, to: &str, edge_type: &str) {
        // An edge and its reverse are the same link.
        let key = if from <= to {
            (from.to_string(), to.to_string(), edge_type.to_string())
        } else {
            (to.to_string(), from.to_string(), edge_type.to_string())
        };
        if self.edge_keys.insert(key) {
            self.edges.push(GraphEdge {
                from: from.to_string(),
                to: to.to_string(),
                edge_type: edge_type.to_string(),
            });
        }
    }

    pub fn into_graph(self) -> ResultGraph {
        ResultGraph {
            nodes: self.nodes,
            edges: self.edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nodes_unique_by_id() {
        let mut graph = GraphAccumulator::default();
        let pod = json!({"metadata": {"name": "p1", "namespace": "prod"}});
        assert_eq!(graph.add_resource("Pod", &pod), Some("Pod/p1".to_string()));
        assert_eq!(graph.add_resource("Pod", &pod), Some("Pod/p1".to_string()));
        assert_eq!(graph.into_graph().nodes.len(), 1);
    }

    #[test]
    fn test_namespace_kind_elides_namespace() {
        let mut graph = GraphAccumulator::default();
        let ns = json!({"metadata": {"name": "prod", "namespace": "ignored"}});
        graph.add_resource("Namespace", &ns);
        let built = graph.into_graph();
        assert_eq!(built.nodes[0].namespace, None);
    }

    #[test]
    fn test_nameless_resource_skipped() {
        let mut graph = GraphAccumulator::default();
        assert_eq!(graph.add_resource("Pod", &json!({"metadata": {}})), None);
        assert!(graph.into_graph().nodes.is_empty());
    }

    #[test]
    fn test_reverse_edge_deduplicated() {
        let mut graph = GraphAccumulator::default();
        graph.add_edge("Deployment/d1", "Service/s1", "SERVICE_EXPOSE_DEPLOYMENT");
        graph.add_edge("Service/s1", "Deployment/d1", "SERVICE_EXPOSE_DEPLOYMENT");
        assert_eq!(graph.into_graph().edges.len(), 1);
    }

    #[test]
    fn test_different_type_same_endpoints_kept() {
        let mut graph = GraphAccumulator::default();
        graph.add_edge("Pod/p1", "Service/s1", "SERVICE_EXPOSE_POD");
        graph.add_edge("Pod/p1", "Service/s1", "POD_USE_SERVICEACCOUNT");
        assert_eq!(graph.into_graph().edges.len(), 2);
    }
}
