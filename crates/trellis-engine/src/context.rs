//! Per-execute working state
//!
//! One `ExecutionContext` lives for exactly one execute call. The result
//! map and list cache are scratch space; nothing leaks across queries.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::Value;

use trellis_core::result::{CreatedRef, QueryResult};
use trellis_kube::ResourceSpec;

use crate::error::{EngineError, Result};
use crate::graph::GraphAccumulator;

pub struct ExecutionContext {
    /// Node name -> matched resources. Insertion-ordered so output is
    /// deterministic.
    pub result_map: IndexMap<String, Vec<Value>>,
    /// List cache keyed by `(namespace, resource, sorted selectors)`
    /// fingerprints.
    pub result_cache: HashMap<String, Vec<Value>>,
    /// Resolved resource spec per node name.
    pub node_specs: HashMap<String, ResourceSpec>,
    pub graph: GraphAccumulator,
    /// Output data accumulated by RETURN.
    pub data: serde_json::Map<String, Value>,
    /// Resources created by CREATE clauses, for owner-reference attachment.
    pub created: Vec<CreatedRef>,
    /// Operator-provided namespace; overrides any node property.
    pub namespace: Option<String>,
}

impl ExecutionContext {
    pub fn new(namespace: Option<&str>) -> Self {
        Self {
            result_map: IndexMap::new(),
            result_cache: HashMap::new(),
            node_specs: HashMap::new(),
            graph: GraphAccumulator::default(),
            data: serde_json::Map::new(),
            created: Vec::new(),
            namespace: namespace.map(str::to_string),
        }
    }

    /// Matched resources of a bound node.
    pub fn resources(&self, node: &str) -> Result<&Vec<Value>> {
        self.result_map
            .get(node)
            .ok_or_else(|| EngineError::UnknownNode(node.to_string()))
    }

    /// Resolved spec of a bound node.
    pub fn spec(&self, node: &str) -> Result<&ResourceSpec> {
        self.node_specs
            .get(node)
            .ok_or_else(|| EngineError::UnknownNode(node.to_string()))
    }

    /// Consume the context into the caller-visible result. Scratch state
    /// (result map, cache) is dropped here, ending its lifecycle.
    pub fn into_result(self) -> QueryResult {
        QueryResult {
            data: self.data,
            graph: self.graph.into_graph(),
            created: self.created,
        }
    }
}
