//! SET and DELETE evaluation
//!
//! SET builds a JSON-Patch `replace` per key-value pair, applies it to
//! every resource of the node, and mirrors the change into the in-memory
//! result map so later clauses observe the new value. DELETE removes every
//! resource of the node and unbinds it.

use serde_json::json;

use trellis_core::ast::{DeleteClause, SetClause};
use trellis_core::path;

use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::executor::QueryExecutor;

pub(crate) async fn run_set(
    executor: &QueryExecutor,
    ctx: &mut ExecutionContext,
    clause: &SetClause,
) -> Result<()> {
    for pair in &clause.key_value_pairs {
        let (node, resource_path) = pair.split_key();
        let pointer = path::to_json_pointer(resource_path)?;
        let patch = json!([{ "op": "replace", "path": pointer, "value": pair.value }]);

        let spec = ctx.spec(node)?.clone();
        let resources = ctx.resources(node)?.clone();
        for resource in &resources {
            let name = resource["metadata"]["name"]
                .as_str()
                .ok_or_else(|| EngineError::MissingName(node.to_string()))?;
            let namespace = resource["metadata"]["namespace"].as_str();
            executor
                .provider
                .patch_resource(&spec.resource, name, namespace, patch.clone())
                .await?;
        }

        // Mirror into the working set so later clauses see the new value.
        if let Some(entry) = ctx.result_map.get_mut(node) {
            for resource in entry.iter_mut() {
                path::set_value(resource, resource_path, pair.value.clone(), 0)?;
            }
        }
    }
    Ok(())
}

pub(crate) async fn run_delete(
    executor: &QueryExecutor,
    ctx: &mut ExecutionContext,
    clause: &DeleteClause,
) -> Result<()> {
    for node in &clause.node_ids {
        let spec = ctx.spec(node)?.clone();
        let resources = ctx
            .result_map
            .shift_remove(node)
            .ok_or_else(|| EngineError::UnknownNode(node.to_string()))?;
        for resource in &resources {
            let name = resource["metadata"]["name"]
                .as_str()
                .ok_or_else(|| EngineError::MissingName(node.to_string()))?;
            let namespace = resource["metadata"]["namespace"].as_str();
            executor
                .provider
                .delete_resource(&spec.resource, name, namespace)
                .await?;
        }
    }
    Ok(())
}
