//! RETURN evaluation
//!
//! Builds the output data map: one row per resource per referenced node,
//! with `metadata.name` added implicitly for every node. Aggregates land
//! under the synthetic `aggregate` key and never write into node rows.

use serde_json::{Map, Value, json};

use trellis_core::ast::{Aggregate, ReturnClause, ReturnItem};
use trellis_core::path;

use crate::context::ExecutionContext;
use crate::error::Result;

pub(crate) fn run(ctx: &mut ExecutionContext, clause: &ReturnClause) -> Result<()> {
    let mut items = clause.items.clone();

    // Every referenced node implicitly returns its metadata.name.
    let mut ids: Vec<String> = Vec::new();
    for item in &clause.items {
        let id = item.node_id().to_string();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    for id in &ids {
        let implicit = format!("{id}.metadata.name");
        if !items
            .iter()
            .any(|i| i.aggregate.is_none() && i.json_path == implicit)
        {
            items.push(ReturnItem::new(implicit));
        }
    }

    let mut rows_by_node: Vec<(String, Vec<Map<String, Value>>)> = Vec::new();
    let mut aggregates = Map::new();

    for item in &items {
        let id = item.node_id();
        let resources = ctx.resources(id)?.clone();
        match item.aggregate {
            Some(Aggregate::Count) => {
                // One increment per resource, whatever the path resolves to.
                aggregates.insert(aggregate_key(item, "count"), json!(resources.len()));
            }
            Some(Aggregate::Sum) => {
                let mut sum = 0f64;
                let mut all_integers = true;
                for resource in &resources {
                    let value = path::resolve_value(resource, item.resource_path())?;
                    if let Some(number) = value.as_f64() {
                        sum += number;
                        all_integers &= value.is_i64() || value.is_u64();
                    }
                }
                let total = if all_integers { json!(sum as i64) } else { json!(sum) };
                aggregates.insert(aggregate_key(item, "sum"), total);
            }
            None => {
                let position = match rows_by_node.iter().position(|(name, _)| name.as_str() == id) {
                    Some(position) => position,
                    None => {
                        rows_by_node.push((id.to_string(), vec![Map::new(); resources.len()]));
                        rows_by_node.len() - 1
                    }
                };
                let rows = &mut rows_by_node[position].1;
                for (row, resource) in rows.iter_mut().zip(&resources) {
                    let value = if item.resource_path().is_empty() {
                        resource.clone()
                    } else {
                        path::resolve_value(resource, item.resource_path())?
                    };
                    row.insert(item.output_key().to_string(), value);
                }
            }
        }
    }

    for (id, rows) in rows_by_node {
        ctx.data
            .insert(id, Value::Array(rows.into_iter().map(Value::Object).collect()));
    }
    if !aggregates.is_empty() {
        ctx.data.insert("aggregate".to_string(), Value::Object(aggregates));
    }
    Ok(())
}

fn aggregate_key(item: &ReturnItem, function: &str) -> String {
    item.alias
        .clone()
        .unwrap_or_else(|| format!("{function}({})", item.json_path))
}
