//! OpenAPI v3 ingestion
//!
//! Fetches the cluster's per-group-version OpenAPI documents, merges their
//! schema components into one map, and flattens every schema that declares
//! a Kubernetes GVK into dotted field paths: `[]` marks array elements,
//! `{}` marks free-form map values. `$ref`s resolve inside the merged
//! document; a per-schema memo prevents reprocessing and terminates cycles.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::StreamExt;
use kube::Client;
use serde_json::{Map, Value};
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use crate::error::{KubeError, Result};
use crate::gvr::GvrResolver;

/// Delay before each per-group fetch, avoids API-server throttling.
const FETCH_DELAY: Duration = Duration::from_millis(20);

const SCHEMA_REF_PREFIX: &str = "#/components/schemas/";

/// Fetch and flatten field paths for every discoverable resource kind,
/// keyed by the resource plural.
pub async fn fetch_field_paths(
    client: &Client,
    resolver: &GvrResolver,
) -> Result<BTreeMap<String, Vec<String>>> {
    let schemas = fetch_merged_schemas(client).await?;
    Ok(extract_field_paths(&schemas, resolver))
}

/// Fetch every group-version document in a bounded worker pool and merge
/// their `components.schemas`. Per-group failures are logged and skipped;
/// the union of successful groups is returned.
async fn fetch_merged_schemas(client: &Client) -> Result<Map<String, Value>> {
    let root: Value = client.request(get_request("/openapi/v3")?).await?;
    let urls: Vec<String> = root["paths"]
        .as_object()
        .map(|paths| {
            paths
                .values()
                .filter_map(|entry| entry["serverRelativeURL"].as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    if urls.is_empty() {
        return Err(KubeError::OpenApi("no OpenAPI v3 group documents advertised".to_string()));
    }

    let concurrency = num_cpus::get().max(2);
    let documents: Vec<(String, std::result::Result<Value, KubeError>)> =
        futures::stream::iter(urls.into_iter().map(|url| {
            let client = client.clone();
            async move {
                sleep(FETCH_DELAY).await;
                let result = match get_request(&url) {
                    Ok(request) => client.request::<Value>(request).await.map_err(KubeError::Api),
                    Err(error) => Err(error),
                };
                (url, result)
            }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut merged = Map::new();
    for (url, result) in documents {
        match result {
            Ok(document) => {
                if let Some(schemas) = document["components"]["schemas"].as_object() {
                    debug!(url, count = schemas.len(), "merged OpenAPI schemas");
                    for (name, schema) in schemas {
                        merged.entry(name.clone()).or_insert_with(|| schema.clone());
                    }
                }
            }
            Err(error) => warn!(url, %error, "skipping unfetchable OpenAPI group"),
        }
    }
    Ok(merged)
}

fn get_request(path: &str) -> Result<http::Request<Vec<u8>>> {
    http::Request::get(path)
        .body(Vec::new())
        .map_err(|e| KubeError::OpenApi(e.to_string()))
}

/// Flatten every GVK-bearing schema of the merged document into field
/// paths, keyed by the resource plural known to the resolver.
pub fn extract_field_paths(
    schemas: &Map<String, Value>,
    resolver: &GvrResolver,
) -> BTreeMap<String, Vec<String>> {
    let mut memo: HashMap<String, Vec<String>> = HashMap::new();
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (name, schema) in schemas {
        let Some(gvk) = schema
            .get("x-kubernetes-group-version-kind")
            .and_then(|v| v.as_array())
            .and_then(|list| list.first())
        else {
            continue;
        };
        let (Some(kind), Some(group)) = (gvk["kind"].as_str(), gvk["group"].as_str()) else {
            continue;
        };
        let Some(spec) = resolver
            .specs()
            .iter()
            .find(|s| s.kind == kind && s.group == group)
        else {
            continue;
        };

        let mut in_progress = HashSet::new();
        let paths = schema_paths(name, schemas, &mut memo, &mut in_progress);
        let entry = out.entry(spec.resource.clone()).or_default();
        for path in paths {
            if !entry.contains(&path) {
                entry.push(path);
            }
        }
    }
    out
}

/// Paths inside a named schema, memoised. Cycles yield an empty list.
fn schema_paths(
    name: &str,
    schemas: &Map<String, Value>,
    memo: &mut HashMap<String, Vec<String>>,
    in_progress: &mut HashSet<String>,
) -> Vec<String> {
    if let Some(cached) = memo.get(name) {
        return cached.clone();
    }
    if !in_progress.insert(name.to_string()) {
        return Vec::new();
    }
    let paths = match schemas.get(name) {
        Some(schema) => nested_paths(schema, schemas, memo, in_progress),
        None => Vec::new(),
    };
    in_progress.remove(name);
    memo.insert(name.to_string(), paths.clone());
    paths
}

/// Paths reachable inside a schema value; empty for scalars.
fn nested_paths(
    schema: &Value,
    schemas: &Map<String, Value>,
    memo: &mut HashMap<String, Vec<String>>,
    in_progress: &mut HashSet<String>,
) -> Vec<String> {
    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        let name = reference.trim_start_matches(SCHEMA_REF_PREFIX);
        return schema_paths(name, schemas, memo, in_progress);
    }
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        let mut out = Vec::new();
        for (prop, sub) in properties {
            out.extend(property_paths(prop, sub, schemas, memo, in_progress));
        }
        return out;
    }
    Vec::new()
}

fn property_paths(
    prop: &str,
    schema: &Value,
    schemas: &Map<String, Value>,
    memo: &mut HashMap<String, Vec<String>>,
    in_progress: &mut HashSet<String>,
) -> Vec<String> {
    if schema.get("$ref").is_some() {
        let nested = nested_paths(schema, schemas, memo, in_progress);
        return with_prefix(prop, nested);
    }
    match schema.get("type").and_then(Value::as_str) {
        Some("array") => {
            let marker = format!("{prop}[]");
            let nested = schema
                .get("items")
                .map(|items| nested_paths(items, schemas, memo, in_progress))
                .unwrap_or_default();
            with_prefix(&marker, nested)
        }
        Some("object") => {
            if schema.get("properties").is_some() {
                let nested = nested_paths(schema, schemas, memo, in_progress);
                with_prefix(prop, nested)
            } else if let Some(additional) = schema.get("additionalProperties") {
                let marker = format!("{prop}{{}}");
                let nested = if additional.is_object() {
                    nested_paths(additional, schemas, memo, in_progress)
                } else {
                    Vec::new()
                };
                with_prefix(&marker, nested)
            } else {
                vec![prop.to_string()]
            }
        }
        _ => vec![prop.to_string()],
    }
}

/// The property itself plus every nested path beneath it.
fn with_prefix(prop: &str, nested: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(nested.len() + 1);
    out.push(prop.to_string());
    for path in nested {
        out.push(format!("{prop}.{path}"));
    }
    out
}
