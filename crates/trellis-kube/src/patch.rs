//! JSON-Patch analysis and rewriting
//!
//! Two patch shapes cannot be sent to the API server as plain JSON-Patch:
//!
//! 1. *Add-to-map under a possibly-absent parent* (a `test` on
//!    `/metadata/annotations` followed by an `add` of
//!    `/metadata/annotations/key`): rewritten to a strategic-merge patch
//!    that materialises the parent and sets the key atomically.
//! 2. *Add under `spec/template/spec/containers/N/...`*: strategic merge
//!    keys containers by `name`, not index, so the caller must look up the
//!    container name at index N and finish the merge with it.
//!
//! Everything else passes through as JSON-Patch; `test` ops that guard a
//! sibling `add` are reported so the caller can materialise an empty map
//! and retry when the test fails server-side.

use serde_json::{Map, Value, json};

use crate::error::{KubeError, Result};

/// What to do with an analysed patch document.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchPlan {
    /// Send this strategic-merge body instead of the original patch.
    StrategicMerge(Value),
    /// Fetch the resource, read `spec.template.spec.containers[index].name`,
    /// then send [`container_merge`] built from `ops`.
    ContainerMerge {
        index: usize,
        /// Remaining pointer inside the container paired with the value.
        ops: Vec<(String, Value)>,
    },
    /// Send as plain JSON-Patch. `test_fallbacks` lists tested parent paths
    /// to materialise with an empty object if the server rejects the test.
    JsonPatch {
        patch: Value,
        test_fallbacks: Vec<String>,
    },
}

const CONTAINER_PREFIX: &str = "/spec/template/spec/containers/";

/// Analyse a JSON-Patch document and decide how to send it.
pub fn analyse(patch: &Value) -> Result<PatchPlan> {
    let ops = patch
        .as_array()
        .ok_or_else(|| KubeError::InvalidPatch("patch document must be an array".to_string()))?;
    if ops.is_empty() {
        return Err(KubeError::InvalidPatch("patch document is empty".to_string()));
    }

    let mut test_paths = Vec::new();
    let mut writes: Vec<(String, Value)> = Vec::new();
    let mut other_ops = false;
    for op in ops {
        let op_name = op["op"].as_str().unwrap_or_default();
        let path = op["path"].as_str().unwrap_or_default().to_string();
        match op_name {
            "test" => test_paths.push(path),
            "add" | "replace" => writes.push((path, op["value"].clone())),
            _ => other_ops = true,
        }
    }

    // Shape 2: every write addresses the same container index.
    if !other_ops && !writes.is_empty() {
        let container_ops: Vec<Option<(usize, String)>> =
            writes.iter().map(|(path, _)| split_container_path(path)).collect();
        if container_ops.iter().all(Option::is_some) {
            let mut ops_out = Vec::new();
            let mut index = None;
            for (parsed, (_, value)) in container_ops.into_iter().zip(&writes) {
                let (i, rest) = parsed.expect("checked above");
                match index {
                    None => index = Some(i),
                    Some(existing) if existing != i => {
                        return Err(KubeError::InvalidPatch(
                            "container patches must address a single container".to_string(),
                        ));
                    }
                    Some(_) => {}
                }
                ops_out.push((rest, value.clone()));
            }
            return Ok(PatchPlan::ContainerMerge {
                index: index.expect("at least one write"),
                ops: ops_out,
            });
        }
    }

    // Shape 1: tests guarding adds directly beneath them, nothing else.
    if !other_ops
        && !test_paths.is_empty()
        && !writes.is_empty()
        && writes
            .iter()
            .all(|(path, _)| test_paths.iter().any(|t| is_direct_child(t, path)))
    {
        let mut merged = json!({});
        for (path, value) in &writes {
            deep_merge(&mut merged, &nested_from_pointer(path, value.clone())?);
        }
        return Ok(PatchPlan::StrategicMerge(merged));
    }

    // Pass through, remembering which tested parents may need materialising.
    let test_fallbacks = test_paths
        .into_iter()
        .filter(|t| {
            ops.iter().any(|op| {
                matches!(op["op"].as_str(), Some("add"))
                    && op["path"].as_str().is_some_and(|p| is_direct_child(t, p))
            })
        })
        .collect();
    Ok(PatchPlan::JsonPatch {
        patch: patch.clone(),
        test_fallbacks,
    })
}

/// Build the strategic-merge body addressing a container by name.
pub fn container_merge(container_name: &str, ops: &[(String, Value)]) -> Result<Value> {
    let mut container = json!({ "name": container_name });
    for (rest, value) in ops {
        let nested = nested_from_pointer(&format!("/{rest}"), value.clone())?;
        deep_merge(&mut container, &nested);
    }
    Ok(json!({
        "spec": { "template": { "spec": { "containers": [container] } } }
    }))
}

/// A JSON-Patch document adding an empty object at each given path, sent
/// before retrying a patch whose `test` failed.
pub fn materialise_parents(paths: &[String]) -> Value {
    Value::Array(
        paths
            .iter()
            .map(|path| json!({ "op": "add", "path": path, "value": {} }))
            .collect(),
    )
}

/// `/spec/template/spec/containers/2/resources/limits/cpu` splits into
/// `(2, "resources/limits/cpu")`.
fn split_container_path(path: &str) -> Option<(usize, String)> {
    let rest = path.strip_prefix(CONTAINER_PREFIX)?;
    let (index, tail) = rest.split_once('/')?;
    let index = index.parse().ok()?;
    Some((index, tail.to_string()))
}

fn is_direct_child(parent: &str, child: &str) -> bool {
    child
        .strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

/// Expand a JSON pointer into the nested object it addresses.
fn nested_from_pointer(pointer: &str, value: Value) -> Result<Value> {
    let mut segments: Vec<String> = Vec::new();
    for raw in pointer.split('/').skip(1) {
        if raw.is_empty() {
            return Err(KubeError::InvalidPatch(format!("empty segment in '{pointer}'")));
        }
        segments.push(raw.replace("~1", "/").replace("~0", "~"));
    }
    let mut out = value;
    for segment in segments.into_iter().rev() {
        let mut map = Map::new();
        map.insert(segment, out);
        out = Value::Object(map);
    }
    Ok(out)
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyse_rejects_non_array() {
        assert!(analyse(&json!({"op": "add"})).is_err());
        assert!(analyse(&json!([])).is_err());
    }

    #[test]
    fn test_annotation_add_becomes_strategic_merge() {
        let patch = json!([
            { "op": "test", "path": "/metadata/annotations" },
            { "op": "add", "path": "/metadata/annotations/team", "value": "platform" },
        ]);
        match analyse(&patch).unwrap() {
            PatchPlan::StrategicMerge(body) => {
                assert_eq!(body, json!({"metadata": {"annotations": {"team": "platform"}}}));
            }
            other => panic!("expected strategic merge, got {other:?}"),
        }
    }

    #[test]
    fn test_multiple_guarded_adds_merge_into_one_body() {
        let patch = json!([
            { "op": "test", "path": "/metadata/labels" },
            { "op": "add", "path": "/metadata/labels/app", "value": "web" },
            { "op": "add", "path": "/metadata/labels/tier", "value": "frontend" },
        ]);
        match analyse(&patch).unwrap() {
            PatchPlan::StrategicMerge(body) => {
                assert_eq!(
                    body,
                    json!({"metadata": {"labels": {"app": "web", "tier": "frontend"}}})
                );
            }
            other => panic!("expected strategic merge, got {other:?}"),
        }
    }

    #[test]
    fn test_container_path_becomes_container_merge() {
        let patch = json!([
            { "op": "replace", "path": "/spec/template/spec/containers/1/image", "value": "nginx:1.27" },
        ]);
        match analyse(&patch).unwrap() {
            PatchPlan::ContainerMerge { index, ops } => {
                assert_eq!(index, 1);
                assert_eq!(ops, vec![("image".to_string(), json!("nginx:1.27"))]);
            }
            other => panic!("expected container merge, got {other:?}"),
        }
    }

    #[test]
    fn test_container_merge_addresses_by_name() {
        let body = container_merge("app", &[("resources/limits/cpu".to_string(), json!("500m"))]).unwrap();
        assert_eq!(
            body,
            json!({"spec": {"template": {"spec": {"containers": [
                {"name": "app", "resources": {"limits": {"cpu": "500m"}}}
            ]}}}})
        );
    }

    #[test]
    fn test_mixed_container_indices_rejected() {
        let patch = json!([
            { "op": "replace", "path": "/spec/template/spec/containers/0/image", "value": "a" },
            { "op": "replace", "path": "/spec/template/spec/containers/1/image", "value": "b" },
        ]);
        assert!(analyse(&patch).is_err());
    }

    #[test]
    fn test_plain_replace_passes_through() {
        let patch = json!([
            { "op": "replace", "path": "/spec/replicas", "value": 0 },
        ]);
        match analyse(&patch).unwrap() {
            PatchPlan::JsonPatch { patch: out, test_fallbacks } => {
                assert_eq!(out, patch);
                assert!(test_fallbacks.is_empty());
            }
            other => panic!("expected json patch, got {other:?}"),
        }
    }

    #[test]
    fn test_test_with_unrelated_ops_reports_fallbacks() {
        let patch = json!([
            { "op": "test", "path": "/metadata/labels" },
            { "op": "add", "path": "/metadata/labels/app", "value": "web" },
            { "op": "remove", "path": "/spec/paused" },
        ]);
        match analyse(&patch).unwrap() {
            PatchPlan::JsonPatch { test_fallbacks, .. } => {
                assert_eq!(test_fallbacks, vec!["/metadata/labels".to_string()]);
            }
            other => panic!("expected json patch, got {other:?}"),
        }
    }

    #[test]
    fn test_materialise_parents() {
        let doc = materialise_parents(&["/metadata/labels".to_string()]);
        assert_eq!(
            doc,
            json!([{"op": "add", "path": "/metadata/labels", "value": {}}])
        );
    }

    #[test]
    fn test_nested_from_pointer_unescapes() {
        let nested = nested_from_pointer("/metadata/annotations/a~1b", json!("x")).unwrap();
        assert_eq!(nested, json!({"metadata": {"annotations": {"a/b": "x"}}}));
    }
}
