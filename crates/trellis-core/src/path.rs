//! Dotted-path resolution over resource JSON trees
//!
//! Resources are free-form `serde_json::Value` trees; every path access in
//! the engine goes through this module so the rest of the code never does
//! raw type assertions. Paths are dotted strings with three bracket forms:
//! `containers[0]` (a concrete index), `rules[]` (any array element) and
//! `data{}` (any map value). A leading `$.` or `$` is accepted and ignored.
//!
//! Resolution fans out transparently over arrays: resolving
//! `spec.rules[].http.paths[].backend.service.name` against an Ingress
//! yields every backend service name reachable under the path.

use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

/// One parsed segment of a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// A named member: `spec`, `metadata`.
    Key(String),
    /// A concrete array index: `[0]`.
    Index(usize),
    /// Any array element: `[]`.
    AnyElement,
    /// Any map value: `{}`.
    AnyValue,
}

/// The shape of a resolved path, so callers can branch without re-inspecting
/// raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum PathValue {
    /// A string, number or boolean.
    Scalar(Value),
    /// Zero or more values collected through array fan-out, or a literal
    /// JSON array.
    List(Vec<Value>),
    /// A JSON object.
    Map(Map<String, Value>),
    /// Nothing reachable under the path.
    Absent,
}

impl PathValue {
    /// Collapse back into a plain JSON value (`Absent` becomes `null`).
    pub fn into_value(self) -> Value {
        match self {
            Self::Scalar(v) => v,
            Self::List(items) => Value::Array(items),
            Self::Map(map) => Value::Object(map),
            Self::Absent => Value::Null,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// First scalar reachable from this value, if any. Used by templating,
    /// which substitutes a single value per expression.
    pub fn first_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            Self::List(items) => items.iter().find(|v| !v.is_null() && !v.is_array() && !v.is_object()),
            _ => None,
        }
    }
}

/// Parse a dotted path into segments.
///
/// `"$.spec.rules[].http"` parses to `[Key(spec), Key(rules), AnyElement, Key(http)]`.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix("$.").or_else(|| trimmed.strip_prefix('$')).unwrap_or(trimmed);
    let mut segments = Vec::new();
    if trimmed.is_empty() {
        return Ok(segments);
    }

    for part in trimmed.split('.') {
        if part.is_empty() {
            return Err(CoreError::InvalidPath {
                path: path.to_string(),
                message: "empty segment".to_string(),
            });
        }
        let mut rest = part;
        // Leading key, then any number of bracket suffixes.
        if let Some(idx) = rest.find(['[', '{']) {
            let (key, brackets) = rest.split_at(idx);
            if !key.is_empty() {
                segments.push(PathSegment::Key(key.to_string()));
            }
            rest = brackets;
        } else {
            segments.push(PathSegment::Key(rest.to_string()));
            continue;
        }
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix("[]") {
                segments.push(PathSegment::AnyElement);
                rest = after;
            } else if let Some(after) = rest.strip_prefix("{}") {
                segments.push(PathSegment::AnyValue);
                rest = after;
            } else if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(|| CoreError::InvalidPath {
                    path: path.to_string(),
                    message: "unterminated index".to_string(),
                })?;
                let index: usize = after[..end].parse().map_err(|_| CoreError::InvalidPath {
                    path: path.to_string(),
                    message: format!("invalid index '{}'", &after[..end]),
                })?;
                segments.push(PathSegment::Index(index));
                rest = &after[end + 1..];
            } else {
                return Err(CoreError::InvalidPath {
                    path: path.to_string(),
                    message: format!("unexpected characters '{rest}'"),
                });
            }
        }
    }
    Ok(segments)
}

/// Resolve a dotted path against a resource tree.
///
/// Arrays between segments fan out: every element is searched and matches
/// are collected. A path reaching exactly one value yields that value's
/// shape; multiple matches yield a `List`.
pub fn resolve(value: &Value, path: &str) -> Result<PathValue> {
    let segments = parse_path(path)?;
    let mut out = Vec::new();
    collect(value, &segments, &mut out);
    Ok(match out.len() {
        0 => PathValue::Absent,
        1 => classify(out.into_iter().next().unwrap()),
        _ => PathValue::List(out),
    })
}

/// Resolve and collapse to a plain value (`null` when absent).
pub fn resolve_value(value: &Value, path: &str) -> Result<Value> {
    Ok(resolve(value, path)?.into_value())
}

fn classify(value: Value) -> PathValue {
    match value {
        Value::Null => PathValue::Absent,
        Value::Array(items) => PathValue::List(items),
        Value::Object(map) => PathValue::Map(map),
        scalar => PathValue::Scalar(scalar),
    }
}

fn collect(value: &Value, segments: &[PathSegment], out: &mut Vec<Value>) {
    let Some(segment) = segments.first() else {
        if !value.is_null() {
            out.push(value.clone());
        }
        return;
    };
    let rest = &segments[1..];
    match segment {
        PathSegment::Key(key) => match value {
            Value::Object(map) => {
                if let Some(child) = map.get(key) {
                    collect(child, rest, out);
                }
            }
            // Transparent fan-out: the same segment applies to every element.
            Value::Array(items) => {
                for item in items {
                    collect(item, segments, out);
                }
            }
            _ => {}
        },
        PathSegment::Index(index) => {
            if let Value::Array(items) = value {
                if let Some(child) = items.get(*index) {
                    collect(child, rest, out);
                }
            }
        }
        PathSegment::AnyElement => match value {
            Value::Array(items) => {
                for item in items {
                    collect(item, rest, out);
                }
            }
            // A `[]` marker over a non-array is tolerated; match criteria
            // strip these markers when the tree is flatter than the path.
            _ => collect(value, rest, out),
        },
        PathSegment::AnyValue => match value {
            Value::Object(map) => {
                for child in map.values() {
                    collect(child, rest, out);
                }
            }
            _ => collect(value, rest, out),
        },
    }
}

/// Write `new_value` into `target` at `path`, creating intermediate objects
/// and arrays as needed. `[]` segments create an array and descend into
/// `element_index` (the iteration index for multi-resource template fills);
/// `{}` segments materialise an object.
pub fn set_value(target: &mut Value, path: &str, new_value: Value, element_index: usize) -> Result<()> {
    let segments = parse_path(path)?;
    if segments.is_empty() {
        *target = new_value;
        return Ok(());
    }
    set_segments(target, &segments, new_value, element_index, path)
}

fn set_segments(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
    element_index: usize,
    full_path: &str,
) -> Result<()> {
    let segment = &segments[0];
    let rest = &segments[1..];
    match segment {
        PathSegment::Key(key) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let map = target.as_object_mut().expect("object ensured above");
            let child = map.entry(key.clone()).or_insert(Value::Null);
            if rest.is_empty() {
                *child = new_value;
                Ok(())
            } else {
                set_segments(child, rest, new_value, element_index, full_path)
            }
        }
        PathSegment::Index(_) | PathSegment::AnyElement => {
            let index = match segment {
                PathSegment::Index(i) => *i,
                _ => element_index,
            };
            if !target.is_array() {
                *target = Value::Array(Vec::new());
            }
            let items = target.as_array_mut().expect("array ensured above");
            while items.len() <= index {
                items.push(Value::Null);
            }
            let child = &mut items[index];
            if rest.is_empty() {
                *child = new_value;
                Ok(())
            } else {
                if child.is_null() {
                    *child = Value::Object(Map::new());
                }
                set_segments(child, rest, new_value, element_index, full_path)
            }
        }
        PathSegment::AnyValue => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if rest.is_empty() {
                Ok(())
            } else {
                set_segments(target, rest, new_value, element_index, full_path)
            }
        }
    }
}

/// Translate a dotted path into a JSON Pointer for JSON-Patch documents.
/// `spec.template.spec.containers[0].image` becomes
/// `/spec/template/spec/containers/0/image`.
pub fn to_json_pointer(path: &str) -> Result<String> {
    let segments = parse_path(path)?;
    let mut pointer = String::new();
    for segment in &segments {
        match segment {
            PathSegment::Key(key) => {
                pointer.push('/');
                pointer.push_str(&key.replace('~', "~0").replace('/', "~1"));
            }
            PathSegment::Index(index) => {
                pointer.push('/');
                pointer.push_str(&index.to_string());
            }
            PathSegment::AnyElement | PathSegment::AnyValue => {
                return Err(CoreError::InvalidPath {
                    path: path.to_string(),
                    message: "wildcard segments cannot be addressed by a patch".to_string(),
                });
            }
        }
    }
    Ok(pointer)
}

/// Deep any-level containment between two resolved field values, the
/// predicate behind ExactMatch criteria. Scalars compare for equality (with
/// numeric cross-coercion), lists succeed when any element matches, maps
/// when any value matches, and nothing matches `null`.
pub fn fields_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Array(items), _) => items.iter().any(|item| fields_match(item, b)),
        (_, Value::Array(items)) => items.iter().any(|item| fields_match(a, item)),
        (Value::Object(map), _) => map.values().any(|v| fields_match(v, b)),
        (_, Value::Object(map)) => map.values().any(|v| fields_match(a, v)),
        (a, b) => scalars_equal(a, b),
    }
}

/// Scalar equality with numeric cross-coercion (`3` equals `3.0`).
pub fn scalars_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Map-subset test behind ContainsAll criteria: every key of `wanted` is
/// present in `labels` with an equal value. Empty maps on either side fail.
pub fn contains_all(labels: &Map<String, Value>, wanted: &Map<String, Value>) -> bool {
    if labels.is_empty() || wanted.is_empty() {
        return false;
    }
    wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
}
