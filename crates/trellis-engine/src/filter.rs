//! WHERE-filter evaluation
//!
//! Resolves the filter path against a resource and compares with numeric
//! cross-coercion (via f64) where possible and string comparison as the
//! fallback. Paths fanning out over arrays succeed when any leaf satisfies
//! the operator.

use serde_json::Value;

use trellis_core::ast::{ComparisonOperator, KeyValuePair};
use trellis_core::path::{self, PathValue};

/// Evaluate one WHERE filter against one resource. The filter key's node
/// prefix must already be stripped.
pub fn evaluate(resource: &Value, resource_path: &str, filter: &KeyValuePair) -> bool {
    let Ok(resolved) = path::resolve(resource, resource_path) else {
        return false;
    };
    match resolved {
        PathValue::Scalar(actual) => compare(&actual, filter.operator, &filter.value),
        PathValue::List(items) => items.iter().any(|v| compare(v, filter.operator, &filter.value)),
        PathValue::Map(map) => compare(&Value::Object(map), filter.operator, &filter.value),
        PathValue::Absent => false,
    }
}

fn compare(actual: &Value, operator: ComparisonOperator, expected: &Value) -> bool {
    match operator {
        ComparisonOperator::Equals => loosely_equal(actual, expected),
        ComparisonOperator::NotEquals => !loosely_equal(actual, expected),
        ComparisonOperator::GreaterThan => ordering(actual, expected).is_some_and(|o| o.is_gt()),
        ComparisonOperator::LessThan => ordering(actual, expected).is_some_and(|o| o.is_lt()),
        ComparisonOperator::GreaterThanEquals => ordering(actual, expected).is_some_and(|o| o.is_ge()),
        ComparisonOperator::LessThanEquals => ordering(actual, expected).is_some_and(|o| o.is_le()),
        ComparisonOperator::Contains => match (actual.as_str(), expected.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
        ComparisonOperator::RegexCompare => match expected.as_str() {
            Some(pattern) => regex::Regex::new(pattern)
                .map(|re| re.is_match(&string_form(actual)))
                .unwrap_or(false),
            None => false,
        },
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a == b;
    }
    // String fallback: "3" equals 3, "true" equals true.
    string_form(actual) == string_form(expected)
}

fn ordering(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&b);
    }
    Some(string_form(actual).cmp(&string_form(expected)))
}

/// The string form used for coercion and templating output: bare strings
/// stay unquoted, everything else serialises as JSON.
pub fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kvp(operator: ComparisonOperator, value: Value) -> KeyValuePair {
        KeyValuePair {
            key: "x.unused".to_string(),
            value,
            operator,
        }
    }

    fn pod() -> Value {
        json!({
            "metadata": {"name": "web-0", "namespace": "prod"},
            "spec": {
                "replicas": 3,
                "containers": [{"image": "nginx:1.27"}, {"image": "redis:7"}],
            }
        })
    }

    #[test]
    fn test_equals_and_not_equals() {
        assert!(evaluate(&pod(), "metadata.name", &kvp(ComparisonOperator::Equals, json!("web-0"))));
        assert!(!evaluate(&pod(), "metadata.name", &kvp(ComparisonOperator::Equals, json!("web-1"))));
        assert!(evaluate(&pod(), "metadata.name", &kvp(ComparisonOperator::NotEquals, json!("web-1"))));
    }

    #[test]
    fn test_numeric_coercion() {
        assert!(evaluate(&pod(), "spec.replicas", &kvp(ComparisonOperator::Equals, json!(3.0))));
        assert!(evaluate(&pod(), "spec.replicas", &kvp(ComparisonOperator::GreaterThan, json!(2))));
        assert!(evaluate(&pod(), "spec.replicas", &kvp(ComparisonOperator::LessThanEquals, json!(3))));
        assert!(!evaluate(&pod(), "spec.replicas", &kvp(ComparisonOperator::LessThan, json!(3))));
    }

    #[test]
    fn test_string_fallback_comparison() {
        let resource = json!({"spec": {"replicas": "3"}});
        assert!(evaluate(&resource, "spec.replicas", &kvp(ComparisonOperator::Equals, json!(3))));
    }

    #[test]
    fn test_contains() {
        assert!(evaluate(
            &pod(),
            "spec.containers[0].image",
            &kvp(ComparisonOperator::Contains, json!("nginx"))
        ));
        assert!(!evaluate(
            &pod(),
            "spec.containers[0].image",
            &kvp(ComparisonOperator::Contains, json!("postgres"))
        ));
    }

    #[test]
    fn test_regex_compare() {
        assert!(evaluate(
            &pod(),
            "metadata.name",
            &kvp(ComparisonOperator::RegexCompare, json!("^web-[0-9]+$"))
        ));
        assert!(!evaluate(
            &pod(),
            "metadata.name",
            &kvp(ComparisonOperator::RegexCompare, json!("^db-"))
        ));
        // An invalid pattern never matches.
        assert!(!evaluate(
            &pod(),
            "metadata.name",
            &kvp(ComparisonOperator::RegexCompare, json!("("))
        ));
    }

    #[test]
    fn test_fanned_out_path_any_semantics() {
        assert!(evaluate(
            &pod(),
            "spec.containers[].image",
            &kvp(ComparisonOperator::Equals, json!("redis:7"))
        ));
    }

    #[test]
    fn test_absent_path_never_matches() {
        assert!(!evaluate(&pod(), "spec.missing", &kvp(ComparisonOperator::Equals, json!(null))));
        assert!(!evaluate(&pod(), "spec.missing", &kvp(ComparisonOperator::NotEquals, json!("x"))));
    }
}
