//! JSONPath templating of event payloads
//!
//! Every `{{$.path.to.value}}` occurrence in a program is substituted with
//! the value found at that path in the event object, before parsing.
//! Scalars render bare, structured values render as JSON text. Expressions
//! that do not parse or do not resolve are left literally in place.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use trellis_core::path;

static EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("template expression pattern is valid"));

/// Render a program against an event object.
pub fn render(program: &str, event: &Value) -> String {
    EXPRESSION
        .replace_all(program, |caps: &regex::Captures<'_>| {
            let expression = caps[1].trim();
            match path::resolve(event, expression) {
                Ok(resolved) if !resolved.is_absent() => string_form(&resolved.into_value()),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Value {
        json!({
            "metadata": {"name": "sample", "namespace": "prod", "labels": {"app": "x"}},
            "spec": {"replicas": 3, "enabled": true},
        })
    }

    #[test]
    fn test_render_scalar_paths() {
        assert_eq!(
            render("CREATE (d:Deployment {name: \"child-of-{{$.metadata.name}}\"})", &event()),
            "CREATE (d:Deployment {name: \"child-of-sample\"})"
        );
        assert_eq!(render("{{$.spec.replicas}}", &event()), "3");
        assert_eq!(render("{{$.spec.enabled}}", &event()), "true");
    }

    #[test]
    fn test_render_structured_value_as_json() {
        assert_eq!(render("{{$.metadata.labels}}", &event()), r#"{"app":"x"}"#);
    }

    #[test]
    fn test_render_multiple_occurrences() {
        let out = render("{{$.metadata.namespace}}/{{$.metadata.name}}", &event());
        assert_eq!(out, "prod/sample");
    }

    #[test]
    fn test_unresolvable_expression_left_in_place() {
        let program = "name is {{$.metadata.missing}}";
        assert_eq!(render(program, &event()), program);
    }

    #[test]
    fn test_invalid_expression_left_in_place() {
        let program = "broken {{$..}} stays";
        assert_eq!(render(program, &event()), program);
    }

    #[test]
    fn test_text_without_expressions_untouched() {
        let program = "MATCH (d:Deployment) RETURN d";
        assert_eq!(render(program, &event()), program);
    }
}
