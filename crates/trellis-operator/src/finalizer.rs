//! Finalizer management on watched resources
//!
//! The finalizer is added after a successful `onCreate` run (when the
//! operator asks for it) and removed after `onDelete` through a
//! GET-modify-UPDATE loop with bounded conflict retries. A resource that
//! is already gone counts as success.

use serde_json::{Value, json};
use tracing::debug;

use trellis_kube::Provider;

use crate::crd::FINALIZER;
use crate::error::{OperatorError, Result};

const MAX_ATTEMPTS: u32 = 3;

/// Add the finalizer to a watched resource, if not present.
pub async fn add(provider: &dyn Provider, resource: &str, object: &Value) -> Result<()> {
    let (name, namespace) = identity(object)?;
    for attempt in 1..=MAX_ATTEMPTS {
        let mut current = match provider.get_resource(resource, &name, namespace.as_deref()).await {
            Ok(current) => current,
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        let mut finalizers = current["metadata"]["finalizers"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        if finalizers.iter().any(|f| f.as_str() == Some(FINALIZER)) {
            return Ok(());
        }
        finalizers.push(json!(FINALIZER));
        current["metadata"]["finalizers"] = Value::Array(finalizers);
        match provider
            .update_resource(resource, &name, namespace.as_deref(), current)
            .await
        {
            Ok(_) => return Ok(()),
            Err(error) if error.is_conflict() && attempt < MAX_ATTEMPTS => {
                debug!(resource, name = %name, attempt, "finalizer add conflicted, retrying");
            }
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}

/// Remove the finalizer from a watched resource. "Already deleted" on the
/// GET is success; conflicts retry up to three times.
pub async fn remove(provider: &dyn Provider, resource: &str, object: &Value) -> Result<()> {
    let (name, namespace) = identity(object)?;
    let mut last_error = None;
    for attempt in 1..=MAX_ATTEMPTS {
        let mut current = match provider.get_resource(resource, &name, namespace.as_deref()).await {
            Ok(current) => current,
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        let original = current["metadata"]["finalizers"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let filtered: Vec<Value> = original
            .iter()
            .filter(|f| f.as_str() != Some(FINALIZER))
            .cloned()
            .collect();
        if filtered.len() == original.len() {
            return Ok(());
        }
        current["metadata"]["finalizers"] = Value::Array(filtered);
        match provider
            .update_resource(resource, &name, namespace.as_deref(), current)
            .await
        {
            Ok(_) => return Ok(()),
            Err(error) if error.is_conflict() && attempt < MAX_ATTEMPTS => {
                debug!(resource, name = %name, attempt, "finalizer removal conflicted, retrying");
                last_error = Some(error);
            }
            Err(error) => return Err(error.into()),
        }
    }
    match last_error {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

fn identity(object: &Value) -> Result<(String, Option<String>)> {
    let name = object["metadata"]["name"]
        .as_str()
        .ok_or(OperatorError::MissingName)?
        .to_string();
    let namespace = object["metadata"]["namespace"].as_str().map(str::to_string);
    Ok((name, namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_kube::MockProvider;

    fn widget(finalizers: Value) -> Value {
        json!({
            "metadata": {
                "name": "sample",
                "namespace": "prod",
                "finalizers": finalizers,
            }
        })
    }

    #[tokio::test]
    async fn test_add_finalizer_once() {
        let provider = MockProvider::new();
        provider.insert("configmaps", json!({"metadata": {"name": "sample", "namespace": "prod"}}));
        let object = json!({"metadata": {"name": "sample", "namespace": "prod"}});

        add(&provider, "configmaps", &object).await.unwrap();
        add(&provider, "configmaps", &object).await.unwrap();

        let stored = provider.stored("configmaps");
        let finalizers = stored[0]["metadata"]["finalizers"].as_array().unwrap();
        assert_eq!(finalizers.len(), 1);
        assert_eq!(finalizers[0], json!(FINALIZER));
        // Second add saw the finalizer and issued no update.
        assert_eq!(provider.operation_counts().updates, 1);
    }

    #[tokio::test]
    async fn test_add_on_deleted_resource_is_success() {
        let provider = MockProvider::new();
        let object = json!({"metadata": {"name": "ghost", "namespace": "prod"}});
        add(&provider, "configmaps", &object).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_finalizer() {
        let provider = MockProvider::new();
        provider.insert("configmaps", widget(json!([FINALIZER, "other/finalizer"])));
        let object = widget(json!([FINALIZER]));

        remove(&provider, "configmaps", &object).await.unwrap();

        let stored = provider.stored("configmaps");
        let finalizers = stored[0]["metadata"]["finalizers"].as_array().unwrap();
        assert_eq!(finalizers.len(), 1);
        assert_eq!(finalizers[0], json!("other/finalizer"));
    }

    #[tokio::test]
    async fn test_remove_when_absent_is_noop() {
        let provider = MockProvider::new();
        provider.insert("configmaps", widget(json!([])));
        remove(&provider, "configmaps", &widget(json!([]))).await.unwrap();
        assert_eq!(provider.operation_counts().updates, 0);
    }

    #[tokio::test]
    async fn test_remove_on_deleted_resource_is_success() {
        let provider = MockProvider::new();
        remove(&provider, "configmaps", &widget(json!([FINALIZER]))).await.unwrap();
    }
}
