//! The cluster boundary
//!
//! Every cluster interaction in Trellis goes through this trait, so the
//! engine can run against the real API server (`ApiProvider`) or an
//! in-memory fixture (`MockProvider`) without caring which.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::gvr::ResourceSpec;

/// Abstraction over one cluster (or one kubeconfig context).
///
/// Resource bodies are plain JSON trees. `kind` arguments accept every
/// alias resolution knows: kind, plural, singular, short name, or the
/// qualified `resource.group` form.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Resolve a kind name to its `(group, version, resource)` triple.
    async fn find_gvr(&self, kind: &str) -> Result<ResourceSpec>;

    /// List resources of a kind, unwrapped to plain JSON dictionaries.
    async fn get_resources(
        &self,
        kind: &str,
        field_selector: Option<&str>,
        label_selector: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>>;

    /// Fetch a single resource by name.
    async fn get_resource(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Value>;

    /// Create a resource from a full body (apiVersion/kind/metadata included).
    async fn create_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        body: Value,
    ) -> Result<()>;

    /// Delete a resource by name.
    async fn delete_resource(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<()>;

    /// Apply a JSON-Patch document. The provider may rewrite specific patch
    /// shapes into strategic merges (see [`crate::patch`]).
    async fn patch_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        patch: Value,
    ) -> Result<()>;

    /// Replace a resource with a full body; returns the stored object.
    async fn update_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        body: Value,
    ) -> Result<Value>;

    /// Whether the kind is namespace-scoped. Cached by the implementation.
    async fn is_namespaced(&self, kind: &str) -> Result<bool>;

    /// Flattened OpenAPI field paths per resource plural. Fetched lazily and
    /// memoised for the provider's lifetime.
    async fn open_api_field_paths(&self) -> Result<BTreeMap<String, Vec<String>>>;

    /// A sibling provider bound to a different kubeconfig context.
    async fn for_context(&self, context: &str) -> Result<Arc<dyn Provider>>;

    /// Toggle the process-wide dry-run flag; when set, every mutation
    /// carries the server dry-run directive.
    fn set_dry_run(&self, enabled: bool);

    /// Current dry-run state.
    fn dry_run(&self) -> bool;
}
