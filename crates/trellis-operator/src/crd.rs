//! The DynamicOperator custom resource

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};

/// Finalizer managed on watched resources and on operator objects.
pub const FINALIZER: &str = "dynamicoperator.trellis.dev/finalizer";

/// Declares a watch on a resource kind and the query programs to run on
/// its lifecycle events. At least one of `onCreate` / `onUpdate` /
/// `onDelete` must be set.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[kube(
    group = "trellis.dev",
    version = "v1",
    kind = "DynamicOperator",
    namespaced,
    status = "DynamicOperatorStatus",
    shortname = "dynop",
    printcolumn = r#"{"name":"Kind", "type":"string", "jsonPath":".spec.resourceKind"}"#,
    printcolumn = r#"{"name":"Watchers", "type":"integer", "jsonPath":".status.activeWatchers"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DynamicOperatorSpec {
    /// Resource kind to watch: kind, plural, short name, or `resource.group`.
    pub resource_kind: String,

    /// Namespace scope for the watch; cluster-wide when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Program executed when a watched resource appears.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_create: Option<String>,

    /// Program executed when a watched resource changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<String>,

    /// Program executed when a watched resource is deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,

    /// Manage a finalizer on watched resources so `onDelete` always runs
    /// before they disappear.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer: Option<bool>,

    /// Execute every mutation with the server dry-run directive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicOperatorStatus {
    /// Number of watchers this controller currently runs.
    #[serde(default)]
    pub active_watchers: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_query: Option<String>,

    /// RFC3339 timestamp of the last program execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_time: Option<String>,
}

impl DynamicOperatorSpec {
    pub fn validate(&self) -> Result<()> {
        if self.resource_kind.trim().is_empty() {
            return Err(OperatorError::InvalidSpec(
                "resourceKind must not be empty".to_string(),
            ));
        }
        if self.on_create.is_none() && self.on_update.is_none() && self.on_delete.is_none() {
            return Err(OperatorError::InvalidSpec(
                "at least one of onCreate, onUpdate, onDelete must be set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wants_finalizer(&self) -> bool {
        self.finalizer.unwrap_or(false)
    }

    pub fn wants_dry_run(&self) -> bool {
        self.dry_run.unwrap_or(false)
    }
}
