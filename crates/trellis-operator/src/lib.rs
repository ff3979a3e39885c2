//! Trellis Operator - the dynamic operator runtime
//!
//! A `DynamicOperator` resource names a Kubernetes kind to watch and up to
//! three query programs to run on create / update / delete events. This
//! crate provides:
//! - the `DynamicOperator` CRD types
//! - the reconciler managing one watcher per operator object
//! - per-kind watchers dispatching events into the query executor
//! - `{{$.path}}` templating of event payloads into query text
//! - finalizer management on watched resources

pub mod controller;
pub mod crd;
pub mod error;
pub mod finalizer;
pub mod handler;
pub mod template;
pub mod watcher;

pub use controller::{Context, run};
pub use crd::{DynamicOperator, DynamicOperatorSpec, DynamicOperatorStatus, FINALIZER};
pub use error::{OperatorError, Result};
pub use handler::{EventHandlers, EventKind};
