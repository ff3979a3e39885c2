//! Trellis Kube - Kubernetes integration for Trellis
//!
//! This crate provides:
//! - **Provider**: the sole boundary against a cluster - list, create,
//!   delete and patch resources through one trait
//! - **GVR resolution**: kind / plural / singular / short-name lookup with
//!   ambiguity detection
//! - **OpenAPI inspection**: flattened field paths per resource kind
//! - **Rule synthesis**: relationship rules inferred from `*Name` / `*Ref` /
//!   `*KeyRef` schema fields
//! - **MockProvider**: in-memory cluster fixture for unit tests

pub mod api;
pub mod error;
pub mod gvr;
pub mod mock;
pub mod openapi;
pub mod patch;
pub mod provider;
pub mod synth;

pub use api::ApiProvider;
pub use error::{KubeError, Result};
pub use gvr::{GvrResolver, ResourceSpec};
pub use mock::{MockProvider, OperationCounts};
pub use provider::Provider;
pub use synth::synthesise_rules;
