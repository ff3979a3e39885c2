//! Trellis Engine - the query executor
//!
//! Evaluates a parsed expression against a cluster provider:
//! - **MATCH**: materialises node result sets and narrows them through
//!   relationship rules until a fixed point
//! - **WHERE**: per-resource filters with numeric coercion and regex support
//! - **SET**: JSON-Patch mutations mirrored into the in-memory results
//! - **DELETE**: per-resource deletion
//! - **CREATE**: standalone and relationship-driven creation with template
//!   fill-in and owner references
//! - **RETURN**: output assembly with aliases and aggregates
//!
//! All working state lives in a per-call `ExecutionContext`; concurrent
//! `execute` calls never interfere.

pub mod context;
pub mod create;
pub mod error;
pub mod executor;
pub mod filter;
pub mod graph;
pub mod match_phase;
pub mod mutate;
pub mod owner_ref;
pub mod ret;

pub use context::ExecutionContext;
pub use error::{EngineError, Result};
pub use executor::QueryExecutor;
pub use owner_ref::attach_owner_references;
