//! Trellis Core - Core types for the Kubernetes graph-query engine
//!
//! This crate provides the foundational types used throughout Trellis:
//! - `ast`: The query AST (MATCH / WHERE / RETURN / SET / DELETE / CREATE)
//! - `rules`: Relationship rules between resource kinds and the static rule table
//! - `path`: Dotted-path resolution over resource JSON trees
//! - `result`: Query results and the result graph

pub mod ast;
pub mod error;
pub mod path;
pub mod result;
pub mod rules;

pub use ast::{
    Aggregate, Clause, ComparisonOperator, CreateClause, DeleteClause, Direction, Expression,
    KeyValuePair, MatchClause, NodePattern, Property, Relationship, ReturnClause, ReturnItem,
    SetClause,
};
pub use error::{CoreError, Result};
pub use path::{PathSegment, PathValue};
pub use result::{CreatedRef, GraphEdge, GraphNode, QueryResult, ResultGraph};
pub use rules::{
    ComparisonType, DefaultProp, MatchCriterion, RelationshipRule, RuleRegistry,
    NAMESPACE_RELATIONSHIP_TYPE,
};
