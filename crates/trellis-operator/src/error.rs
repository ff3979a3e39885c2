//! Operator error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OperatorError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Provider(#[from] trellis_kube::KubeError),

    #[error(transparent)]
    Engine(#[from] trellis_engine::EngineError),

    #[error("query parse error: {0}")]
    Parse(#[from] trellis_parser::ParseError),

    #[error("invalid DynamicOperator spec: {0}")]
    InvalidSpec(String),

    #[error("watched resource has no metadata.name")]
    MissingName,
}
