//! Engine error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    Kube(#[from] trellis_kube::KubeError),

    #[error(transparent)]
    Core(#[from] trellis_core::CoreError),

    #[error("node '{0}' has no resource kind")]
    MissingKind(String),

    #[error("node '{0}' is not bound by a preceding MATCH or CREATE")]
    UnknownNode(String),

    #[error("no relationship rule links '{left}' and '{right}'")]
    NoRuleFound { left: String, right: String },

    #[error("node '{0}' combines a name with label selectors, which is not allowed")]
    SelectorConflict(String),

    #[error("cannot create node '{0}', it already holds matched resources")]
    NodeAlreadyExists(String),

    #[error("cannot create relationship between '{left}' and '{right}', both sides already exist")]
    BothSidesExist { left: String, right: String },

    #[error("creating both sides of a relationship ('{left}' and '{right}') is not yet supported")]
    NeitherSideExists { left: String, right: String },

    #[error("resource in node '{0}' has no metadata.name")]
    MissingName(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl EngineError {
    /// True for a benign "already exists" failure during CREATE; the
    /// operator logs these and carries on.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, EngineError::Kube(e) if e.is_already_exists())
    }
}
