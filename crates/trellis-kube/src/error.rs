//! Error types for trellis-kube

use thiserror::Error;

/// Result type for trellis-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur during Kubernetes operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// No resource kind matches the given name
    #[error("resource kind '{name}' not found")]
    GvrNotFound { name: String },

    /// A bare name matches resource kinds in several groups
    #[error("resource kind '{name}' is ambiguous, qualify it as one of: {}", candidates.join(", "))]
    AmbiguousKind { name: String, candidates: Vec<String> },

    /// Discovery against the API server failed
    #[error("discovery error: {0}")]
    Discovery(String),

    /// OpenAPI schema retrieval or traversal failed
    #[error("OpenAPI error: {0}")]
    OpenApi(String),

    /// A patch document could not be understood or applied
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Client configuration error (kubeconfig, context)
    #[error("configuration error: {0}")]
    Config(String),

    /// Core path/type error
    #[error(transparent)]
    Core(#[from] trellis_core::CoreError),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Check if this is a conflict error (409 with reason Conflict)
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409 && resp.reason != "AlreadyExists")
    }

    /// Check if this is an "already exists" error (409 with reason AlreadyExists)
    pub fn is_already_exists(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.reason == "AlreadyExists")
    }
}

/// Build a kube API error with the given code and reason, for mocks and
/// synthetic failures.
pub(crate) fn api_error(code: u16, reason: &str, message: String) -> KubeError {
    KubeError::Api(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}
