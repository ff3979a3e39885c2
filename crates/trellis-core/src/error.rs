//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("node '{0}' has no kind")]
    MissingKind(String),

    #[error("duplicate node name '{0}' in clause")]
    DuplicateNodeName(String),

    #[error("failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
