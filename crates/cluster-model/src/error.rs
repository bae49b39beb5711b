//! Model errors

use thiserror::Error;

/// Errors raised while parsing or validating model documents
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML document could not be parsed or produced
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON document could not be parsed or produced
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Document parsed but violates a model invariant
    #[error("Validation failed: {0}")]
    Validation(String),
}
