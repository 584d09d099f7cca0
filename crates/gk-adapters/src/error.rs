// error.rs - Error types for the adapter layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Framework metadata that cannot be compiled into rules.
    #[error("invalid policy metadata: {0}")]
    InvalidMetadata(String),

    /// Compiled rules failed policy validation.
    #[error(transparent)]
    Policy(#[from] gk_policy::PolicyError),

    #[error(transparent)]
    Runtime(#[from] gk_runtime::RuntimeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
