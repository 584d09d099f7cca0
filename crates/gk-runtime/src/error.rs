// error.rs - Error types for building and configuring the interceptor.
//
// Enforcement outcomes (deny, rejection, tool failure, timeout) are not
// errors: `intercept` always returns an ExecutionOutcome. These variants
// cover setup only.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config parse error in {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    /// Config files must end in .yaml, .yml or .toml.
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error(transparent)]
    Policy(#[from] gk_policy::PolicyError),

    #[error(transparent)]
    Trace(#[from] gk_trace::TraceError),
}
