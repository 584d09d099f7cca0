// error.rs - Error types for trace recording and trace files.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while recording or reading traces.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Failed to open or create a trace file.
    #[error("failed to open trace log at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write an event to a sink.
    #[error("failed to write trace event: {0}")]
    WriteFailed(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The JSONL hash chain is broken at `line`.
    #[error("integrity check failed at line {line}: expected hash {expected}, got {actual}")]
    IntegrityViolation {
        line: usize,
        expected: String,
        actual: String,
    },

    /// A sink refused the event for a reason other than I/O.
    #[error("trace sink unavailable: {0}")]
    SinkUnavailable(String),
}
