//! # gk-runtime
//!
//! The execution interceptor: the one place where policy, approval,
//! retries and tracing meet.
//!
//! ```text
//! adapter ─► Interceptor::intercept ─► evaluate ─► (ApprovalBroker) ─► tool ─► TraceRecorder
//! ```
//!
//! Every call to [`Interceptor::intercept`] returns an [`ExecutionOutcome`].
//! Policy blocks are `PolicyViolation` outcomes, distinct from tool
//! failures, so adapters can tell "blocked" from "broken".

pub mod config;
pub mod error;
pub mod interceptor;
pub mod outcome;
pub mod retry;

pub use config::EngineConfig;
pub use error::RuntimeError;
pub use interceptor::{
    ActionRun, Authorization, Interceptor, DEFAULT_APPROVAL_RETENTION, DEFAULT_APPROVAL_TTL,
};
pub use outcome::{
    AttemptContext, AttemptRecord, Completion, ExecutionOutcome, ToolFailure, ViolationKind,
};
pub use retry::RetryPolicy;

// Re-exported so adapters and tests can name trace statuses without a
// direct gk-trace dependency.
pub use gk_trace::ExecutionStatus;
