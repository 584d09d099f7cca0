// outcome.rs - What an intercepted action produced, and how tools report failure.

use std::time::Duration;

use gk_trace::ExecutionStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Why a PolicyViolation outcome was blocked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A rule (or the default effect) denied the action.
    Denied,
    /// An approver rejected the request.
    Rejected,
    /// Nobody resolved the approval request before its deadline.
    Expired,
    /// The caller's rate-limit budget is exhausted.
    RateLimited,
    /// The policy could not be evaluated; denied fail-closed.
    Misconfigured,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::Denied => "denied",
            ViolationKind::Rejected => "rejected",
            ViolationKind::Expired => "expired",
            ViolationKind::RateLimited => "rate_limited",
            ViolationKind::Misconfigured => "misconfigured",
        };
        f.write_str(s)
    }
}

/// A failure reported by the wrapped tool.
///
/// Retryable failures are retried per the [`RetryPolicy`](crate::RetryPolicy);
/// permanent ones end the action immediately with ToolError.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ToolFailure {
    pub message: String,
    pub retryable: bool,
}

impl ToolFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Handed to the tool on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    pub action_id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// One finished invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// How an action ended. Every intercepted action yields exactly one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutcome {
    pub action_id: Uuid,
    /// Number of invocations made. Zero when policy blocked the action.
    pub attempt_number: u32,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Wall time from interception to completion.
    pub duration_ms: u64,
    /// Set only when `status` is PolicyViolation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<ViolationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<Uuid>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Trace events that could not be recorded. The outcome itself stands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace_warnings: Vec<String>,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// True when policy, not the tool, stopped the action.
    pub fn is_policy_violation(&self) -> bool {
        self.status == ExecutionStatus::PolicyViolation
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// The terminal result an adapter or the retry loop reports for an action.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub result_payload: Option<serde_json::Value>,
    pub error_detail: Option<String>,
    pub violation: Option<ViolationKind>,
}

impl Completion {
    pub fn success(payload: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Success,
            result_payload: Some(payload),
            error_detail: None,
            violation: None,
        }
    }

    pub fn tool_error(detail: impl Into<String>) -> Self {
        Self::failed(ExecutionStatus::ToolError, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::failed(ExecutionStatus::Timeout, detail)
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::failed(ExecutionStatus::Cancelled, detail)
    }

    pub fn violation(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            violation: Some(kind),
            ..Self::failed(ExecutionStatus::PolicyViolation, detail)
        }
    }

    fn failed(status: ExecutionStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            result_payload: None,
            error_detail: Some(detail.into()),
            violation: None,
        }
    }
}
