// event.rs - Trace event data model.
//
// Each lifecycle step of an action (decision, approval request and
// resolution, execution attempt and completion) becomes one TraceEvent.
// Events carry a per-action sequence number assigned by the recorder and
// are never modified after they are committed.

use std::fmt;

use chrono::{DateTime, Utc};
use gk_approval::ApprovalStatus;
use gk_policy::DecisionEffect;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Final classification of an action's execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    ToolError,
    PolicyViolation,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    /// ToolError and Timeout may be retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionStatus::ToolError | ExecutionStatus::Timeout)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::ToolError => "tool_error",
            ExecutionStatus::PolicyViolation => "policy_violation",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What happened, with the data specific to that step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEventKind {
    DecisionRecorded {
        effect: DecisionEffect,
        matched_rule_id: Option<String>,
        policy_version: u64,
        reason: String,
    },
    ApprovalRequested {
        request_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    ApprovalResolved {
        request_id: Uuid,
        status: ApprovalStatus,
        #[serde(default)]
        cancelled: bool,
    },
    ExecutionAttempted {
        attempt: u32,
    },
    ExecutionCompleted {
        /// Attempts made before completion. Zero when the tool never ran.
        attempt: u32,
        status: ExecutionStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_detail: Option<String>,
    },
}

impl TraceEventKind {
    pub fn event_type(&self) -> TraceEventType {
        match self {
            TraceEventKind::DecisionRecorded { .. } => TraceEventType::DecisionRecorded,
            TraceEventKind::ApprovalRequested { .. } => TraceEventType::ApprovalRequested,
            TraceEventKind::ApprovalResolved { .. } => TraceEventType::ApprovalResolved,
            TraceEventKind::ExecutionAttempted { .. } => TraceEventType::ExecutionAttempted,
            TraceEventKind::ExecutionCompleted { .. } => TraceEventType::ExecutionCompleted,
        }
    }
}

/// Payload-free discriminant of [`TraceEventKind`], used for filtering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    DecisionRecorded,
    ApprovalRequested,
    ApprovalResolved,
    ExecutionAttempted,
    ExecutionCompleted,
}

impl fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TraceEventType::DecisionRecorded => "decision_recorded",
            TraceEventType::ApprovalRequested => "approval_requested",
            TraceEventType::ApprovalResolved => "approval_resolved",
            TraceEventType::ExecutionAttempted => "execution_attempted",
            TraceEventType::ExecutionCompleted => "execution_completed",
        };
        f.write_str(s)
    }
}

/// One committed lifecycle step. One line in a JSONL trace file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub event_id: Uuid,
    pub action_id: Uuid,
    /// Position in this action's lifecycle, contiguous from 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: TraceEventKind,
    /// Hash of the preceding line when written by a chaining sink such as
    /// [`JsonlSink`](crate::JsonlSink). None for the first line and for
    /// events held in memory.
    #[serde(default)]
    pub previous_hash: Option<String>,
}

impl TraceEvent {
    pub(crate) fn new(action_id: Uuid, sequence: u64, kind: TraceEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            action_id,
            sequence,
            timestamp: Utc::now(),
            kind,
            previous_hash: None,
        }
    }

    pub fn event_type(&self) -> TraceEventType {
        self.kind.event_type()
    }
}
