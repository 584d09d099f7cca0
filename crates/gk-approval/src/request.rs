// request.rs - ApprovalRequest and its status state machine.
//
// The status machine is deliberately tiny:
//   Pending → Approved | Rejected | Expired
// Terminal statuses never change again. Cancellation by an operator is a
// Rejected transition with `cancelled` set, so it stays distinguishable in
// the trace while counting as a rejection everywhere else.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gk_policy::{Action, Decision};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApprovalError;

/// Lifecycle status of an approval request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Rejected => write!(f, "rejected"),
            ApprovalStatus::Expired => write!(f, "expired"),
        }
    }
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    /// Only Pending may move, and only to a terminal status.
    pub fn can_transition_to(&self, next: ApprovalStatus) -> bool {
        matches!(self, ApprovalStatus::Pending) && next.is_terminal()
    }
}

/// The verdict an external approver supplies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
}

impl From<ApprovalOutcome> for ApprovalStatus {
    fn from(outcome: ApprovalOutcome) -> Self {
        match outcome {
            ApprovalOutcome::Approved => ApprovalStatus::Approved,
            ApprovalOutcome::Rejected => ApprovalStatus::Rejected,
        }
    }
}

/// A pending (or resolved) request for human sign-off on one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub action: Action,
    pub decision: Decision,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved the request, when an approver identified themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// True when an operator revoked the action while it was pending.
    #[serde(default)]
    pub cancelled: bool,
}

impl ApprovalRequest {
    /// Create a Pending request that expires `ttl` after `now`.
    pub fn new(
        action: Action,
        decision: Decision,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, ApprovalError> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| ApprovalError::InvalidTtl(format!("{:?}", ttl)))?;
        Ok(Self {
            id: Uuid::new_v4(),
            action,
            decision,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at,
            resolved_at: None,
            resolved_by: None,
            note: None,
            cancelled: false,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Move to a terminal status. Fails if the request is already terminal.
    pub(crate) fn transition(
        &mut self,
        next: ApprovalStatus,
        resolved_by: Option<String>,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ApprovalError> {
        if !self.status.can_transition_to(next) {
            return Err(ApprovalError::AlreadyResolved {
                id: self.id,
                status: self.status,
            });
        }
        self.status = next;
        self.resolved_at = Some(now);
        self.resolved_by = resolved_by;
        self.note = note;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_policy::{DecisionEffect, EvaluationContext, PolicySet};

    fn test_request(ttl: Duration) -> ApprovalRequest {
        let action = Action::builder("send_email").caller("agent-1").build();
        let now = Utc::now();
        let decision = gk_policy::evaluate(
            &action,
            &PolicySet::deny_all("t"),
            &EvaluationContext::unmetered(now),
        )
        .unwrap();
        ApprovalRequest::new(action, decision, ttl, now).unwrap()
    }

    #[test]
    fn new_request_is_pending() {
        let req = test_request(Duration::from_secs(30));
        assert_eq!(req.status, ApprovalStatus::Pending);
        assert!(req.resolved_at.is_none());
        assert_eq!(req.decision.effect, DecisionEffect::Deny);
        assert_eq!(req.expires_at - req.created_at, chrono::Duration::seconds(30));
    }

    #[test]
    fn pending_moves_to_any_terminal_status() {
        for next in [
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Expired,
        ] {
            let mut req = test_request(Duration::from_secs(30));
            req.transition(next, None, None, Utc::now()).unwrap();
            assert_eq!(req.status, next);
            assert!(req.resolved_at.is_some());
        }
    }

    #[test]
    fn terminal_status_never_changes() {
        let mut req = test_request(Duration::from_secs(30));
        req.transition(ApprovalStatus::Rejected, Some("ops".into()), None, Utc::now())
            .unwrap();
        let err = req
            .transition(ApprovalStatus::Approved, None, None, Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            ApprovalError::AlreadyResolved {
                id: req.id,
                status: ApprovalStatus::Rejected
            }
        );
        assert_eq!(req.status, ApprovalStatus::Rejected);
        assert_eq!(req.resolved_by.as_deref(), Some("ops"));
    }

    #[test]
    fn pending_is_not_a_valid_target() {
        assert!(!ApprovalStatus::Pending.can_transition_to(ApprovalStatus::Pending));
        assert!(!ApprovalStatus::Expired.can_transition_to(ApprovalStatus::Approved));
    }

    #[test]
    fn expiry_check_uses_supplied_clock() {
        let req = test_request(Duration::from_secs(1));
        assert!(!req.is_expired_at(req.created_at));
        assert!(req.is_expired_at(req.expires_at));
    }

    #[test]
    fn status_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&ApprovalStatus::Expired).unwrap(),
            "\"expired\""
        );
    }
}
