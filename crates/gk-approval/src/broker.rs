// broker.rs - Owns approval request state and wakes waiting actions.
//
// Every status change goes through `transition()` while holding the broker
// lock, which gives compare-and-swap semantics: of several concurrent
// resolve / cancel / expire calls on one request, exactly one observes
// Pending and wins; the rest get AlreadyResolved.
//
// Waiters subscribe to a per-request `watch` channel. The winner publishes
// the terminal status while still holding the lock. The channel keeps the
// latest value, so a waiter that subscribes late still sees it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gk_policy::{Action, Decision};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::ApprovalError;
use crate::request::{ApprovalOutcome, ApprovalRequest, ApprovalStatus};

struct Entry {
    request: ApprovalRequest,
    notify: watch::Sender<ApprovalStatus>,
}

/// Tracks approval requests from creation to a terminal status.
#[derive(Default)]
pub struct ApprovalBroker {
    requests: Mutex<HashMap<Uuid, Entry>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a Pending request for `action`, expiring after `ttl`.
    pub fn request_approval(
        &self,
        action: Action,
        decision: Decision,
        ttl: Duration,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let request = ApprovalRequest::new(action, decision, ttl, Utc::now())?;
        let (notify, _) = watch::channel(ApprovalStatus::Pending);
        tracing::info!(
            request_id = %request.id,
            action_id = %request.action.action_id(),
            tool = %request.action.tool_name(),
            expires_at = %request.expires_at,
            "approval requested"
        );
        self.lock().insert(
            request.id,
            Entry {
                request: request.clone(),
                notify,
            },
        );
        Ok(request)
    }

    /// Apply an approver's verdict.
    pub fn resolve(
        &self,
        request_id: Uuid,
        outcome: ApprovalOutcome,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.transition(request_id, outcome.into(), None, None, false)
    }

    /// Apply an approver's verdict, recording who gave it and why.
    pub fn resolve_as(
        &self,
        request_id: Uuid,
        outcome: ApprovalOutcome,
        approver: impl Into<String>,
        note: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.transition(request_id, outcome.into(), Some(approver.into()), note, false)
    }

    /// Revoke a pending request. The request becomes Rejected with
    /// `cancelled` set, and its waiter is released.
    pub fn cancel(
        &self,
        request_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.transition(
            request_id,
            ApprovalStatus::Rejected,
            None,
            Some(reason.into()),
            true,
        )
    }

    /// Revoke every pending request belonging to one action.
    pub fn cancel_action(&self, action_id: Uuid, reason: &str) -> Vec<ApprovalRequest> {
        let ids: Vec<Uuid> = self
            .lock()
            .values()
            .filter(|e| {
                e.request.action.action_id() == action_id
                    && e.request.status == ApprovalStatus::Pending
            })
            .map(|e| e.request.id)
            .collect();
        // A concurrent resolution may win between listing and cancelling;
        // those requests are simply skipped.
        ids.into_iter()
            .filter_map(|id| self.cancel(id, reason).ok())
            .collect()
    }

    /// Expire every Pending request whose deadline is at or before `now`.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        let mut requests = self.lock();
        let mut expired = Vec::new();
        for entry in requests.values_mut() {
            if entry.request.status != ApprovalStatus::Pending || !entry.request.is_expired_at(now) {
                continue;
            }
            if Self::apply(entry, ApprovalStatus::Expired, None, None, false, now).is_ok() {
                expired.push(entry.request.clone());
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "approval sweep expired requests");
        }
        expired
    }

    /// Suspend until the request is resolved, expires, or `deadline`
    /// elapses, whichever comes first. Expiry and deadline both leave the
    /// request Expired (unless a resolution won the race).
    pub async fn wait(
        &self,
        request_id: Uuid,
        deadline: Duration,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let (mut updates, until_expiry) = {
            let requests = self.lock();
            let entry = requests
                .get(&request_id)
                .ok_or(ApprovalError::NotFound(request_id))?;
            if entry.request.status.is_terminal() {
                return Ok(entry.request.clone());
            }
            let remaining = (entry.request.expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            (entry.notify.subscribe(), remaining)
        };

        let budget = until_expiry.min(deadline);
        let settled = tokio::time::timeout(budget, updates.wait_for(ApprovalStatus::is_terminal))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if settled {
            self.get(request_id).ok_or(ApprovalError::NotFound(request_id))
        } else {
            self.expire(request_id)
        }
    }

    /// Force a Pending request to Expired, returning its final state.
    fn expire(&self, request_id: Uuid) -> Result<ApprovalRequest, ApprovalError> {
        match self.transition(request_id, ApprovalStatus::Expired, None, None, false) {
            Ok(request) => Ok(request),
            // Lost the race to a resolution: report what actually happened.
            Err(ApprovalError::AlreadyResolved { .. }) => {
                self.get(request_id).ok_or(ApprovalError::NotFound(request_id))
            }
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, request_id: Uuid) -> Option<ApprovalRequest> {
        self.lock().get(&request_id).map(|e| e.request.clone())
    }

    /// All Pending requests, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .lock()
            .values()
            .filter(|e| e.request.status == ApprovalStatus::Pending)
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Drop terminal requests resolved before `before`. Returns how many
    /// were removed.
    pub fn purge_resolved(&self, before: DateTime<Utc>) -> usize {
        let mut requests = self.lock();
        let len = requests.len();
        requests.retain(|_, e| e.request.resolved_at.map(|at| at >= before).unwrap_or(true));
        len - requests.len()
    }

    fn transition(
        &self,
        request_id: Uuid,
        next: ApprovalStatus,
        resolved_by: Option<String>,
        note: Option<String>,
        cancelled: bool,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut requests = self.lock();
        let entry = requests
            .get_mut(&request_id)
            .ok_or(ApprovalError::NotFound(request_id))?;
        Self::apply(entry, next, resolved_by, note, cancelled, Utc::now())?;
        Ok(entry.request.clone())
    }

    /// Transition one entry and publish the new status. Caller holds the lock.
    fn apply(
        entry: &mut Entry,
        next: ApprovalStatus,
        resolved_by: Option<String>,
        note: Option<String>,
        cancelled: bool,
        now: DateTime<Utc>,
    ) -> Result<(), ApprovalError> {
        if let Err(e) = entry.request.transition(next, resolved_by, note, now) {
            tracing::debug!(request_id = %entry.request.id, error = %e, "approval transition refused");
            return Err(e);
        }
        entry.request.cancelled = cancelled;
        entry.notify.send_replace(next);
        match next {
            ApprovalStatus::Expired => {
                tracing::warn!(request_id = %entry.request.id, "approval request expired")
            }
            _ => tracing::info!(
                request_id = %entry.request.id,
                status = %next,
                cancelled,
                "approval request resolved"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use gk_policy::{EvaluationContext, PolicySet};

    fn pending(broker: &ApprovalBroker, ttl: Duration) -> ApprovalRequest {
        let action = Action::builder("send_email")
            .resource("customer@x.com")
            .caller("agent-1")
            .build();
        let decision = gk_policy::evaluate(
            &action,
            &PolicySet::deny_all("t"),
            &EvaluationContext::unmetered(Utc::now()),
        )
        .unwrap();
        broker.request_approval(action, decision, ttl).unwrap()
    }

    #[test]
    fn resolve_unknown_request_is_not_found() {
        let broker = ApprovalBroker::new();
        let id = Uuid::new_v4();
        assert_eq!(
            broker.resolve(id, ApprovalOutcome::Approved).unwrap_err(),
            ApprovalError::NotFound(id)
        );
    }

    #[test]
    fn second_resolve_fails_and_status_is_unchanged() {
        let broker = ApprovalBroker::new();
        let req = pending(&broker, Duration::from_secs(60));

        let approved = broker
            .resolve_as(req.id, ApprovalOutcome::Approved, "alice", None)
            .unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(approved.resolved_by.as_deref(), Some("alice"));

        let err = broker.resolve(req.id, ApprovalOutcome::Rejected).unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyResolved { status: ApprovalStatus::Approved, .. }));
        assert!(broker.cancel(req.id, "too late").is_err());
        assert_eq!(broker.get(req.id).unwrap().status, ApprovalStatus::Approved);
    }

    #[test]
    fn concurrent_resolutions_have_exactly_one_winner() {
        let broker = Arc::new(ApprovalBroker::new());
        let req = pending(&broker, Duration::from_secs(60));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let broker = Arc::clone(&broker);
                std::thread::spawn(move || {
                    let outcome = if i % 2 == 0 {
                        ApprovalOutcome::Approved
                    } else {
                        ApprovalOutcome::Rejected
                    };
                    broker.resolve(req.id, outcome)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ApprovalError::AlreadyResolved { .. })));
    }

    #[test]
    fn sweep_expires_only_overdue_pending_requests() {
        let broker = ApprovalBroker::new();
        let short = pending(&broker, Duration::from_secs(1));
        let long = pending(&broker, Duration::from_secs(3600));
        let resolved = pending(&broker, Duration::from_secs(1));
        broker.resolve(resolved.id, ApprovalOutcome::Approved).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        let expired = broker.sweep_expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, short.id);
        assert_eq!(broker.get(short.id).unwrap().status, ApprovalStatus::Expired);
        assert_eq!(broker.get(long.id).unwrap().status, ApprovalStatus::Pending);
        assert_eq!(broker.get(resolved.id).unwrap().status, ApprovalStatus::Approved);

        // A second sweep finds nothing new.
        assert!(broker.sweep_expired(later).is_empty());
    }

    #[test]
    fn cancel_marks_request_rejected_and_cancelled() {
        let broker = ApprovalBroker::new();
        let req = pending(&broker, Duration::from_secs(60));
        let cancelled = broker.cancel_action(req.action.action_id(), "operator revoked");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].status, ApprovalStatus::Rejected);
        assert!(cancelled[0].cancelled);
        assert_eq!(cancelled[0].note.as_deref(), Some("operator revoked"));
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn wait_returns_when_resolved() {
        let broker = Arc::new(ApprovalBroker::new());
        let req = pending(&broker, Duration::from_secs(60));

        let resolver = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                broker.resolve(req.id, ApprovalOutcome::Approved)
            })
        };

        let done = broker.wait(req.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, ApprovalStatus::Approved);
        resolver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_on_already_resolved_request_returns_immediately() {
        let broker = ApprovalBroker::new();
        let req = pending(&broker, Duration::from_secs(60));
        broker.resolve(req.id, ApprovalOutcome::Rejected).unwrap();
        let done = broker.wait(req.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn wait_expires_request_after_ttl() {
        let broker = ApprovalBroker::new();
        let req = pending(&broker, Duration::from_millis(50));
        let done = broker.wait(req.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, ApprovalStatus::Expired);
        // Expired is terminal: a late approval is refused.
        assert!(broker.resolve(req.id, ApprovalOutcome::Approved).is_err());
    }

    #[tokio::test]
    async fn wait_deadline_shorter_than_ttl_expires_request() {
        let broker = ApprovalBroker::new();
        let req = pending(&broker, Duration::from_secs(3600));
        let done = broker.wait(req.id, Duration::from_millis(30)).await.unwrap();
        assert_eq!(done.status, ApprovalStatus::Expired);
    }

    #[test]
    fn purge_drops_only_old_terminal_requests() {
        let broker = ApprovalBroker::new();
        let open = pending(&broker, Duration::from_secs(60));
        let done = pending(&broker, Duration::from_secs(60));
        broker.resolve(done.id, ApprovalOutcome::Approved).unwrap();

        let removed = broker.purge_resolved(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);
        assert!(broker.get(done.id).is_none());
        assert!(broker.get(open.id).is_some());
    }
}
