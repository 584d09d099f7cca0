// interceptor.rs - The enforcement loop around every tool invocation.
//
// For one action the interceptor:
//   1. evaluates it against the current policy snapshot and records the
//      decision,
//   2. stops on Deny, or parks on the approval broker for RequireApproval,
//   3. invokes the tool under a per-attempt deadline,
//   4. retries ToolError and Timeout with backoff, re-evaluating each time,
//   5. records ExecutionCompleted for every attempt it closes, plus one for
//      a run that ends before any attempt, and returns the ExecutionOutcome.
//
// Trace writes never block enforcement: a failed write becomes a warning on
// the outcome. Policy evaluation errors are never surfaced as errors either:
// they become a recorded Deny (fail closed).
//
// Adapters that cannot hand over a closure (guards, scoped blocks) use the
// lower-level `authorize` / `begin_attempt` / `finish` calls, which share
// the same bookkeeping through `ActionRun`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gk_approval::{ApprovalBroker, ApprovalStatus};
use gk_policy::{
    Action, Decision, DecisionEffect, EvaluationContext, InMemoryRateLimiter, PolicyError,
    PolicyStore, RateLimitKey, RateLimitStore, UsageLookup,
};
use gk_trace::{ExecutionStatus, TraceEventKind, TraceFilter, TraceQuery, TraceRecorder};
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use crate::outcome::{
    AttemptContext, AttemptRecord, Completion, ExecutionOutcome, ToolFailure, ViolationKind,
};
use crate::retry::RetryPolicy;

/// Approval requests expire after five minutes unless configured otherwise.
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(300);

/// Resolved approval requests stay queryable on the broker for an hour.
pub const DEFAULT_APPROVAL_RETENTION: Duration = Duration::from_secs(3600);

/// Cancel handles per action id. Runs that share an action id each keep
/// their own handle, told apart by a run token.
type Registry = Arc<Mutex<HashMap<Uuid, Vec<(u64, watch::Sender<bool>)>>>>;

fn lock_registry(
    registry: &Registry,
) -> MutexGuard<'_, HashMap<Uuid, Vec<(u64, watch::Sender<bool>)>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Exposes the counter store's read side to the evaluator.
struct Metered<'a>(&'a dyn RateLimitStore);

impl UsageLookup for Metered<'_> {
    fn usage(&self, key: &RateLimitKey, window: Duration, now: DateTime<Utc>) -> u32 {
        self.0.usage(key, window, now)
    }
}

/// Removes a run's cancel handle once the run ends.
struct Registration {
    registry: Registry,
    action_id: Uuid,
    token: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut registry = lock_registry(&self.registry);
        if let Some(handles) = registry.get_mut(&self.action_id) {
            handles.retain(|(token, _)| *token != self.token);
            if handles.is_empty() {
                registry.remove(&self.action_id);
            }
        }
    }
}

/// Bookkeeping for one action between authorization and completion.
///
/// A run dropped without reaching [`Interceptor::finish`] closes its trace
/// with ExecutionCompleted(Cancelled).
pub struct ActionRun {
    action: Action,
    recorder: Arc<TraceRecorder>,
    closed: bool,
    started: Instant,
    attempts: Vec<AttemptRecord>,
    open_attempt: Option<(u32, Instant)>,
    approval_request_id: Option<Uuid>,
    approved: bool,
    warnings: Vec<String>,
    cancel: watch::Receiver<bool>,
    _registration: Registration,
}

impl ActionRun {
    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn action_id(&self) -> Uuid {
        self.action.action_id()
    }

    pub fn approval_request_id(&self) -> Option<Uuid> {
        self.approval_request_id
    }

    /// True once an operator cancelled this action.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Trace writes that failed so far.
    pub fn trace_warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl Drop for ActionRun {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let action_id = self.action_id();
        let attempt = self
            .open_attempt
            .map_or(self.attempts.len() as u32, |(attempt, _)| attempt);
        tracing::warn!(action_id = %action_id, attempt, "action dropped before finish");
        let closing = TraceEventKind::ExecutionCompleted {
            attempt,
            status: ExecutionStatus::Cancelled,
            duration_ms: millis(self.started.elapsed()),
            error_detail: Some("action dropped before finish".to_string()),
        };
        if let Err(e) = self.recorder.append(action_id, closing) {
            tracing::warn!(action_id = %action_id, error = %e, "trace write failed");
        }
    }
}

/// Result of the decision phase alone.
pub enum Authorization {
    /// The action may run. Report its end through [`Interceptor::finish`].
    Granted(ActionRun),
    /// Policy blocked the action; the trace is already closed.
    Refused(ExecutionOutcome),
}

/// Gates tool invocations behind policy, approval, and bounded retries.
pub struct Interceptor {
    policies: Arc<PolicyStore>,
    rate_limits: Arc<dyn RateLimitStore>,
    broker: Arc<ApprovalBroker>,
    recorder: Arc<TraceRecorder>,
    approval_ttl: Duration,
    approval_retention: Duration,
    default_retry: RetryPolicy,
    in_flight: Registry,
    next_token: AtomicU64,
}

impl Interceptor {
    /// An interceptor with in-memory rate limits, a fresh broker, and an
    /// in-memory trace.
    pub fn new(policies: Arc<PolicyStore>) -> Self {
        Self {
            policies,
            rate_limits: Arc::new(InMemoryRateLimiter::new()),
            broker: Arc::new(ApprovalBroker::new()),
            recorder: Arc::new(TraceRecorder::new()),
            approval_ttl: DEFAULT_APPROVAL_TTL,
            approval_retention: DEFAULT_APPROVAL_RETENTION,
            default_retry: RetryPolicy::default(),
            in_flight: Arc::default(),
            next_token: AtomicU64::new(0),
        }
    }

    pub fn with_rate_limits(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.rate_limits = store;
        self
    }

    pub fn with_broker(mut self, broker: Arc<ApprovalBroker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<TraceRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// How long an approval request stays open. Also the approval wait
    /// deadline.
    pub fn with_approval_ttl(mut self, ttl: Duration) -> Self {
        self.approval_ttl = ttl;
        self
    }

    /// How long resolved approval requests are kept on the broker before
    /// the interceptor purges them.
    pub fn with_approval_retention(mut self, retention: Duration) -> Self {
        self.approval_retention = retention;
        self
    }

    /// Retry policy adapters use when they are not given one explicitly.
    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn default_retry(&self) -> &RetryPolicy {
        &self.default_retry
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        &self.broker
    }

    pub fn recorder(&self) -> &Arc<TraceRecorder> {
        &self.recorder
    }

    /// Evaluate without recording or consuming anything.
    pub fn evaluate(&self, action: &Action) -> Result<Decision, PolicyError> {
        let snapshot = self.policies.snapshot();
        let usage = Metered(self.rate_limits.as_ref());
        gk_policy::evaluate(action, &snapshot, &EvaluationContext::new(Utc::now(), &usage))
    }

    /// Query the trace this interceptor writes to.
    pub fn query(&self, filter: TraceFilter) -> TraceQuery {
        self.recorder.query(filter)
    }

    /// Run `action` through the full enforcement loop.
    ///
    /// `invoke` performs the real side effect and is called at most
    /// `retry.max_attempts` times, each under `retry.attempt_timeout()`.
    pub async fn intercept<F, Fut>(
        &self,
        action: Action,
        mut invoke: F,
        retry: &RetryPolicy,
    ) -> ExecutionOutcome
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ToolFailure>>,
    {
        let span = tracing::info_span!(
            "intercept",
            action_id = %action.action_id(),
            tool = %action.tool_name()
        );
        self.run_with_retries(action, &mut invoke, retry)
            .instrument(span)
            .await
    }

    async fn run_with_retries<F, Fut>(
        &self,
        action: Action,
        invoke: &mut F,
        retry: &RetryPolicy,
    ) -> ExecutionOutcome
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ToolFailure>>,
    {
        let max_attempts = retry.max_attempts.max(1);
        let mut run = self.start(action);

        loop {
            if let Err(blocked) = self.admit(&mut run).await {
                return self.finish(run, blocked);
            }

            let ctx = self.begin_attempt(&mut run);
            let mut cancel = run.cancel.clone();
            let result = tokio::select! {
                biased;
                Ok(_) = cancel.wait_for(|c| *c) => None,
                r = tokio::time::timeout(retry.attempt_timeout(), invoke(ctx)) => Some(r),
            };

            let (failure, retryable) = match result {
                None => {
                    return self.finish(run, Completion::cancelled("action cancelled during invocation"))
                }
                Some(Ok(Ok(payload))) => return self.finish(run, Completion::success(payload)),
                Some(Ok(Err(e))) => (Completion::tool_error(e.message), e.retryable),
                Some(Err(_)) => (
                    Completion::timeout(format!(
                        "attempt {} exceeded {} ms",
                        ctx.attempt, retry.attempt_timeout_ms
                    )),
                    true,
                ),
            };

            if !retryable || ctx.attempt >= max_attempts {
                return self.finish(run, failure);
            }

            self.close_attempt(&mut run, &failure);
            let delay = retry.backoff_after(ctx.attempt);
            tracing::warn!(
                attempt = ctx.attempt,
                status = %failure.status,
                error = failure.error_detail.as_deref().unwrap_or(""),
                delay_ms = millis(delay),
                "attempt failed, retrying"
            );

            let mut cancel = run.cancel.clone();
            tokio::select! {
                biased;
                Ok(_) = cancel.wait_for(|c| *c) => {
                    return self.finish(run, Completion::cancelled("action cancelled during retry backoff"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run only the decision phase: evaluate, record, and wait for approval
    /// if required.
    pub async fn authorize(&self, action: Action) -> Authorization {
        let span = tracing::info_span!(
            "authorize",
            action_id = %action.action_id(),
            tool = %action.tool_name()
        );
        async move {
            let mut run = self.start(action);
            match self.admit(&mut run).await {
                Ok(()) => Authorization::Granted(run),
                Err(blocked) => Authorization::Refused(self.finish(run, blocked)),
            }
        }
        .instrument(span)
        .await
    }

    /// Record ExecutionAttempted and open a new attempt.
    pub fn begin_attempt(&self, run: &mut ActionRun) -> AttemptContext {
        let attempt = run.attempts.len() as u32 + 1;
        run.open_attempt = Some((attempt, Instant::now()));
        self.record(run, TraceEventKind::ExecutionAttempted { attempt });
        AttemptContext {
            action_id: run.action_id(),
            attempt,
        }
    }

    /// Close the action: record ExecutionCompleted and build the outcome.
    pub fn finish(&self, mut run: ActionRun, completion: Completion) -> ExecutionOutcome {
        run.closed = true;
        self.end_attempt(&mut run, completion.status, completion.error_detail.clone());

        let attempt = run.attempts.len() as u32;
        let duration_ms = millis(run.started.elapsed());
        self.record(
            &mut run,
            TraceEventKind::ExecutionCompleted {
                attempt,
                status: completion.status,
                duration_ms,
                error_detail: completion.error_detail.clone(),
            },
        );

        match completion.status {
            ExecutionStatus::Success => {
                tracing::info!(attempts = attempt, duration_ms, "action succeeded")
            }
            ExecutionStatus::PolicyViolation => tracing::info!(
                violation = ?completion.violation,
                detail = completion.error_detail.as_deref().unwrap_or(""),
                "action blocked by policy"
            ),
            status => tracing::warn!(
                %status,
                attempts = attempt,
                detail = completion.error_detail.as_deref().unwrap_or(""),
                "action failed"
            ),
        }

        ExecutionOutcome {
            action_id: run.action_id(),
            attempt_number: attempt,
            status: completion.status,
            result_payload: completion.result_payload,
            error_detail: completion.error_detail,
            duration_ms,
            violation: completion.violation,
            approval_request_id: run.approval_request_id,
            attempts: std::mem::take(&mut run.attempts),
            trace_warnings: std::mem::take(&mut run.warnings),
        }
    }

    /// Cancel an in-flight action: revoke its pending approval and stop its
    /// current invocation or backoff. Every run of the action is signalled.
    /// Returns false if nothing was running.
    pub fn cancel(&self, action_id: Uuid) -> bool {
        let signalled = match lock_registry(&self.in_flight).get(&action_id) {
            Some(handles) => {
                for (_, tx) in handles {
                    tx.send_replace(true);
                }
                !handles.is_empty()
            }
            None => false,
        };
        let revoked = self
            .broker
            .cancel_action(action_id, "action cancelled by operator");
        tracing::info!(
            action_id = %action_id,
            signalled,
            approvals_revoked = revoked.len(),
            "cancel requested"
        );
        signalled || !revoked.is_empty()
    }

    fn start(&self, action: Action) -> ActionRun {
        let (tx, rx) = watch::channel(false);
        let action_id = action.action_id();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        lock_registry(&self.in_flight)
            .entry(action_id)
            .or_default()
            .push((token, tx));
        ActionRun {
            action,
            recorder: Arc::clone(&self.recorder),
            closed: false,
            started: Instant::now(),
            attempts: Vec::new(),
            open_attempt: None,
            approval_request_id: None,
            approved: false,
            warnings: Vec::new(),
            cancel: rx,
            _registration: Registration {
                registry: Arc::clone(&self.in_flight),
                action_id,
                token,
            },
        }
    }

    fn end_attempt(&self, run: &mut ActionRun, status: ExecutionStatus, error_detail: Option<String>) {
        if let Some((attempt, began)) = run.open_attempt.take() {
            run.attempts.push(AttemptRecord {
                attempt,
                status,
                duration_ms: millis(began.elapsed()),
                error_detail,
            });
        }
    }

    /// Close a failed attempt that is about to be retried.
    fn close_attempt(&self, run: &mut ActionRun, failure: &Completion) {
        self.end_attempt(run, failure.status, failure.error_detail.clone());
        if let Some(closed) = run.attempts.last().cloned() {
            self.record(
                run,
                TraceEventKind::ExecutionCompleted {
                    attempt: closed.attempt,
                    status: closed.status,
                    duration_ms: closed.duration_ms,
                    error_detail: closed.error_detail,
                },
            );
        }
    }

    fn record(&self, run: &mut ActionRun, kind: TraceEventKind) {
        if let Err(e) = self.recorder.append(run.action_id(), kind) {
            tracing::warn!(action_id = %run.action_id(), error = %e, "trace write failed");
            run.warnings.push(e.to_string());
        }
    }

    /// Evaluate against the current snapshot. Evaluation errors become a
    /// fail-closed Deny; the flag reports that case.
    fn decide(&self, action: &Action) -> (Decision, bool, DateTime<Utc>) {
        let snapshot = self.policies.snapshot();
        let now = Utc::now();
        let usage = Metered(self.rate_limits.as_ref());
        match gk_policy::evaluate(action, &snapshot, &EvaluationContext::new(now, &usage)) {
            Ok(decision) => (decision, false, now),
            Err(e) => {
                tracing::error!(error = %e, policy_version = snapshot.version, "policy evaluation failed; denying");
                (Decision::fail_closed(&e, now, snapshot.version), true, now)
            }
        }
    }

    /// Decide whether the next attempt may run.
    async fn admit(&self, run: &mut ActionRun) -> Result<(), Completion> {
        let (decision, misconfigured, now) = self.decide(&run.action);
        self.record(
            run,
            TraceEventKind::DecisionRecorded {
                effect: decision.effect,
                matched_rule_id: decision.matched_rule_id.clone(),
                policy_version: decision.policy_version,
                reason: decision.reason.clone(),
            },
        );

        match decision.effect {
            DecisionEffect::Deny => {
                let kind = if misconfigured {
                    ViolationKind::Misconfigured
                } else if decision.rate_limit.is_some() {
                    ViolationKind::RateLimited
                } else {
                    ViolationKind::Denied
                };
                Err(Completion::violation(kind, decision.reason))
            }
            DecisionEffect::Allow => self.consume_rate_limit(&decision, now),
            // Approval is obtained once per action, not per attempt.
            DecisionEffect::RequireApproval if run.approved => Ok(()),
            DecisionEffect::RequireApproval => self.await_approval(run, decision).await,
        }
    }

    fn consume_rate_limit(&self, decision: &Decision, now: DateTime<Utc>) -> Result<(), Completion> {
        let Some(check) = &decision.rate_limit else {
            return Ok(());
        };
        if self
            .rate_limits
            .try_consume(&check.key, check.limit, check.window(), now)
        {
            Ok(())
        } else {
            Err(Completion::violation(
                ViolationKind::RateLimited,
                format!(
                    "rate limit exhausted: {} per {}s for {}",
                    check.limit, check.window_secs, check.key.caller_identity
                ),
            ))
        }
    }

    /// Expire overdue requests and drop those resolved longer ago than the
    /// retention window.
    fn prune_approvals(&self) {
        let now = Utc::now();
        self.broker.sweep_expired(now);
        let cutoff = chrono::Duration::from_std(self.approval_retention)
            .ok()
            .and_then(|keep| now.checked_sub_signed(keep));
        if let Some(cutoff) = cutoff {
            let purged = self.broker.purge_resolved(cutoff);
            if purged > 0 {
                tracing::debug!(purged, "purged resolved approval requests");
            }
        }
    }

    async fn await_approval(&self, run: &mut ActionRun, decision: Decision) -> Result<(), Completion> {
        let request = self
            .broker
            .request_approval(run.action.clone(), decision, self.approval_ttl)
            .map_err(|e| Completion::violation(ViolationKind::Misconfigured, e.to_string()))?;
        run.approval_request_id = Some(request.id);
        self.record(
            run,
            TraceEventKind::ApprovalRequested {
                request_id: request.id,
                expires_at: request.expires_at,
            },
        );

        // A cancel that arrived before the request existed had nothing to
        // revoke; honour it now.
        if run.is_cancelled() {
            if let Err(e) = self.broker.cancel(request.id, "action cancelled by operator") {
                tracing::debug!(error = %e, "late cancel lost to resolution");
            }
        }

        let resolved = self
            .broker
            .wait(request.id, self.approval_ttl)
            .await
            .map_err(|e| Completion::violation(ViolationKind::Expired, e.to_string()))?;
        self.record(
            run,
            TraceEventKind::ApprovalResolved {
                request_id: resolved.id,
                status: resolved.status,
                cancelled: resolved.cancelled,
            },
        );
        self.prune_approvals();

        match resolved.status {
            ApprovalStatus::Approved => {
                run.approved = true;
                Ok(())
            }
            ApprovalStatus::Rejected if resolved.cancelled => Err(Completion::cancelled(
                resolved
                    .note
                    .unwrap_or_else(|| "approval cancelled".to_string()),
            )),
            ApprovalStatus::Rejected => Err(Completion::violation(
                ViolationKind::Rejected,
                match resolved.resolved_by {
                    Some(by) => format!("approval rejected by {}", by),
                    None => "approval rejected".to_string(),
                },
            )),
            ApprovalStatus::Expired | ApprovalStatus::Pending => Err(Completion::violation(
                ViolationKind::Expired,
                format!("approval request {} expired", resolved.id),
            )),
        }
    }
}
