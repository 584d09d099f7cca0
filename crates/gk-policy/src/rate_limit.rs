// rate_limit.rs - Rate-limit usage lookup and counters.
//
// The evaluator only ever *reads* usage through `UsageLookup`, which keeps
// evaluation side-effect free and replayable. Consumption happens after the
// decision, in the interceptor, through `RateLimitStore::try_consume`, an
// atomic check-and-record: two concurrent actions racing for the last slot
// cannot both win.
//
// `InMemoryRateLimiter` keeps a sliding window of timestamps per key. Its
// counters live as long as the process; deployments that need counters to
// survive restarts implement `RateLimitStore` over their own storage.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one rate-limit counter: a rule applied to one caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey {
    /// The rule id, or `"<default>"` when the policy default is a rate limit.
    pub rule_id: String,
    pub caller_identity: String,
}

impl RateLimitKey {
    pub fn new(rule_id: impl Into<String>, caller_identity: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            caller_identity: caller_identity.into(),
        }
    }
}

/// Read-only view of rate-limit usage, injected into evaluation.
pub trait UsageLookup: Send + Sync {
    /// Actions recorded for `key` in the window `(now - window, now]`.
    fn usage(&self, key: &RateLimitKey, window: Duration, now: DateTime<Utc>) -> u32;
}

/// Mutable counter store used by the interceptor after a decision.
pub trait RateLimitStore: UsageLookup {
    /// Record one use of `key` if fewer than `limit` uses fall inside the
    /// window. Returns false (and records nothing) when the limit is reached.
    fn try_consume(
        &self,
        key: &RateLimitKey,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool;
}

/// A lookup that reports zero usage. Used for dry-run evaluation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unmetered;

impl UsageLookup for Unmetered {
    fn usage(&self, _key: &RateLimitKey, _window: Duration, _now: DateTime<Utc>) -> u32 {
        0
    }
}

/// Sliding-window counters held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    windows: Mutex<HashMap<RateLimitKey, VecDeque<DateTime<Utc>>>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn window_start(window: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl UsageLookup for InMemoryRateLimiter {
    fn usage(&self, key: &RateLimitKey, window: Duration, now: DateTime<Utc>) -> u32 {
        let start = window_start(window, now);
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows
            .get(key)
            .map(|hits| hits.iter().filter(|t| **t > start && **t <= now).count() as u32)
            .unwrap_or(0)
    }
}

impl RateLimitStore for InMemoryRateLimiter {
    fn try_consume(
        &self,
        key: &RateLimitKey,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let start = window_start(window, now);
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let hits = windows.entry(key.clone()).or_default();
        while hits.front().is_some_and(|t| *t <= start) {
            hits.pop_front();
        }
        if hits.len() as u32 >= limit {
            tracing::debug!(
                rule_id = %key.rule_id,
                caller = %key.caller_identity,
                limit,
                "rate limit slot unavailable"
            );
            return false;
        }
        hits.push_back(now);
        true
    }
}
