//! Rate-limit budgets shared across actions and callers.

use std::sync::Arc;

use gk_policy::{Action, Effect, InMemoryRateLimiter, MatchPredicate, PolicyRule, PolicySet, PolicyStore};
use gk_runtime::{ExecutionStatus, Interceptor, RetryPolicy, ViolationKind};
use serde_json::json;

fn limited(limit: u32) -> PolicySet {
    PolicySet::deny_all("limits").with_rule(PolicyRule::new(
        "search-budget",
        MatchPredicate::tool("web_search"),
        Effect::RateLimit {
            limit,
            window_secs: 3600,
        },
    ))
}

fn search(caller: &str) -> Action {
    Action::builder("web_search").caller(caller).build()
}

#[tokio::test]
async fn budget_is_per_caller() {
    let gk = Interceptor::new(Arc::new(PolicyStore::new(limited(2)).unwrap()));
    let once = RetryPolicy::once();

    for _ in 0..2 {
        let outcome = gk
            .intercept(search("agent-a"), |_| async { Ok(json!([])) }, &once)
            .await;
        assert!(outcome.is_success());
    }

    let blocked = gk
        .intercept(search("agent-a"), |_| async { Ok(json!([])) }, &once)
        .await;
    assert_eq!(blocked.status, ExecutionStatus::PolicyViolation);
    assert_eq!(blocked.violation, Some(ViolationKind::RateLimited));

    let other = gk
        .intercept(search("agent-b"), |_| async { Ok(json!([])) }, &once)
        .await;
    assert!(other.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_cannot_overspend() {
    let limiter = Arc::new(InMemoryRateLimiter::new());
    let gk = Arc::new(
        Interceptor::new(Arc::new(PolicyStore::new(limited(5)).unwrap()))
            .with_rate_limits(limiter),
    );

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let gk = Arc::clone(&gk);
            tokio::spawn(async move {
                gk.intercept(search("agent-a"), |_| async { Ok(json!([])) }, &RetryPolicy::once())
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    for task in tasks {
        if task.await.unwrap().is_success() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 5);
}
