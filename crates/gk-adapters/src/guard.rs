// guard.rs - Scoped enforcement for code that cannot be passed as a closure.
//
// `Guard::enter` runs the decision phase eagerly (evaluation, and the
// approval wait if one is needed) and opens a single attempt. The caller
// then does the work and reports it with `finish`. If the guard is dropped
// first (early return, `?`, panic unwinding) the run it owns records
// ExecutionCompleted(Cancelled), so the action's trace is always closed.

use std::future::Future;
use std::sync::Arc;

use gk_policy::Action;
use gk_runtime::{
    ActionRun, AttemptContext, Authorization, Completion, ExecutionOutcome, Interceptor,
    ToolFailure,
};
use serde_json::Value;
use uuid::Uuid;

/// An authorized action whose work is in progress.
pub struct Guard {
    interceptor: Arc<Interceptor>,
    run: ActionRun,
    attempt: AttemptContext,
}

impl Guard {
    /// Authorize `action`. A blocked action returns its already-recorded
    /// outcome instead of a guard.
    pub async fn enter(
        interceptor: Arc<Interceptor>,
        action: Action,
    ) -> Result<Guard, Box<ExecutionOutcome>> {
        match interceptor.authorize(action).await {
            Authorization::Refused(outcome) => Err(Box::new(outcome)),
            Authorization::Granted(mut run) => {
                let attempt = interceptor.begin_attempt(&mut run);
                Ok(Guard {
                    interceptor,
                    run,
                    attempt,
                })
            }
        }
    }

    pub fn action_id(&self) -> Uuid {
        self.attempt.action_id
    }

    pub fn attempt(&self) -> AttemptContext {
        self.attempt
    }

    /// Report the result of the guarded work and close the trace.
    pub fn finish(self, result: Result<Value, ToolFailure>) -> ExecutionOutcome {
        let completion = match result {
            Ok(payload) => Completion::success(payload),
            Err(failure) => Completion::tool_error(failure.message),
        };
        self.interceptor.finish(self.run, completion)
    }

    /// Enter, run `body` once, and finish: the scoped form of a guard.
    pub async fn scoped<F, Fut>(
        interceptor: Arc<Interceptor>,
        action: Action,
        body: F,
    ) -> ExecutionOutcome
    where
        F: FnOnce(AttemptContext) -> Fut,
        Fut: Future<Output = Result<Value, ToolFailure>>,
    {
        match Guard::enter(interceptor, action).await {
            Ok(guard) => {
                let result = body(guard.attempt()).await;
                guard.finish(result)
            }
            Err(outcome) => *outcome,
        }
    }
}
