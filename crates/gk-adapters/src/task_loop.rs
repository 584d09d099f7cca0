// task_loop.rs - Drive a planner through a sequence of intercepted steps.
//
// The loop itself is not an enforcement point: every step it issues goes
// through `Interceptor::intercept` like any other action. What the loop adds
// is task-level accounting:
//
// - deadline: the task fails with DEADLINE_MISSED once `slo_ms` has elapsed
// - budget: a step whose cost would push spend past `budget_usd` fails the
//   task with BUDGET_EXCEEDED and is not executed
// - loop guard: identical consecutive steps (same tool, resource and
//   parameters) escalate the task with LOOP_DETECTED after
//   `max_state_repeats` repeats
// - step cap: more than `max_steps` steps escalates with STEP_LIMIT_REACHED
// - cost check: a step whose cost is NaN, infinite or negative fails the
//   task with INVALID_COST and is not executed
//
// A step blocked by policy stops the task as Blocked; a step that still
// fails after its retries fails the task.
//
// A TaskHandle lets another task cancel or escalate a running loop. Cancel
// also cancels the step in flight through the interceptor; escalate takes
// effect before the next step.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gk_policy::Action;
use gk_runtime::{
    AttemptContext, ExecutionOutcome, ExecutionStatus, Interceptor, RetryPolicy, ToolFailure,
};
use gk_trace::hasher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

fn default_max_state_repeats() -> u32 {
    3
}
fn default_max_steps() -> u32 {
    50
}

/// Task-level limits. `None` disables a limit; `max_state_repeats = 0`
/// disables the loop guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLimits {
    #[serde(default)]
    pub budget_usd: Option<f64>,
    #[serde(default)]
    pub slo_ms: Option<u64>,
    #[serde(default = "default_max_state_repeats")]
    pub max_state_repeats: u32,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            budget_usd: None,
            slo_ms: None,
            max_state_repeats: default_max_state_repeats(),
            max_steps: default_max_steps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
    Escalated,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskErrorCode {
    DeadlineMissed,
    BudgetExceeded,
    LoopDetected,
    StepLimitReached,
    StepFailed,
    PolicyViolation,
    Cancelled,
    EscalationRequested,
    InvalidCost,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    pub code: TaskErrorCode,
    pub message: String,
}

/// The next action a planner wants to take.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub action: Action,
    /// Spend attributed to this step (e.g. the model call that planned it).
    pub cost_usd: f64,
}

impl PlannedStep {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            cost_usd: 0.0,
        }
    }

    /// Costs must be finite and non-negative. The loop fails the task with
    /// INVALID_COST otherwise.
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub action_id: Uuid,
    pub tool: String,
    pub cost_usd: f64,
    pub outcome: ExecutionOutcome,
}

/// A task's progress, visible to the planner between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub status: TaskStatus,
    pub steps: Vec<StepRecord>,
    pub spent_usd: f64,
    /// Consecutive repeats of the last step's state hash.
    pub repeats: u32,
    pub last_state_hash: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskState {
    fn new(task_id: String) -> Self {
        Self {
            task_id,
            status: TaskStatus::Running,
            steps: Vec::new(),
            spent_usd: 0.0,
            repeats: 0,
            last_state_hash: None,
            started_at: Utc::now(),
            error: None,
        }
    }

    pub fn last_outcome(&self) -> Option<&ExecutionOutcome> {
        self.steps.last().map(|s| &s.outcome)
    }

    fn terminate(&mut self, status: TaskStatus, code: TaskErrorCode, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(task_id = %self.task_id, ?status, ?code, %message, "task stopped");
        self.status = status;
        self.error = Some(TaskError { code, message });
    }
}

/// Hash of what a step does, ignoring its identity.
fn state_hash(action: &Action) -> Option<String> {
    let state = json!({
        "tool": action.tool_name(),
        "resource": action.resource(),
        "parameters": action.parameters(),
    });
    hasher::hash_json(&state).ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum Signal {
    Cancel(String),
    Escalate(String),
}

/// Shared between a loop and its handles.
#[derive(Debug, Default)]
struct Control {
    signal: Mutex<Option<Signal>>,
    in_flight: Mutex<Option<Uuid>>,
}

/// Stops a running [`TaskLoop`] from outside it.
///
/// The first signal wins. A signal sent while no task is running applies
/// to the next task the loop starts.
#[derive(Clone)]
pub struct TaskHandle {
    control: Arc<Control>,
    interceptor: Arc<Interceptor>,
}

impl TaskHandle {
    /// Cancel the task. The step in flight, if any, is cancelled through
    /// the interceptor and the task ends as Cancelled.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.send(Signal::Cancel(reason.into()));
        let in_flight = *lock(&self.control.in_flight);
        if let Some(action_id) = in_flight {
            self.interceptor.cancel(action_id);
        }
    }

    /// Hand the task to a human. The step in flight finishes and the task
    /// ends as Escalated before the next one.
    pub fn escalate(&self, reason: impl Into<String>) {
        self.send(Signal::Escalate(reason.into()));
    }

    /// Action id of the step currently executing.
    pub fn current_action(&self) -> Option<Uuid> {
        *lock(&self.control.in_flight)
    }

    fn send(&self, signal: Signal) {
        let mut slot = lock(&self.control.signal);
        if slot.is_none() {
            tracing::info!(?signal, "task signal received");
            *slot = Some(signal);
        }
    }
}

/// Runs planner-issued actions through an interceptor under task limits.
pub struct TaskLoop {
    interceptor: Arc<Interceptor>,
    limits: TaskLimits,
    retry: RetryPolicy,
    control: Arc<Control>,
}

impl TaskLoop {
    /// A loop with default limits that retries steps per the interceptor's
    /// default retry policy.
    pub fn new(interceptor: Arc<Interceptor>) -> Self {
        Self {
            retry: interceptor.default_retry().clone(),
            interceptor,
            limits: TaskLimits::default(),
            control: Arc::default(),
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            control: Arc::clone(&self.control),
            interceptor: Arc::clone(&self.interceptor),
        }
    }

    pub fn with_limits(mut self, limits: TaskLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ask `planner` for steps until it returns `None` or a limit stops
    /// the task. `executor` performs each step's action.
    pub async fn run<P, E, Fut>(
        &self,
        task_id: impl Into<String>,
        mut planner: P,
        mut executor: E,
    ) -> TaskState
    where
        P: FnMut(&TaskState) -> Option<PlannedStep>,
        E: FnMut(Action, AttemptContext) -> Fut,
        Fut: Future<Output = Result<Value, ToolFailure>>,
    {
        let mut state = TaskState::new(task_id.into());
        let span = tracing::info_span!("task", task_id = %state.task_id);
        async {
            let started = Instant::now();
            while !state.status.is_terminal() {
                self.step(&mut state, started, &mut planner, &mut executor)
                    .await;
            }
            tracing::info!(
                status = ?state.status,
                steps = state.steps.len(),
                spent_usd = state.spent_usd,
                "task finished"
            );
        }
        .instrument(span)
        .await;
        lock(&self.control.signal).take();
        state
    }

    /// Stop the task if a handle signalled it. Returns true if it stopped.
    fn apply_signal(&self, state: &mut TaskState) -> bool {
        let Some(signal) = lock(&self.control.signal).take() else {
            return false;
        };
        match signal {
            Signal::Cancel(reason) => {
                state.terminate(TaskStatus::Cancelled, TaskErrorCode::Cancelled, reason)
            }
            Signal::Escalate(reason) => state.terminate(
                TaskStatus::Escalated,
                TaskErrorCode::EscalationRequested,
                reason,
            ),
        }
        true
    }

    async fn step<P, E, Fut>(
        &self,
        state: &mut TaskState,
        started: Instant,
        planner: &mut P,
        executor: &mut E,
    ) where
        P: FnMut(&TaskState) -> Option<PlannedStep>,
        E: FnMut(Action, AttemptContext) -> Fut,
        Fut: Future<Output = Result<Value, ToolFailure>>,
    {
        if self.apply_signal(state) {
            return;
        }
        if let Some(slo_ms) = self.limits.slo_ms {
            if started.elapsed() > Duration::from_millis(slo_ms) {
                state.terminate(
                    TaskStatus::Failed,
                    TaskErrorCode::DeadlineMissed,
                    format!("deadline of {} ms exceeded", slo_ms),
                );
                return;
            }
        }
        if state.steps.len() as u64 >= u64::from(self.limits.max_steps) {
            state.terminate(
                TaskStatus::Escalated,
                TaskErrorCode::StepLimitReached,
                format!("step limit of {} reached", self.limits.max_steps),
            );
            return;
        }

        let Some(step) = planner(state) else {
            state.status = TaskStatus::Succeeded;
            return;
        };

        if !step.cost_usd.is_finite() || step.cost_usd < 0.0 {
            state.terminate(
                TaskStatus::Failed,
                TaskErrorCode::InvalidCost,
                format!("step cost {} is not a finite non-negative amount", step.cost_usd),
            );
            return;
        }
        if let Some(budget) = self.limits.budget_usd {
            let projected = state.spent_usd + step.cost_usd;
            if projected > budget {
                state.terminate(
                    TaskStatus::Failed,
                    TaskErrorCode::BudgetExceeded,
                    format!("projected spend {:.4} exceeds budget {:.4} USD", projected, budget),
                );
                return;
            }
        }

        let hash = state_hash(&step.action);
        if hash.is_some() && hash == state.last_state_hash {
            state.repeats += 1;
        } else {
            state.repeats = 0;
        }
        state.last_state_hash = hash;
        let max_repeats = self.limits.max_state_repeats;
        if max_repeats > 0 && state.repeats >= max_repeats {
            state.terminate(
                TaskStatus::Escalated,
                TaskErrorCode::LoopDetected,
                format!("same step repeated {} times", state.repeats + 1),
            );
            return;
        }

        let template = step.action.clone();
        let action_id = template.action_id();
        let tool = template.tool_name().to_string();

        // Publish the step before the last signal check so a concurrent
        // cancel either sees it or is seen here.
        *lock(&self.control.in_flight) = Some(action_id);
        if self.apply_signal(state) {
            *lock(&self.control.in_flight) = None;
            return;
        }
        state.spent_usd += step.cost_usd;
        let outcome = self
            .interceptor
            .intercept(step.action, |ctx| executor(template.clone(), ctx), &self.retry)
            .await;
        *lock(&self.control.in_flight) = None;

        let status = outcome.status;
        let detail = outcome.error_detail.clone().unwrap_or_default();
        state.steps.push(StepRecord {
            action_id,
            tool,
            cost_usd: step.cost_usd,
            outcome,
        });

        match status {
            ExecutionStatus::Success => {}
            ExecutionStatus::PolicyViolation => {
                state.terminate(TaskStatus::Blocked, TaskErrorCode::PolicyViolation, detail)
            }
            ExecutionStatus::Cancelled => {
                let reason = match lock(&self.control.signal).take() {
                    Some(Signal::Cancel(reason)) => reason,
                    _ => detail,
                };
                state.terminate(TaskStatus::Cancelled, TaskErrorCode::Cancelled, reason)
            }
            ExecutionStatus::ToolError | ExecutionStatus::Timeout => {
                state.terminate(TaskStatus::Failed, TaskErrorCode::StepFailed, detail)
            }
        }
    }
}
