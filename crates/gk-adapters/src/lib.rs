//! # gk-adapters
//!
//! Thin integration surfaces over [`gk_runtime::Interceptor`]. None of
//! them make policy decisions; each translates its caller's shape into an
//! [`gk_policy::Action`] and the resulting
//! [`gk_runtime::ExecutionOutcome`] back.
//!
//! - [`GatewayProxy`]: OpenAI-compatible chat completion proxy with HTTP
//!   status mapping.
//! - [`Guard`]: scoped enforcement around a block of code.
//! - [`GuardedTool`]: a tool function that is policy-checked on every call.
//! - [`MetadataCompiler`]: framework policy declarations compiled into a
//!   `PolicySet`, retry policy, and task limits.
//! - [`TaskLoop`]: planner-driven multi-step tasks with budget, deadline,
//!   and loop-guard accounting, stoppable through a [`TaskHandle`].

pub mod error;
pub mod gateway;
pub mod guard;
pub mod metadata;
pub mod task_loop;
pub mod tool;

pub use error::AdapterError;
pub use gateway::{
    ChatCompletionRequest, ChatMessage, GatewayProxy, GatewayResponse, CHAT_COMPLETIONS_TOOL,
};
pub use guard::Guard;
pub use metadata::{
    CompiledPolicy, LoopGuard, MetadataCompiler, PolicyMetadata, ToolRateLimit, METADATA_KEY,
};
pub use task_loop::{
    PlannedStep, StepRecord, TaskError, TaskErrorCode, TaskHandle, TaskLimits, TaskLoop,
    TaskState, TaskStatus,
};
pub use tool::{GuardedTool, ToolArgs};
