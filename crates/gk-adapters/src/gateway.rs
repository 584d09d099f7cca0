// gateway.rs - OpenAI-compatible chat completion proxy.
//
// The proxy turns each chat completion request into an Action, runs it
// through the interceptor with the upstream call as the tool, and maps the
// outcome back to an HTTP status and JSON body:
//
//   Success          -> 200, upstream body unchanged
//   PolicyViolation  -> 403, {"error": {"type": "policy_violation", ...}}
//   ToolError        -> 502
//   Timeout          -> 504
//   Cancelled        -> 499
//
// Unknown request fields are kept and forwarded, so clients can use any
// part of the upstream schema the proxy does not inspect.

use std::future::Future;
use std::sync::Arc;

use gk_policy::Action;
use gk_runtime::{ExecutionOutcome, ExecutionStatus, Interceptor, RetryPolicy, ToolFailure};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Tool name every proxied completion is evaluated under.
pub const CHAT_COMPLETIONS_TOOL: &str = "chat.completions";

pub const STATUS_OK: u16 = 200;
pub const STATUS_FORBIDDEN: u16 = 403;
/// Non-standard "client closed request", used for cancelled actions.
pub const STATUS_CANCELLED: u16 = 499;
pub const STATUS_BAD_GATEWAY: u16 = 502;
pub const STATUS_GATEWAY_TIMEOUT: u16 = 504;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// The subset of the chat completion schema the proxy reads. Everything
/// else rides along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// End-user id; used as the caller identity when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What the HTTP layer sends back.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Value,
    /// The full outcome, for logging and headers.
    pub outcome: ExecutionOutcome,
}

/// In-process proxy in front of an upstream chat completion endpoint.
pub struct GatewayProxy {
    interceptor: Arc<Interceptor>,
    retry: RetryPolicy,
    default_caller: String,
}

impl GatewayProxy {
    /// A proxy that retries per the interceptor's default retry policy.
    pub fn new(interceptor: Arc<Interceptor>) -> Self {
        Self {
            retry: interceptor.default_retry().clone(),
            interceptor,
            default_caller: "anonymous".to_string(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Caller identity for requests without a `user` field.
    pub fn with_default_caller(mut self, caller: impl Into<String>) -> Self {
        self.default_caller = caller.into();
        self
    }

    /// Describe a request as an Action for policy evaluation.
    pub fn action_for(&self, request: &ChatCompletionRequest) -> Action {
        let mut builder = Action::builder(CHAT_COMPLETIONS_TOOL)
            .resource(request.model.as_str())
            .caller(request.user.as_deref().unwrap_or(self.default_caller.as_str()))
            .parameter("model", request.model.as_str())
            .parameter("message_count", request.messages.len() as u64);
        if let Some(t) = request.temperature {
            builder = builder.parameter("temperature", t);
        }
        builder.build()
    }

    /// Enforce policy on `request` and forward it with `upstream`.
    pub async fn forward<F, Fut>(&self, request: ChatCompletionRequest, upstream: F) -> GatewayResponse
    where
        F: Fn(ChatCompletionRequest) -> Fut,
        Fut: Future<Output = Result<Value, ToolFailure>>,
    {
        let action = self.action_for(&request);
        let outcome = self
            .interceptor
            .intercept(action, |_| upstream(request.clone()), &self.retry)
            .await;
        Self::respond(outcome)
    }

    /// Map an outcome to the HTTP status and body clients expect.
    pub fn respond(outcome: ExecutionOutcome) -> GatewayResponse {
        let detail = outcome.error_detail.clone().unwrap_or_default();
        let (status, body) = match outcome.status {
            ExecutionStatus::Success => (
                STATUS_OK,
                outcome.result_payload.clone().unwrap_or(Value::Null),
            ),
            ExecutionStatus::PolicyViolation => (
                STATUS_FORBIDDEN,
                json!({
                    "error": {
                        "type": "policy_violation",
                        "code": outcome.violation.map(|v| v.to_string()),
                        "message": detail,
                        "action_id": outcome.action_id,
                        "approval_request_id": outcome.approval_request_id,
                    }
                }),
            ),
            ExecutionStatus::ToolError => (
                STATUS_BAD_GATEWAY,
                json!({"error": {"type": "upstream_error", "message": detail}}),
            ),
            ExecutionStatus::Timeout => (
                STATUS_GATEWAY_TIMEOUT,
                json!({"error": {"type": "timeout", "message": detail}}),
            ),
            ExecutionStatus::Cancelled => (
                STATUS_CANCELLED,
                json!({"error": {"type": "cancelled", "message": detail}}),
            ),
        };
        tracing::debug!(status, action_id = %outcome.action_id, "gateway response");
        GatewayResponse {
            status,
            body,
            outcome,
        }
    }
}
