// tool.rs - Wrap an async function so every call is policy-checked.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use gk_policy::Action;
use gk_runtime::{ExecutionOutcome, Interceptor, RetryPolicy, ToolFailure};
use serde_json::Value;

/// Named tool arguments, in the same shape as `Action::parameters`.
pub type ToolArgs = BTreeMap<String, Value>;

/// A tool function that only runs when policy allows it.
///
/// The action's tool name is the declared `name`, its parameters are the
/// call arguments, and (optionally) one argument doubles as the resource.
pub struct GuardedTool<F> {
    name: String,
    interceptor: Arc<Interceptor>,
    retry: RetryPolicy,
    resource_arg: Option<String>,
    func: F,
}

impl<F, Fut> GuardedTool<F>
where
    F: Fn(ToolArgs) -> Fut,
    Fut: Future<Output = Result<Value, ToolFailure>>,
{
    pub fn new(name: impl Into<String>, interceptor: Arc<Interceptor>, func: F) -> Self {
        Self {
            name: name.into(),
            retry: interceptor.default_retry().clone(),
            interceptor,
            resource_arg: None,
            func,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Use the string value of argument `key` as the action's resource
    /// (e.g. `"to"` for an email tool).
    pub fn with_resource_arg(mut self, key: impl Into<String>) -> Self {
        self.resource_arg = Some(key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the tool on behalf of `caller`.
    pub async fn call(&self, caller: &str, args: ToolArgs) -> ExecutionOutcome {
        let mut builder = Action::builder(self.name.as_str())
            .caller(caller)
            .parameters(args.clone());
        let resource = self
            .resource_arg
            .as_ref()
            .and_then(|key| args.get(key))
            .and_then(Value::as_str);
        if let Some(resource) = resource {
            builder = builder.resource(resource);
        }

        self.interceptor
            .intercept(builder.build(), |_| (self.func)(args.clone()), &self.retry)
            .await
    }
}
