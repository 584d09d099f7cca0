// metadata.rs - Compile framework policy metadata into rules.
//
// Orchestration frameworks let authors attach a static policy declaration
// to a task, typically under a `reliability_policy` metadata key:
//
//   reliability_policy:
//     flow: collections_call
//     require_approval: [send_email]
//     deny: ["shell.*"]
//     rate_limits: [{ tool: web_search, limit: 10, window_secs: 60 }]
//     max_retries: 2
//     slo_ms: 180000
//     budget_usd: 0.40
//     loop_guard: { max_state_repeats: 3 }
//
// The declaration is compiled once, at configuration load, into an
// ordinary PolicySet, a RetryPolicy and TaskLimits. Nothing downstream
// knows it came from metadata.
//
// Rule precedence: deny (30) > require_approval (20) > rate_limit (10) >
// allow (0). Anything not listed falls through to Deny.

use gk_policy::{Effect, MatchPredicate, Matcher, PolicyRule, PolicySet};
use gk_runtime::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AdapterError;
use crate::task_loop::TaskLimits;

/// Metadata key frameworks nest the declaration under.
pub const METADATA_KEY: &str = "reliability_policy";

const DENY_PRIORITY: i32 = 30;
const APPROVAL_PRIORITY: i32 = 20;
const RATE_LIMIT_PRIORITY: i32 = 10;
const ALLOW_PRIORITY: i32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolRateLimit {
    pub tool: String,
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopGuard {
    pub max_state_repeats: u32,
}

/// A framework's static policy declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyMetadata {
    pub flow: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub require_approval: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub rate_limits: Vec<ToolRateLimit>,
    /// Retries after the first attempt.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub slo_ms: Option<u64>,
    #[serde(default)]
    pub budget_usd: Option<f64>,
    #[serde(default)]
    pub loop_guard: Option<LoopGuard>,
}

impl PolicyMetadata {
    /// Extract the declaration from a task's metadata object.
    pub fn from_task_metadata(metadata: &Value) -> Result<Self, AdapterError> {
        let declaration = metadata.get(METADATA_KEY).ok_or_else(|| {
            AdapterError::InvalidMetadata(format!("missing `{}` key", METADATA_KEY))
        })?;
        Ok(serde_json::from_value(declaration.clone())?)
    }
}

/// The runtime configuration a declaration compiles to.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPolicy {
    pub policy_set: PolicySet,
    pub retry: RetryPolicy,
    pub limits: TaskLimits,
}

/// Turns [`PolicyMetadata`] into rules, retry policy and task limits.
#[derive(Debug, Clone, Default)]
pub struct MetadataCompiler {
    base_retry: RetryPolicy,
}

impl MetadataCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backoff and timeout settings used for every compiled retry policy.
    pub fn with_base_retry(mut self, retry: RetryPolicy) -> Self {
        self.base_retry = retry;
        self
    }

    pub fn compile(&self, meta: &PolicyMetadata) -> Result<CompiledPolicy, AdapterError> {
        if meta.flow.trim().is_empty() {
            return Err(AdapterError::InvalidMetadata("flow must be named".into()));
        }
        if let Some(tool) = meta.deny.iter().find(|t| meta.allow.contains(*t)) {
            return Err(AdapterError::InvalidMetadata(format!(
                "tool '{}' is both allowed and denied",
                tool
            )));
        }
        if meta.budget_usd.is_some_and(|b| !b.is_finite() || b < 0.0) {
            return Err(AdapterError::InvalidMetadata(
                "budget_usd must be a non-negative number".into(),
            ));
        }

        let mut set = PolicySet::deny_all(meta.flow.clone());
        for tool in &meta.deny {
            set = set.with_rule(self.rule(&meta.flow, "deny", tool, Effect::Deny, DENY_PRIORITY));
        }
        for tool in &meta.require_approval {
            set = set.with_rule(self.rule(
                &meta.flow,
                "approval",
                tool,
                Effect::RequireApproval,
                APPROVAL_PRIORITY,
            ));
        }
        for limit in &meta.rate_limits {
            set = set.with_rule(self.rule(
                &meta.flow,
                "rate",
                &limit.tool,
                Effect::RateLimit {
                    limit: limit.limit,
                    window_secs: limit.window_secs,
                },
                RATE_LIMIT_PRIORITY,
            ));
        }
        for tool in &meta.allow {
            set = set.with_rule(self.rule(&meta.flow, "allow", tool, Effect::Allow, ALLOW_PRIORITY));
        }
        set.validate()?;

        let mut retry = self.base_retry.clone();
        if let Some(retries) = meta.max_retries {
            retry.max_attempts = retries.saturating_add(1);
        }
        retry.validate()?;

        let defaults = TaskLimits::default();
        let limits = TaskLimits {
            budget_usd: meta.budget_usd,
            slo_ms: meta.slo_ms,
            max_state_repeats: meta
                .loop_guard
                .as_ref()
                .map_or(defaults.max_state_repeats, |g| g.max_state_repeats),
            ..defaults
        };

        tracing::info!(
            flow = %meta.flow,
            rules = set.rules.len(),
            max_attempts = retry.max_attempts,
            "compiled policy metadata"
        );
        Ok(CompiledPolicy {
            policy_set: set,
            retry,
            limits,
        })
    }

    /// One rule per listed tool. Names containing glob metacharacters
    /// match as globs, everything else exactly.
    fn rule(&self, flow: &str, kind: &str, tool: &str, effect: Effect, priority: i32) -> PolicyRule {
        let matcher = if tool.contains(['*', '?', '[']) {
            Matcher::Glob(tool.to_string())
        } else {
            Matcher::Exact(tool.to_string())
        };
        let predicate = MatchPredicate {
            tool: Some(matcher),
            ..MatchPredicate::default()
        };
        PolicyRule::new(format!("{}.{}.{}", flow, kind, tool), predicate, effect).with_priority(priority)
    }
}
