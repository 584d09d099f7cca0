// engine.rs - Policy evaluation.
//
// `evaluate()` is the single chokepoint: every action flows through it
// before anything executes. It is a pure function of (action, policy set,
// context). Rule selection:
//
// 1. Validate each rule → malformed → ConfigurationError (caller denies)
// 2. Keep the rules whose predicate matches the action
// 3. Highest priority wins
// 4. Ties → most specific predicate (more conditions) wins
// 5. Still tied → the rule listed first wins
// 6. No match → the policy set's default effect (Deny unless configured)
//
// RateLimit effects resolve to Allow or Deny by reading current usage from
// the context. Counters are never touched here.

use std::cmp::Reverse;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::PolicyError;
use crate::policy_set::PolicySet;
use crate::rate_limit::{RateLimitKey, Unmetered, UsageLookup};
use crate::rule::{Effect, PolicyRule};

/// Rule id used for rate-limit keys when the default effect applies.
pub const DEFAULT_RULE_ID: &str = "<default>";

/// Point-in-time inputs to an evaluation.
///
/// `now` is supplied rather than read from the clock so the same inputs
/// always produce the same decision.
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub now: DateTime<Utc>,
    pub usage: &'a dyn UsageLookup,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(now: DateTime<Utc>, usage: &'a dyn UsageLookup) -> Self {
        Self { now, usage }
    }

    /// A context with no rate-limit state (every counter reads zero).
    pub fn unmetered(now: DateTime<Utc>) -> EvaluationContext<'static> {
        static UNMETERED: Unmetered = Unmetered;
        EvaluationContext {
            now,
            usage: &UNMETERED,
        }
    }
}

/// The resolved verdict. RateLimit never appears here: it resolves to
/// Allow or Deny during evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionEffect {
    Allow,
    Deny,
    RequireApproval,
}

impl std::fmt::Display for DecisionEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionEffect::Allow => write!(f, "allow"),
            DecisionEffect::Deny => write!(f, "deny"),
            DecisionEffect::RequireApproval => write!(f, "require_approval"),
        }
    }
}

/// Usage observed while resolving a RateLimit effect.
///
/// The interceptor uses this to consume a slot once the action proceeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitCheck {
    pub key: RateLimitKey,
    pub limit: u32,
    pub window_secs: u64,
    pub observed: u32,
}

impl RateLimitCheck {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// The result of evaluating one action against one policy set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Decision {
    pub effect: DecisionEffect,
    /// `None` means the default effect applied.
    pub matched_rule_id: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    pub policy_version: u64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitCheck>,
}

impl Decision {
    /// The decision a caller must substitute when evaluation itself fails.
    pub fn fail_closed(error: &PolicyError, now: DateTime<Utc>, policy_version: u64) -> Self {
        Self {
            effect: DecisionEffect::Deny,
            matched_rule_id: None,
            evaluated_at: now,
            policy_version,
            reason: format!("configuration error: {}", error),
            rate_limit: None,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.effect == DecisionEffect::Allow
    }
}

/// One rule that matched during evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateMatch {
    pub rule_id: String,
    pub priority: i32,
    pub specificity: usize,
    /// Position in the policy set (insertion order).
    pub index: usize,
}

/// Full evaluation trace returned alongside a Decision.
///
/// Records every rule that matched, so operators can see why one rule
/// beat another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationTrace {
    pub decision: Decision,
    pub rules_checked: usize,
    pub candidates: Vec<CandidateMatch>,
}

/// Evaluate an action against a policy set.
pub fn evaluate(
    action: &Action,
    policy: &PolicySet,
    context: &EvaluationContext<'_>,
) -> Result<Decision, PolicyError> {
    explain(action, policy, context).map(|trace| trace.decision)
}

/// Evaluate an action and return the decision with the matching rules.
pub fn explain(
    action: &Action,
    policy: &PolicySet,
    context: &EvaluationContext<'_>,
) -> Result<EvaluationTrace, PolicyError> {
    let mut candidates = Vec::new();
    for (index, rule) in policy.rules.iter().enumerate() {
        rule.validate()?;
        let matched =
            rule.predicate
                .matches(action)
                .map_err(|reason| PolicyError::MalformedPredicate {
                    rule_id: rule.id.clone(),
                    reason,
                })?;
        if matched {
            candidates.push(CandidateMatch {
                rule_id: rule.id.clone(),
                priority: rule.priority,
                specificity: rule.predicate.specificity(),
                index,
            });
        }
    }

    let winner = candidates
        .iter()
        .max_by_key(|c| (c.priority, c.specificity, Reverse(c.index)))
        .map(|c| &policy.rules[c.index]);

    let decision = match winner {
        Some(rule) => resolve(action, policy, Some(rule), &rule.effect, context),
        None => {
            PolicyRule::new(DEFAULT_RULE_ID, Default::default(), policy.default_effect.clone())
                .validate()?;
            resolve(action, policy, None, &policy.default_effect, context)
        }
    };

    Ok(EvaluationTrace {
        decision,
        rules_checked: policy.rules.len(),
        candidates,
    })
}

fn resolve(
    action: &Action,
    policy: &PolicySet,
    rule: Option<&PolicyRule>,
    effect: &Effect,
    context: &EvaluationContext<'_>,
) -> Decision {
    let source = match rule {
        Some(r) => format!("rule '{}'", r.id),
        None => "default effect".to_string(),
    };
    let mut decision = Decision {
        effect: DecisionEffect::Deny,
        matched_rule_id: rule.map(|r| r.id.clone()),
        evaluated_at: context.now,
        policy_version: policy.version,
        reason: String::new(),
        rate_limit: None,
    };

    match effect {
        Effect::Allow => {
            decision.effect = DecisionEffect::Allow;
            decision.reason = format!("{} allows '{}'", source, action.tool_name());
        }
        Effect::Deny => {
            decision.reason = format!("{} denies '{}'", source, action.tool_name());
        }
        Effect::RequireApproval => {
            decision.effect = DecisionEffect::RequireApproval;
            decision.reason = format!("{} requires approval for '{}'", source, action.tool_name());
        }
        Effect::RateLimit { limit, window_secs } => {
            let key = RateLimitKey::new(
                rule.map(|r| r.id.as_str()).unwrap_or(DEFAULT_RULE_ID),
                action.caller_identity(),
            );
            let observed =
                context
                    .usage
                    .usage(&key, Duration::from_secs(*window_secs), context.now);
            if observed >= *limit {
                decision.reason = format!(
                    "{} rate limit exceeded: {}/{} in {}s",
                    source, observed, limit, window_secs
                );
            } else {
                decision.effect = DecisionEffect::Allow;
                decision.reason = format!(
                    "{} rate limit ok: {}/{} in {}s",
                    source, observed, limit, window_secs
                );
            }
            decision.rate_limit = Some(RateLimitCheck {
                key,
                limit: *limit,
                window_secs: *window_secs,
                observed,
            });
        }
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{MatchPredicate, Matcher, ParamConstraint, ParamOp};

    /// Helper: a usage lookup that reports a fixed count for every key.
    struct FixedUsage(u32);

    impl UsageLookup for FixedUsage {
        fn usage(&self, _key: &RateLimitKey, _window: Duration, _now: DateTime<Utc>) -> u32 {
            self.0
        }
    }

    fn tool(name: &str) -> MatchPredicate {
        MatchPredicate {
            tool: Some(Matcher::Exact(name.to_string())),
            ..Default::default()
        }
    }

    fn email_action() -> Action {
        Action::builder("send_email")
            .resource("customer@x.com")
            .caller("agent-1")
            .build()
    }

    #[test]
    fn evaluation_is_deterministic() {
        let set = PolicySet::deny_all("p")
            .with_rule(PolicyRule::new("a", tool("send_email"), Effect::Allow).with_priority(1))
            .with_rule(PolicyRule::new("b", MatchPredicate::default(), Effect::Deny));
        let action = email_action();
        let ctx = EvaluationContext::unmetered(Utc::now());
        let first = evaluate(&action, &set, &ctx).unwrap();
        let second = evaluate(&action, &set, &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_policy_fails_closed() {
        let set = PolicySet::deny_all("empty");
        let decision =
            evaluate(&email_action(), &set, &EvaluationContext::unmetered(Utc::now())).unwrap();
        assert_eq!(decision.effect, DecisionEffect::Deny);
        assert!(decision.matched_rule_id.is_none());
    }

    #[test]
    fn default_effect_applies_when_nothing_matches() {
        let set = PolicySet::deny_all("open")
            .with_default(Effect::Allow)
            .with_rule(PolicyRule::new("sms", tool("send_sms"), Effect::Deny));
        let decision =
            evaluate(&email_action(), &set, &EvaluationContext::unmetered(Utc::now())).unwrap();
        assert_eq!(decision.effect, DecisionEffect::Allow);
        assert!(decision.matched_rule_id.is_none());
    }

    #[test]
    fn higher_priority_wins() {
        let set = PolicySet::deny_all("p")
            .with_rule(PolicyRule::new("low", tool("send_email"), Effect::Allow).with_priority(1))
            .with_rule(
                PolicyRule::new("high", MatchPredicate::default(), Effect::Deny).with_priority(5),
            );
        let decision =
            evaluate(&email_action(), &set, &EvaluationContext::unmetered(Utc::now())).unwrap();
        assert_eq!(decision.effect, DecisionEffect::Deny);
        assert_eq!(decision.matched_rule_id.as_deref(), Some("high"));
    }

    #[test]
    fn equal_priority_prefers_more_specific_rule() {
        let specific = MatchPredicate {
            tool: Some(Matcher::Exact("send_email".into())),
            resource: Some(Matcher::Glob("*@x.com".into())),
            ..Default::default()
        };
        let set = PolicySet::deny_all("p")
            .with_rule(PolicyRule::new("broad", tool("send_email"), Effect::Allow).with_priority(3))
            .with_rule(PolicyRule::new("narrow", specific, Effect::RequireApproval).with_priority(3));
        let decision =
            evaluate(&email_action(), &set, &EvaluationContext::unmetered(Utc::now())).unwrap();
        assert_eq!(decision.effect, DecisionEffect::RequireApproval);
        assert_eq!(decision.matched_rule_id.as_deref(), Some("narrow"));
    }

    #[test]
    fn full_tie_prefers_first_listed_rule() {
        let set = PolicySet::deny_all("p")
            .with_rule(PolicyRule::new("first", tool("send_email"), Effect::Deny))
            .with_rule(PolicyRule::new("second", tool("send_email"), Effect::Allow));
        let decision =
            evaluate(&email_action(), &set, &EvaluationContext::unmetered(Utc::now())).unwrap();
        assert_eq!(decision.matched_rule_id.as_deref(), Some("first"));
    }

    #[test]
    fn require_approval_scenario() {
        let set = PolicySet::deny_all("email").with_rule(
            PolicyRule::new("gate-email", tool("send_email"), Effect::RequireApproval)
                .with_priority(10),
        );
        let decision =
            evaluate(&email_action(), &set, &EvaluationContext::unmetered(Utc::now())).unwrap();
        assert_eq!(decision.effect, DecisionEffect::RequireApproval);
        assert_eq!(decision.matched_rule_id.as_deref(), Some("gate-email"));
    }

    #[test]
    fn rate_limit_allows_under_limit_and_denies_at_limit() {
        let set = PolicySet::deny_all("rl").with_rule(PolicyRule::new(
            "email-rl",
            tool("send_email"),
            Effect::RateLimit {
                limit: 3,
                window_secs: 60,
            },
        ));
        let now = Utc::now();

        let under = FixedUsage(2);
        let decision = evaluate(&email_action(), &set, &EvaluationContext::new(now, &under)).unwrap();
        assert_eq!(decision.effect, DecisionEffect::Allow);
        let check = decision.rate_limit.unwrap();
        assert_eq!(check.key, RateLimitKey::new("email-rl", "agent-1"));
        assert_eq!(check.observed, 2);

        let at = FixedUsage(3);
        let decision = evaluate(&email_action(), &set, &EvaluationContext::new(now, &at)).unwrap();
        assert_eq!(decision.effect, DecisionEffect::Deny);
        assert!(decision.reason.contains("rate limit exceeded"));
    }

    #[test]
    fn default_rate_limit_uses_default_key() {
        let set = PolicySet::deny_all("rl").with_default(Effect::RateLimit {
            limit: 1,
            window_secs: 10,
        });
        let decision =
            evaluate(&email_action(), &set, &EvaluationContext::unmetered(Utc::now())).unwrap();
        assert_eq!(decision.effect, DecisionEffect::Allow);
        assert_eq!(decision.rate_limit.unwrap().key.rule_id, DEFAULT_RULE_ID);
    }

    #[test]
    fn malformed_predicate_is_configuration_error() {
        let bad = MatchPredicate {
            resource: Some(Matcher::Glob("[unclosed".into())),
            ..Default::default()
        };
        let set = PolicySet::deny_all("bad").with_rule(PolicyRule::new("bad", bad, Effect::Allow));
        let err = evaluate(&email_action(), &set, &EvaluationContext::unmetered(Utc::now()))
            .unwrap_err();
        assert!(matches!(err, PolicyError::MalformedPredicate { ref rule_id, .. } if rule_id == "bad"));

        let fallback = Decision::fail_closed(&err, Utc::now(), set.version);
        assert_eq!(fallback.effect, DecisionEffect::Deny);
        assert!(fallback.reason.starts_with("configuration error"));
    }

    #[test]
    fn parameter_constraints_participate_in_matching() {
        let big_refund = MatchPredicate {
            tool: Some(Matcher::Exact("refund".into())),
            parameters: vec![ParamConstraint::new("amount", ParamOp::Min(500.0))],
            ..Default::default()
        };
        let set = PolicySet::deny_all("refunds")
            .with_rule(PolicyRule::new("small", tool("refund"), Effect::Allow))
            .with_rule(PolicyRule::new("large", big_refund, Effect::RequireApproval));
        let ctx = EvaluationContext::unmetered(Utc::now());

        let small = Action::builder("refund").parameter("amount", 20).build();
        assert_eq!(evaluate(&small, &set, &ctx).unwrap().effect, DecisionEffect::Allow);

        let large = Action::builder("refund").parameter("amount", 900).build();
        assert_eq!(
            evaluate(&large, &set, &ctx).unwrap().effect,
            DecisionEffect::RequireApproval
        );
    }

    #[test]
    fn explain_lists_all_matching_rules() {
        let set = PolicySet::deny_all("p")
            .with_rule(PolicyRule::new("a", tool("send_email"), Effect::Allow))
            .with_rule(PolicyRule::new("b", tool("send_sms"), Effect::Allow))
            .with_rule(PolicyRule::new("c", MatchPredicate::default(), Effect::Deny));
        let trace =
            explain(&email_action(), &set, &EvaluationContext::unmetered(Utc::now())).unwrap();
        assert_eq!(trace.rules_checked, 3);
        let ids: Vec<&str> = trace.candidates.iter().map(|c| c.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        // "a" is more specific than the catch-all "c".
        assert_eq!(trace.decision.matched_rule_id.as_deref(), Some("a"));
    }

    #[test]
    fn decision_serializes_effect_as_snake_case() {
        let json = serde_json::to_string(&DecisionEffect::RequireApproval).unwrap();
        assert_eq!(json, "\"require_approval\"");
    }
}
