// rule.rs - Policy rules: match predicates and effects.
//
// A rule is scoped by up to three string dimensions plus any number of
// parameter constraints:
// - `tool`: which tool the action invokes (e.g., "send_email")
// - `resource`: the action's target (e.g., "fs://workspace/**")
// - `caller`: the identity of the agent issuing the action
// - `parameters`: constraints over individual parameter values
//
// Rules are immutable once loaded. A malformed rule is a configuration
// error, and configuration errors always resolve to Deny.

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::PolicyError;

/// What happens to an action matched by a rule.
///
/// The `#[serde(tag = "type")]` attribute makes this serialize as
/// `{"type": "rate_limit", "limit": 5, "window_secs": 60}` in JSON/YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
    RequireApproval,
    /// Allow at most `limit` actions per caller within a sliding window.
    RateLimit { limit: u32, window_secs: u64 },
}

impl Effect {
    /// Check that the effect's parameters can ever be satisfied.
    fn validate(&self, rule_id: &str) -> Result<(), PolicyError> {
        if let Effect::RateLimit { limit, window_secs } = self {
            if *limit == 0 {
                return Err(PolicyError::InvalidEffect {
                    rule_id: rule_id.to_string(),
                    reason: "rate limit must allow at least one action (use deny instead)"
                        .to_string(),
                });
            }
            if *window_secs == 0 {
                return Err(PolicyError::InvalidEffect {
                    rule_id: rule_id.to_string(),
                    reason: "rate limit window must be at least one second".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A string condition over one action field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    Exact(String),
    Prefix(String),
    /// Glob pattern, e.g. `"fs://workspace/**"`.
    Glob(String),
}

impl Matcher {
    /// Test the matcher against a field value.
    ///
    /// Returns `Err(reason)` when the matcher itself is malformed.
    pub fn matches(&self, value: &str) -> Result<bool, String> {
        match self {
            Matcher::Exact(expected) => Ok(value == expected),
            Matcher::Prefix(prefix) => {
                if prefix.is_empty() {
                    return Err("prefix matcher must not be empty".to_string());
                }
                Ok(value.starts_with(prefix.as_str()))
            }
            Matcher::Glob(pattern) => Pattern::new(pattern)
                .map(|p| p.matches(value))
                .map_err(|e| format!("invalid glob '{}': {}", pattern, e)),
        }
    }

    fn validate(&self) -> Result<(), String> {
        // Matching against any value surfaces the same errors as validation.
        self.matches("").map(|_| ())
    }
}

/// A constraint on a single parameter value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParamOp {
    Equals(serde_json::Value),
    OneOf(Vec<serde_json::Value>),
    /// The value is a string starting with the given prefix.
    Prefix(String),
    Present,
    Absent,
    /// The value is a number no greater than the bound.
    Max(f64),
    /// The value is a number no less than the bound.
    Min(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamConstraint {
    pub key: String,
    pub op: ParamOp,
}

impl ParamConstraint {
    pub fn new(key: impl Into<String>, op: ParamOp) -> Self {
        Self {
            key: key.into(),
            op,
        }
    }

    fn matches(&self, action: &Action) -> bool {
        let value = action.parameter(&self.key);
        match (&self.op, value) {
            (ParamOp::Present, v) => v.is_some(),
            (ParamOp::Absent, v) => v.is_none(),
            (_, None) => false,
            (ParamOp::Equals(expected), Some(v)) => v == expected,
            (ParamOp::OneOf(options), Some(v)) => options.contains(v),
            (ParamOp::Prefix(prefix), Some(v)) => v
                .as_str()
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
            (ParamOp::Max(bound), Some(v)) => v.as_f64().map(|n| n <= *bound).unwrap_or(false),
            (ParamOp::Min(bound), Some(v)) => v.as_f64().map(|n| n >= *bound).unwrap_or(false),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.key.trim().is_empty() {
            return Err("parameter constraint has an empty key".to_string());
        }
        match &self.op {
            ParamOp::OneOf(options) if options.is_empty() => Err(format!(
                "one_of constraint on '{}' has no options",
                self.key
            )),
            ParamOp::Max(n) | ParamOp::Min(n) if !n.is_finite() => {
                Err(format!("bound on '{}' is not a finite number", self.key))
            }
            _ => Ok(()),
        }
    }
}

/// Conditions over action fields. Every present condition must hold.
///
/// An empty predicate matches every action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchPredicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<Matcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Matcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<Matcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParamConstraint>,
}

impl MatchPredicate {
    /// A predicate matching one tool by exact name.
    pub fn tool(name: impl Into<String>) -> Self {
        Self {
            tool: Some(Matcher::Exact(name.into())),
            ..Self::default()
        }
    }

    /// Number of conditions in the predicate. More conditions = more specific.
    pub fn specificity(&self) -> usize {
        [&self.tool, &self.resource, &self.caller]
            .iter()
            .filter(|m| m.is_some())
            .count()
            + self.parameters.len()
    }

    /// Test the predicate against an action.
    pub fn matches(&self, action: &Action) -> Result<bool, String> {
        let fields = [
            (&self.tool, action.tool_name().to_string()),
            (&self.resource, action.resource().match_key()),
            (&self.caller, action.caller_identity().to_string()),
        ];
        for (matcher, value) in fields.iter() {
            if let Some(m) = matcher {
                if !m.matches(value)? {
                    return Ok(false);
                }
            }
        }
        Ok(self.parameters.iter().all(|c| c.matches(action)))
    }

    fn validate(&self) -> Result<(), String> {
        for matcher in [&self.tool, &self.resource, &self.caller].into_iter().flatten() {
            matcher.validate()?;
        }
        for constraint in &self.parameters {
            constraint.validate()?;
        }
        // Contradictory numeric bounds on the same key can never match.
        for min in &self.parameters {
            let ParamOp::Min(lo) = min.op else { continue };
            for max in self.parameters.iter().filter(|c| c.key == min.key) {
                if let ParamOp::Max(hi) = max.op {
                    if lo > hi {
                        return Err(format!(
                            "min {} exceeds max {} on parameter '{}'",
                            lo, hi, min.key
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A single policy rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    pub id: String,
    #[serde(rename = "match", default)]
    pub predicate: MatchPredicate,
    pub effect: Effect,
    /// Higher priority wins when several rules match.
    #[serde(default)]
    pub priority: i32,
}

impl PolicyRule {
    pub fn new(id: impl Into<String>, predicate: MatchPredicate, effect: Effect) -> Self {
        Self {
            id: id.into(),
            predicate,
            effect,
            priority: 0,
        }
    }

    /// Set the priority and return self (builder pattern).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Check that the rule can be evaluated.
    pub fn validate(&self) -> Result<(), PolicyError> {
        self.predicate
            .validate()
            .map_err(|reason| PolicyError::MalformedPredicate {
                rule_id: self.id.clone(),
                reason,
            })?;
        self.effect.validate(&self.id)
    }
}
