// error.rs - Error types for the policy subsystem.

use thiserror::Error;

/// Errors that can occur during policy loading and evaluation.
///
/// Every variant except `Parse` is a configuration error: the caller must
/// treat it as a Deny (fail closed), never as an Allow.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A rule's match predicate is malformed and cannot be evaluated.
    #[error("malformed predicate in rule '{rule_id}': {reason}")]
    MalformedPredicate { rule_id: String, reason: String },

    /// A rule's effect carries parameters that can never be satisfied.
    #[error("invalid effect in rule '{rule_id}': {reason}")]
    InvalidEffect { rule_id: String, reason: String },

    /// Two rules in the same policy set share an id.
    #[error("duplicate rule id '{0}'")]
    DuplicateRule(String),

    /// A replacement policy set does not advance the version.
    #[error("stale policy version {offered} (active version is {active})")]
    StaleVersion { offered: u64, active: u64 },

    /// The policy document could not be parsed.
    #[error("policy parse error: {0}")]
    Parse(String),
}
