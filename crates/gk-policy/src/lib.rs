//! # gk-policy
//!
//! Policy model and evaluation for Gatekeeper.
//!
//! Every action an agent attempts is described as an [`Action`] and
//! evaluated against a [`PolicySet`] by [`evaluate`], which returns a
//! [`Decision`]: Allow, Deny, or RequireApproval.
//!
//! ## Key invariants
//!
//! - **Fail closed**: no matching rule → the default effect, which is Deny
//!   unless configured otherwise. A malformed rule is a [`PolicyError`] and
//!   callers must treat it as Deny.
//! - **Deterministic**: evaluation is a pure function of the action, the
//!   policy set, and the [`EvaluationContext`]. No clock reads, no I/O.
//! - **Read-only rate limits**: RateLimit effects read usage through
//!   [`UsageLookup`]; counters are consumed afterwards via [`RateLimitStore`].

pub mod action;
pub mod engine;
pub mod error;
pub mod policy_set;
pub mod rate_limit;
pub mod rule;
pub mod store;

pub use action::{Action, ActionBuilder, Resource};
pub use engine::{
    evaluate, explain, CandidateMatch, Decision, DecisionEffect, EvaluationContext,
    EvaluationTrace, RateLimitCheck, DEFAULT_RULE_ID,
};
pub use error::PolicyError;
pub use policy_set::PolicySet;
pub use rate_limit::{InMemoryRateLimiter, RateLimitKey, RateLimitStore, Unmetered, UsageLookup};
pub use rule::{Effect, MatchPredicate, Matcher, ParamConstraint, ParamOp, PolicyRule};
pub use store::PolicyStore;
