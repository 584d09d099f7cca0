//! # gk-approval
//!
//! Human-in-the-loop approval for actions the policy engine marked
//! RequireApproval.
//!
//! An [`ApprovalBroker`] holds each [`ApprovalRequest`] from Pending to a
//! terminal status (Approved, Rejected, or Expired). Resolution is
//! compare-and-swap: concurrent resolvers race, one wins, the rest get
//! [`ApprovalError::AlreadyResolved`]. Requests that outlive their TTL are
//! expired, never silently approved.

pub mod broker;
pub mod error;
pub mod request;

pub use broker::ApprovalBroker;
pub use error::ApprovalError;
pub use request::{ApprovalOutcome, ApprovalRequest, ApprovalStatus};
