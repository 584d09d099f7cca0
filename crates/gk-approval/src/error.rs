// error.rs - Error types for the approval broker.

use thiserror::Error;
use uuid::Uuid;

use crate::request::ApprovalStatus;

/// Errors returned by [`ApprovalBroker`](crate::ApprovalBroker) operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// No approval request with this id exists.
    #[error("approval request not found: {0}")]
    NotFound(Uuid),

    /// The request already reached a terminal status.
    #[error("approval request {id} already resolved as {status}")]
    AlreadyResolved { id: Uuid, status: ApprovalStatus },

    /// The requested time-to-live cannot be represented.
    #[error("invalid approval ttl: {0}")]
    InvalidTtl(String),
}
