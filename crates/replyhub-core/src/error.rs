//! Error types for handoff and assignment operations.
//!
//! Ownership conflicts are business-rule violations the agent must see, so
//! they are typed and surfaced verbatim. Storage failures on these write
//! paths are fatal to the single operation and carried as `Storage`.

use thiserror::Error;

use crate::models::{AssignedAgent, CustomerKey};

#[derive(Debug, Error)]
pub enum HandoffError {
    /// The customer is already owned by a different agent.
    #[error("customer is already assigned to {0}")]
    AlreadyAssigned(AssignedAgent),

    /// The caller tried to release an assignment it does not own.
    #[error("assignment is owned by {owner}")]
    NotOwner { owner: AssignedAgent },

    /// No state exists for this customer yet.
    #[error("customer not found: {0}")]
    NotFound(CustomerKey),

    /// Every compare-and-swap attempt lost to a concurrent writer.
    #[error("too much contention updating {0}; retry")]
    Conflict(CustomerKey),

    /// The outbound message could not be delivered after the claim.
    #[error("delivery failed: {0}")]
    Delivery(#[source] anyhow::Error),

    /// The conversation store failed while reading or writing.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl HandoffError {
    /// Machine-readable code used by the HTTP layer and event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            HandoffError::AlreadyAssigned(_) => "already_assigned",
            HandoffError::NotOwner { .. } => "not_owner",
            HandoffError::NotFound(_) => "not_found",
            HandoffError::Conflict(_) => "conflict",
            HandoffError::Delivery(_) => "delivery_failed",
            HandoffError::Storage(_) => "internal",
        }
    }
}
