//! Customer state machine and agent assignment over a [`ConversationStore`].
//!
//! Every operation is a read-compute-CAS loop: load the current state,
//! compute the next state with a pure function from [`crate::state`], and
//! write it only if the stored version is unchanged. A lost race reloads
//! and recomputes, so a second agent trying to claim an already-claimed
//! customer sees the winner and fails with
//! [`HandoffError::AlreadyAssigned`] instead of overwriting it.
//!
//! Because the atomicity lives in the store's conditional write, this is
//! safe across processes, not just across tasks.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::HandoffError;
use crate::models::{AgentIdentity, ConversationMode, CustomerKey, CustomerState};
use crate::state;
use crate::store::ConversationStore;

/// Default number of compare-and-swap attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 32;

/// Delivers an agent's message to the customer (e.g. via the Graph API).
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, key: &CustomerKey, text: &str) -> Result<()>;
}

/// Result of a state operation.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    /// The state after the operation.
    pub state: CustomerState,
    /// False when the operation was a no-op.
    pub changed: bool,
}

/// Coordinates handoff transitions and assignments for all tenants.
pub struct HandoffCoordinator {
    store: Arc<dyn ConversationStore>,
    max_attempts: usize,
}

impl HandoffCoordinator {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Record that a customer wrote in; creates the `bot` state on first
    /// contact.
    pub async fn observe(&self, key: &CustomerKey) -> Result<CustomerState, HandoffError> {
        Ok(self.store.create_if_absent(key, Utc::now()).await?)
    }

    pub async fn state(&self, key: &CustomerKey) -> Result<Option<CustomerState>, HandoffError> {
        Ok(self.store.load(key).await?)
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        mode: Option<ConversationMode>,
    ) -> Result<Vec<CustomerState>, HandoffError> {
        Ok(self.store.list(tenant_id, mode).await?)
    }

    /// `bot` → `human_requested`. No-op if a human is already requested.
    pub async fn request_human(&self, key: &CustomerKey) -> Result<Transition, HandoffError> {
        self.apply(key, true, |s, now| Ok(state::request_human(s, now)))
            .await
    }

    /// `human_requested` → `bot`, clearing the request time and the agent
    /// in the same write.
    pub async fn resume(&self, key: &CustomerKey) -> Result<Transition, HandoffError> {
        self.apply(key, false, |s, now| Ok(state::resume(s, now)))
            .await
    }

    /// Flip the mode as one atomic read-modify-write.
    pub async fn toggle(&self, key: &CustomerKey) -> Result<Transition, HandoffError> {
        self.apply(key, true, |s, now| Ok(Some(state::toggle(s, now))))
            .await
    }

    /// Claim a customer for `agent`. Fails with `AlreadyAssigned` if a
    /// different agent holds it; re-assigning the owner is a no-op.
    pub async fn assign(
        &self,
        key: &CustomerKey,
        agent: &AgentIdentity,
    ) -> Result<Transition, HandoffError> {
        let result = self
            .apply(key, false, |s, now| state::assign(s, agent, now))
            .await;
        match &result {
            Ok(t) if t.changed => {
                tracing::info!(customer = %key, agent = %agent.id, "agent assigned")
            }
            Err(HandoffError::AlreadyAssigned(owner)) => tracing::debug!(
                customer = %key,
                agent = %agent.id,
                owner = %owner.id,
                "assignment rejected"
            ),
            _ => {}
        }
        result
    }

    /// Release the assignment held by `agent_id`.
    pub async fn unassign(
        &self,
        key: &CustomerKey,
        agent_id: &str,
    ) -> Result<Transition, HandoffError> {
        self.apply(key, false, |s, now| state::unassign(s, agent_id, now))
            .await
    }

    /// Send `text` to the customer on behalf of `agent`, auto-assigning an
    /// unassigned customer first.
    ///
    /// The claim is a CAS: if another agent wins the race, this fails with
    /// `AlreadyAssigned` and nothing is sent.
    pub async fn send_as_agent(
        &self,
        key: &CustomerKey,
        agent: &AgentIdentity,
        text: &str,
        sink: &dyn MessageSink,
    ) -> Result<Transition, HandoffError> {
        let claim = self.assign(key, agent).await?;
        sink.deliver(key, text)
            .await
            .map_err(HandoffError::Delivery)?;
        Ok(claim)
    }

    async fn apply<F>(
        &self,
        key: &CustomerKey,
        create: bool,
        mut next_state: F,
    ) -> Result<Transition, HandoffError>
    where
        F: FnMut(&CustomerState, DateTime<Utc>) -> Result<Option<CustomerState>, HandoffError>
            + Send,
    {
        let mut current = if create {
            self.store.create_if_absent(key, Utc::now()).await?
        } else {
            self.load_existing(key).await?
        };

        for attempt in 0..self.max_attempts {
            let Some(next) = next_state(&current, Utc::now())? else {
                return Ok(Transition {
                    state: current,
                    changed: false,
                });
            };
            match self.store.compare_and_swap(current.version, &next).await? {
                Some(written) => {
                    tracing::debug!(
                        customer = %key,
                        mode = %written.mode,
                        version = written.version,
                        "customer state updated"
                    );
                    return Ok(Transition {
                        state: written,
                        changed: true,
                    });
                }
                None => {
                    tracing::debug!(customer = %key, attempt, "lost compare-and-swap race");
                    current = self.load_existing(key).await?;
                }
            }
        }

        tracing::warn!(customer = %key, attempts = self.max_attempts, "giving up on contended update");
        Err(HandoffError::Conflict(key.clone()))
    }

    async fn load_existing(&self, key: &CustomerKey) -> Result<CustomerState, HandoffError> {
        self.store
            .load(key)
            .await?
            .ok_or_else(|| HandoffError::NotFound(key.clone()))
    }
}
