//! Dashboard events published through the [`BroadcastHub`](crate::hub::BroadcastHub).
//!
//! Every event serializes to a flat JSON object with a `type`
//! discriminator and a `timestamp`:
//!
//! ```json
//! {"type": "agent_assigned", "timestamp": "2026-01-01T00:00:00Z", "customer": {...}, "agent": {...}}
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use replyhub_core::models::{AgentIdentity, AssignedAgent, CustomerKey, CustomerState};

#[derive(Debug, Clone, Serialize)]
pub struct HubEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl HubEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    /// The `type` discriminator as it appears on the wire.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// First frame on a new dashboard socket.
    Connected { connection_id: String },
    CustomerUpdated { state: CustomerState },
    MessageReceived { customer: CustomerKey, text: String },
    BotReplied { customer: CustomerKey, text: String },
    AgentReplied {
        customer: CustomerKey,
        agent: AgentIdentity,
        text: String,
    },
    HandoffRequested {
        customer: CustomerKey,
        requested_at: Option<DateTime<Utc>>,
    },
    AgentAssigned {
        customer: CustomerKey,
        agent: AssignedAgent,
    },
    AgentUnassigned { customer: CustomerKey, agent_id: String },
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::Connected { .. } => "connected",
            EventKind::CustomerUpdated { .. } => "customer_updated",
            EventKind::MessageReceived { .. } => "message_received",
            EventKind::BotReplied { .. } => "bot_replied",
            EventKind::AgentReplied { .. } => "agent_replied",
            EventKind::HandoffRequested { .. } => "handoff_requested",
            EventKind::AgentAssigned { .. } => "agent_assigned",
            EventKind::AgentUnassigned { .. } => "agent_unassigned",
        }
    }
}

impl From<EventKind> for HubEvent {
    fn from(kind: EventKind) -> Self {
        HubEvent::new(kind)
    }
}
