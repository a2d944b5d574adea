//! Conversation flow: one inbound customer message, or one agent action,
//! from state lookup to dashboard events.
//!
//! ```text
//! inbound ──▶ observe state ──▶ message_received
//!                 │
//!     human_requested? ── yes ──▶ stop (agents own it)
//!                 │ no
//!     retrieve context ──▶ Responder ──▶ still bot? ──▶ deliver ──▶ bot_replied
//!                                                         │
//!                              wants_human ──▶ request_human ──▶ handoff_requested
//! ```
//!
//! Retrieval, responder and bot-delivery failures degrade; only
//! conversation-store failures surface, since they affect durable state.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use replyhub_core::error::HandoffError;
use replyhub_core::handoff::{HandoffCoordinator, MessageSink, Transition};
use replyhub_core::models::{AgentIdentity, Channel, ConversationMode, CustomerKey, CustomerState};

use crate::cache::{SettingsService, TenantSettings};
use crate::engine::{Degradation, RetrievalEngine, RetrievalRequest};
use crate::events::{EventKind, HubEvent};
use crate::hub::BroadcastHub;
use crate::responder::{BotReply, Responder};

/// Outbound sink that only logs; used until a messaging platform client
/// is wired in.
pub struct LogSink;

#[async_trait]
impl MessageSink for LogSink {
    async fn deliver(&self, key: &CustomerKey, text: &str) -> Result<()> {
        tracing::info!(customer = %key, chars = text.chars().count(), "outbound message");
        Ok(())
    }
}

/// A message a customer sent on a page.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub customer: CustomerKey,
    pub channel: Option<Channel>,
    pub text: String,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub state: CustomerState,
    /// `None` when a human owns the conversation or the bot is off.
    pub reply: Option<BotReply>,
    /// The responder failed and the configured fallback was sent.
    pub used_fallback: bool,
    pub handed_off: bool,
    pub degraded: Vec<Degradation>,
}

pub struct ConversationFlow {
    handoff: Arc<HandoffCoordinator>,
    engine: Arc<RetrievalEngine>,
    responder: Arc<dyn Responder>,
    sink: Arc<dyn MessageSink>,
    hub: Arc<BroadcastHub>,
    settings: Arc<SettingsService>,
    fallback_reply: String,
}

impl ConversationFlow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handoff: Arc<HandoffCoordinator>,
        engine: Arc<RetrievalEngine>,
        responder: Arc<dyn Responder>,
        sink: Arc<dyn MessageSink>,
        hub: Arc<BroadcastHub>,
        settings: Arc<SettingsService>,
        fallback_reply: impl Into<String>,
    ) -> Self {
        Self {
            handoff,
            engine,
            responder,
            sink,
            hub,
            settings,
            fallback_reply: fallback_reply.into(),
        }
    }

    pub fn handoff(&self) -> &HandoffCoordinator {
        &self.handoff
    }

    pub fn engine(&self) -> &RetrievalEngine {
        &self.engine
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }

    /// Handle one inbound customer message.
    pub async fn handle_inbound(
        &self,
        msg: &InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, HandoffError> {
        let key = &msg.customer;
        let state = self.handoff.observe(key).await?;
        self.publish(
            &key.tenant_id,
            EventKind::MessageReceived {
                customer: key.clone(),
                text: msg.text.clone(),
            },
        );

        let mut outcome = TurnOutcome {
            state,
            reply: None,
            used_fallback: false,
            handed_off: false,
            degraded: Vec::new(),
        };

        if outcome.state.mode == ConversationMode::HumanRequested {
            tracing::debug!(customer = %key, "human requested; bot stays silent");
            return Ok(outcome);
        }

        let settings = self.tenant_settings(&key.tenant_id).await;
        if !settings.bot_enabled {
            tracing::debug!(tenant = %key.tenant_id, "bot disabled for tenant");
            return Ok(outcome);
        }

        let request = RetrievalRequest {
            limit: settings.result_limit,
            budget: settings.context_budget,
            ..RetrievalRequest::new(&key.tenant_id, &key.page_id, &msg.text).channel(msg.channel)
        };
        let retrieval = self.engine.retrieve(&request, cancel).await;
        outcome.degraded = retrieval.degraded;

        let reply = match self.responder.reply(&msg.text, &retrieval.context).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    customer = %key,
                    responder = self.responder.name(),
                    error = %e,
                    "responder failed; sending fallback reply"
                );
                outcome.used_fallback = true;
                BotReply::text(self.fallback_reply.clone())
            }
        };

        // A handoff or agent claim may have landed while the responder ran.
        if let Some(current) = self.handoff.state(key).await? {
            let taken_over = current.mode == ConversationMode::HumanRequested;
            outcome.state = current;
            if taken_over {
                tracing::info!(customer = %key, "human took over mid-turn; dropping bot reply");
                return Ok(outcome);
            }
        }

        if let Err(e) = self.sink.deliver(key, &reply.text).await {
            tracing::warn!(customer = %key, error = %e, "bot reply delivery failed");
        }
        self.publish(
            &key.tenant_id,
            EventKind::BotReplied {
                customer: key.clone(),
                text: reply.text.clone(),
            },
        );

        if reply.wants_human {
            let transition = self.request_human(key).await?;
            outcome.handed_off = transition.changed;
            outcome.state = transition.state;
        }

        outcome.reply = Some(reply);
        Ok(outcome)
    }

    pub async fn request_human(&self, key: &CustomerKey) -> Result<Transition, HandoffError> {
        let t = self.handoff.request_human(key).await?;
        if t.changed {
            self.publish(
                &key.tenant_id,
                EventKind::HandoffRequested {
                    customer: key.clone(),
                    requested_at: t.state.requested_at,
                },
            );
            self.publish_state(&t.state);
        }
        Ok(t)
    }

    pub async fn resume(&self, key: &CustomerKey) -> Result<Transition, HandoffError> {
        let t = self.handoff.resume(key).await?;
        if t.changed {
            self.publish_state(&t.state);
        }
        Ok(t)
    }

    pub async fn toggle(&self, key: &CustomerKey) -> Result<Transition, HandoffError> {
        let t = self.handoff.toggle(key).await?;
        if t.state.mode == ConversationMode::HumanRequested {
            self.publish(
                &key.tenant_id,
                EventKind::HandoffRequested {
                    customer: key.clone(),
                    requested_at: t.state.requested_at,
                },
            );
        }
        self.publish_state(&t.state);
        Ok(t)
    }

    pub async fn assign(
        &self,
        key: &CustomerKey,
        agent: &AgentIdentity,
    ) -> Result<Transition, HandoffError> {
        let t = self.handoff.assign(key, agent).await?;
        if t.changed {
            self.publish_assigned(&t.state);
        }
        Ok(t)
    }

    pub async fn unassign(
        &self,
        key: &CustomerKey,
        agent_id: &str,
    ) -> Result<Transition, HandoffError> {
        let t = self.handoff.unassign(key, agent_id).await?;
        if t.changed {
            self.publish(
                &key.tenant_id,
                EventKind::AgentUnassigned {
                    customer: key.clone(),
                    agent_id: agent_id.to_string(),
                },
            );
            self.publish_state(&t.state);
        }
        Ok(t)
    }

    /// Send an agent's message, claiming the customer first if unassigned.
    pub async fn agent_reply(
        &self,
        key: &CustomerKey,
        agent: &AgentIdentity,
        text: &str,
    ) -> Result<Transition, HandoffError> {
        let t = self
            .handoff
            .send_as_agent(key, agent, text, self.sink.as_ref())
            .await?;
        if t.changed {
            self.publish_assigned(&t.state);
        }
        self.publish(
            &key.tenant_id,
            EventKind::AgentReplied {
                customer: key.clone(),
                agent: agent.clone(),
                text: text.to_string(),
            },
        );
        Ok(t)
    }

    async fn tenant_settings(&self, tenant_id: &str) -> TenantSettings {
        match self.settings.get(tenant_id).await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(tenant = tenant_id, error = %e, "settings unavailable; using defaults");
                TenantSettings::default()
            }
        }
    }

    fn publish_assigned(&self, state: &CustomerState) {
        if let Some(agent) = &state.assigned_agent {
            self.publish(
                &state.key.tenant_id,
                EventKind::AgentAssigned {
                    customer: state.key.clone(),
                    agent: agent.clone(),
                },
            );
        }
        self.publish_state(state);
    }

    fn publish_state(&self, state: &CustomerState) {
        self.publish(
            &state.key.tenant_id,
            EventKind::CustomerUpdated {
                state: state.clone(),
            },
        );
    }

    fn publish(&self, tenant_id: &str, kind: EventKind) {
        let event = HubEvent::new(kind);
        let report = self.hub.publish(tenant_id, &event);
        tracing::debug!(
            tenant = tenant_id,
            event = event.type_name(),
            delivered = report.delivered,
            dropped = report.dropped,
            "event published"
        );
    }
}
