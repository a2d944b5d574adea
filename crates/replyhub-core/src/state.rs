//! Pure customer-state transitions.
//!
//! Two states exist: `bot` (initial) and `human_requested`. Each function
//! computes the next state from a snapshot; `None` means the transition is
//! a no-op. Persisting the result atomically is the job of
//! [`HandoffCoordinator`](crate::handoff::HandoffCoordinator).
//!
//! | From | Operation | To |
//! |------|-----------|----|
//! | `bot` | request human / toggle / assign | `human_requested` (stamps `requested_at`) |
//! | `human_requested` | resume / toggle | `bot` (clears `requested_at` and agent) |
//! | `human_requested` | assign / unassign | `human_requested` |

use chrono::{DateTime, Utc};

use crate::error::HandoffError;
use crate::models::{AgentIdentity, AssignedAgent, ConversationMode, CustomerState};

fn enter_human(state: &CustomerState, now: DateTime<Utc>) -> CustomerState {
    CustomerState {
        mode: ConversationMode::HumanRequested,
        requested_at: Some(now),
        updated_at: now,
        ..state.clone()
    }
}

fn enter_bot(state: &CustomerState, now: DateTime<Utc>) -> CustomerState {
    CustomerState {
        mode: ConversationMode::Bot,
        requested_at: None,
        assigned_agent: None,
        updated_at: now,
        ..state.clone()
    }
}

pub fn request_human(state: &CustomerState, now: DateTime<Utc>) -> Option<CustomerState> {
    match state.mode {
        ConversationMode::Bot => Some(enter_human(state, now)),
        ConversationMode::HumanRequested => None,
    }
}

pub fn resume(state: &CustomerState, now: DateTime<Utc>) -> Option<CustomerState> {
    match state.mode {
        ConversationMode::Bot => None,
        ConversationMode::HumanRequested => Some(enter_bot(state, now)),
    }
}

pub fn toggle(state: &CustomerState, now: DateTime<Utc>) -> CustomerState {
    match state.mode {
        ConversationMode::Bot => enter_human(state, now),
        ConversationMode::HumanRequested => enter_bot(state, now),
    }
}

/// Assign `agent`. Assigning a bot-controlled customer also hands it over.
///
/// Re-assigning the current owner is a successful no-op.
pub fn assign(
    state: &CustomerState,
    agent: &AgentIdentity,
    now: DateTime<Utc>,
) -> Result<Option<CustomerState>, HandoffError> {
    match &state.assigned_agent {
        Some(current) if current.id == agent.id => Ok(None),
        Some(current) => Err(HandoffError::AlreadyAssigned(current.clone())),
        None => {
            let mut next = match state.mode {
                ConversationMode::Bot => enter_human(state, now),
                ConversationMode::HumanRequested => CustomerState {
                    updated_at: now,
                    ..state.clone()
                },
            };
            next.assigned_agent = Some(AssignedAgent::from_identity(agent, now));
            Ok(Some(next))
        }
    }
}

/// Release the assignment held by `agent_id`. Releasing an unassigned
/// customer is a no-op; the mode stays `human_requested`.
pub fn unassign(
    state: &CustomerState,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<CustomerState>, HandoffError> {
    match &state.assigned_agent {
        None => Ok(None),
        Some(current) if current.id != agent_id => Err(HandoffError::NotOwner {
            owner: current.clone(),
        }),
        Some(_) => Ok(Some(CustomerState {
            assigned_agent: None,
            updated_at: now,
            ..state.clone()
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CustomerKey;

    fn fresh() -> CustomerState {
        CustomerState::new(CustomerKey::new("t1", "p1", "c1"), Utc::now())
    }

    #[test]
    fn test_request_human_stamps_requested_at() {
        let s = fresh();
        let next = request_human(&s, Utc::now()).unwrap();
        assert_eq!(next.mode, ConversationMode::HumanRequested);
        assert!(next.requested_at.is_some());
        assert!(request_human(&next, Utc::now()).is_none());
    }

    #[test]
    fn test_resume_clears_requested_and_agent_together() {
        let s = request_human(&fresh(), Utc::now()).unwrap();
        let s = assign(&s, &AgentIdentity::new("a1", "Ann"), Utc::now())
            .unwrap()
            .unwrap();
        let back = resume(&s, Utc::now()).unwrap();
        assert_eq!(back.mode, ConversationMode::Bot);
        assert!(back.requested_at.is_none());
        assert!(back.assigned_agent.is_none());
        assert!(resume(&back, Utc::now()).is_none());
    }

    #[test]
    fn test_toggle_twice_restores_mode_and_clears_agent() {
        let s = fresh();
        let human = toggle(&s, Utc::now());
        let human = assign(&human, &AgentIdentity::new("a1", "Ann"), Utc::now())
            .unwrap()
            .unwrap();
        let bot = toggle(&human, Utc::now());
        assert_eq!(bot.mode, s.mode);
        assert!(bot.assigned_agent.is_none());
        assert!(bot.requested_at.is_none());
    }

    #[test]
    fn test_assign_on_bot_hands_over() {
        let next = assign(&fresh(), &AgentIdentity::new("a1", "Ann"), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(next.mode, ConversationMode::HumanRequested);
        assert!(next.requested_at.is_some());
        assert!(next.is_assigned_to("a1"));
    }

    #[test]
    fn test_assign_conflicts_and_same_agent_noop() {
        let s = assign(&fresh(), &AgentIdentity::new("a1", "Ann"), Utc::now())
            .unwrap()
            .unwrap();
        assert!(assign(&s, &AgentIdentity::new("a1", "Ann"), Utc::now())
            .unwrap()
            .is_none());
        match assign(&s, &AgentIdentity::new("a2", "Bob"), Utc::now()) {
            Err(HandoffError::AlreadyAssigned(current)) => assert_eq!(current.id, "a1"),
            other => panic!("expected AlreadyAssigned, got {:?}", other),
        }
    }

    #[test]
    fn test_unassign_requires_owner() {
        let s = assign(&fresh(), &AgentIdentity::new("a1", "Ann"), Utc::now())
            .unwrap()
            .unwrap();
        assert!(matches!(
            unassign(&s, "a2", Utc::now()),
            Err(HandoffError::NotOwner { .. })
        ));
        let released = unassign(&s, "a1", Utc::now()).unwrap().unwrap();
        assert!(released.assigned_agent.is_none());
        assert_eq!(released.mode, ConversationMode::HumanRequested);
        assert!(unassign(&released, "a1", Utc::now()).unwrap().is_none());
    }
}
