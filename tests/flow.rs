use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use replyhub::cache::{NoopCache, SettingsService, TenantSettings};
use replyhub::config::RetrievalConfig;
use replyhub::engine::RetrievalEngine;
use replyhub::flow::{ConversationFlow, InboundMessage};
use replyhub::hub::{BroadcastHub, ConnectionInfo, Payload};
use replyhub::ingest::{ingest_text, IngestTarget};
use replyhub::responder::{BotReply, DisabledResponder, Responder};
use replyhub::sqlite_store::SqliteStore;
use replyhub::{db, migrate};
use replyhub_core::embedding::HashEmbedder;
use replyhub_core::error::HandoffError;
use replyhub_core::handoff::{HandoffCoordinator, MessageSink};
use replyhub_core::models::{AgentIdentity, ChannelSet, ConversationMode, CustomerKey};
use replyhub_core::store::ConversationStore;

const FALLBACK: &str = "Someone will get back to you soon.";

/// Echoes the message and asks for a human when the message mentions one.
#[derive(Default)]
struct ScriptedResponder {
    contexts: Mutex<Vec<String>>,
}

#[async_trait]
impl Responder for ScriptedResponder {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn reply(&self, message: &str, context: &str) -> Result<BotReply> {
        self.contexts.lock().unwrap().push(context.to_string());
        Ok(BotReply {
            text: format!("answer to: {}", message),
            wants_human: message.contains("human"),
        })
    }
}

/// Answers only after a pause, leaving room for an agent to step in.
struct SlowResponder(Duration);

#[async_trait]
impl Responder for SlowResponder {
    fn name(&self) -> &str {
        "slow"
    }

    async fn reply(&self, _message: &str, _context: &str) -> Result<BotReply> {
        tokio::time::sleep(self.0).await;
        Ok(BotReply::text("bot: hello".to_string()))
    }
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(CustomerKey, String)>>,
}

impl RecordingSink {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn deliver(&self, key: &CustomerKey, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push((key.clone(), text.to_string()));
        Ok(())
    }
}

struct Harness {
    _tmp: TempDir,
    store: SqliteStore,
    flow: ConversationFlow,
    sink: Arc<RecordingSink>,
    dashboard: mpsc::Receiver<Payload>,
}

async fn harness(responder: Arc<dyn Responder>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("flow.sqlite")).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let store = SqliteStore::new(pool);

    let embedder = Arc::new(HashEmbedder::new(64));
    let target = IngestTarget {
        tenant_id: "t1",
        page_id: "p1",
        channels: ChannelSet::default(),
        max_tokens: 700,
    };
    ingest_text(
        &store,
        embedder.as_ref(),
        &target,
        "upload",
        "Our opening hours are 9am to 5pm on weekdays.\n\nReturns are accepted within 30 days.",
    )
    .await
    .unwrap();

    let hub = Arc::new(BroadcastHub::new(64));
    let (tx, dashboard) = hub.mailbox();
    hub.register("t1", "dash-1", ConnectionInfo::default(), tx);

    let sink = Arc::new(RecordingSink::default());
    let flow = ConversationFlow::new(
        Arc::new(HandoffCoordinator::new(Arc::new(store.clone()))),
        Arc::new(RetrievalEngine::new(
            Arc::new(store.clone()),
            embedder,
            &RetrievalConfig::default(),
        )),
        responder,
        sink.clone(),
        hub,
        Arc::new(SettingsService::new(Arc::new(store.clone()), Arc::new(NoopCache))),
        FALLBACK,
    );

    Harness {
        _tmp: tmp,
        store,
        flow,
        sink,
        dashboard,
    }
}

fn inbound(customer: &str, text: &str) -> InboundMessage {
    InboundMessage {
        customer: CustomerKey::new("t1", "p1", customer),
        channel: None,
        text: text.to_string(),
    }
}

fn drain_types(rx: &mut mpsc::Receiver<Payload>) -> Vec<String> {
    let mut types = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        types.push(value["type"].as_str().unwrap().to_string());
    }
    types
}

#[tokio::test]
async fn test_bot_reply_is_grounded_and_published() {
    let responder = Arc::new(ScriptedResponder::default());
    let mut h = harness(responder.clone()).await;

    let outcome = h
        .flow
        .handle_inbound(&inbound("c1", "opening hours"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state.mode, ConversationMode::Bot);
    assert!(!outcome.used_fallback);
    assert_eq!(
        outcome.reply.map(|r| r.text),
        Some("answer to: opening hours".to_string())
    );
    assert!(responder.contexts.lock().unwrap()[0].contains("9am to 5pm"));
    assert_eq!(h.sink.texts(), vec!["answer to: opening hours".to_string()]);
    assert_eq!(
        drain_types(&mut h.dashboard),
        vec!["message_received", "bot_replied"]
    );
}

#[tokio::test]
async fn test_responder_failure_sends_fallback() {
    let h = harness(Arc::new(DisabledResponder)).await;

    let outcome = h
        .flow
        .handle_inbound(&inbound("c1", "returns"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.used_fallback);
    assert_eq!(h.sink.texts(), vec![FALLBACK.to_string()]);
}

#[tokio::test]
async fn test_wants_human_hands_off_and_silences_bot() {
    let mut h = harness(Arc::new(ScriptedResponder::default())).await;
    let cancel = CancellationToken::new();

    let outcome = h
        .flow
        .handle_inbound(&inbound("c1", "let me talk to a human"), &cancel)
        .await
        .unwrap();
    assert!(outcome.handed_off);
    assert_eq!(outcome.state.mode, ConversationMode::HumanRequested);
    assert!(outcome.state.requested_at.is_some());

    let types = drain_types(&mut h.dashboard);
    assert!(types.contains(&"handoff_requested".to_string()));
    assert!(types.contains(&"customer_updated".to_string()));

    let second = h
        .flow
        .handle_inbound(&inbound("c1", "hello?"), &cancel)
        .await
        .unwrap();
    assert!(second.reply.is_none());
    assert_eq!(h.sink.texts().len(), 1);
    assert_eq!(drain_types(&mut h.dashboard), vec!["message_received"]);
}

#[tokio::test]
async fn test_disabled_bot_records_but_does_not_reply() {
    let h = harness(Arc::new(ScriptedResponder::default())).await;
    h.flow
        .settings()
        .update(
            "t1",
            &TenantSettings {
                bot_enabled: false,
                ..TenantSettings::default()
            },
        )
        .await
        .unwrap();

    let outcome = h
        .flow
        .handle_inbound(&inbound("c1", "opening hours"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.reply.is_none());
    assert!(h.sink.texts().is_empty());
    assert_eq!(outcome.state.version, 0);
}

#[tokio::test]
async fn test_agent_reply_claims_then_excludes_other_agents() {
    let mut h = harness(Arc::new(ScriptedResponder::default())).await;
    let key = CustomerKey::new("t1", "p1", "c1");
    let ada = AgentIdentity::new("u1", "Ada");
    let bob = AgentIdentity::new("u2", "Bob");
    h.flow.handoff().observe(&key).await.unwrap();

    let t = h.flow.agent_reply(&key, &ada, "Hi, Ada here.").await.unwrap();
    assert!(t.state.is_assigned_to("u1"));
    assert_eq!(t.state.mode, ConversationMode::HumanRequested);

    let err = h
        .flow
        .agent_reply(&key, &bob, "Bob here.")
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::AlreadyAssigned(_)));
    assert_eq!(h.sink.texts(), vec!["Hi, Ada here.".to_string()]);

    let types = drain_types(&mut h.dashboard);
    assert_eq!(
        types,
        vec!["agent_assigned", "customer_updated", "agent_replied"]
    );
}

#[tokio::test]
async fn test_unassign_by_owner_publishes_release() {
    let mut h = harness(Arc::new(ScriptedResponder::default())).await;
    let key = CustomerKey::new("t1", "p1", "c1");
    let ada = AgentIdentity::new("u1", "Ada");

    h.flow.request_human(&key).await.unwrap();
    h.flow.assign(&key, &ada).await.unwrap();

    let err = h.flow.unassign(&key, "u2").await.unwrap_err();
    assert!(matches!(err, HandoffError::NotOwner { .. }));

    drain_types(&mut h.dashboard);
    let t = h.flow.unassign(&key, "u1").await.unwrap();
    assert!(t.changed);
    assert!(t.state.assigned_agent.is_none());
    assert_eq!(
        drain_types(&mut h.dashboard),
        vec!["agent_unassigned", "customer_updated"]
    );

    let stored = h.store.load(&key).await.unwrap().unwrap();
    assert!(stored.assigned_agent.is_none());
}

#[tokio::test]
async fn test_agent_claim_during_reply_silences_bot() {
    let mut h = harness(Arc::new(SlowResponder(Duration::from_millis(300)))).await;
    let key = CustomerKey::new("t1", "p1", "c1");
    let ada = AgentIdentity::new("u1", "Ada");
    let cancel = CancellationToken::new();

    let msg = inbound("c1", "hello");
    let (outcome, claim) = tokio::join!(
        h.flow.handle_inbound(&msg, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.flow.assign(&key, &ada).await
        }
    );
    assert!(claim.unwrap().changed);

    let outcome = outcome.unwrap();
    assert!(outcome.reply.is_none());
    assert_eq!(outcome.state.mode, ConversationMode::HumanRequested);
    assert!(outcome.state.is_assigned_to("u1"));
    assert!(h.sink.texts().is_empty());
    assert!(!drain_types(&mut h.dashboard).contains(&"bot_replied".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_agent_replies_have_one_sender() {
    let h = harness(Arc::new(ScriptedResponder::default())).await;
    let key = CustomerKey::new("t1", "p1", "c1");
    h.flow.handoff().observe(&key).await.unwrap();
    let flow = Arc::new(h.flow);

    let mut handles = Vec::new();
    for (id, name) in [("u1", "Ada"), ("u2", "Bob")] {
        let flow = flow.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let agent = AgentIdentity::new(id, name);
            flow.agent_reply(&key, &agent, &format!("{} here.", name)).await
        }));
    }

    let mut sent = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => sent += 1,
            Err(HandoffError::AlreadyAssigned(_)) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!((sent, rejected), (1, 1));
    assert_eq!(h.sink.texts().len(), 1);

    let stored = h.store.load(&key).await.unwrap().unwrap();
    let owner = stored.assigned_agent.unwrap();
    assert_eq!(h.sink.texts()[0], format!("{} here.", owner.name));
}
