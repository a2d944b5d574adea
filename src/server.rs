//! HTTP and WebSocket server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/context` | Retrieve a context block for a query |
//! | `POST` | `/messages` | Handle an inbound customer message |
//! | `POST` | `/documents` | Upsert one knowledge chunk |
//! | `POST` | `/documents/fetch` | Fetch a URL and ingest it |
//! | `POST` | `/documents/active` | Activate or deactivate a chunk |
//! | `POST` | `/documents/channel` | Enable or disable a chunk on one channel |
//! | `POST` | `/documents/purge` | Hard-delete a chunk |
//! | `GET`  | `/customers/{tenant}` | List customer states (`?mode=`) |
//! | `GET`  | `/customers/{tenant}/{page}/{customer}` | One customer state |
//! | `POST` | `/customers/{tenant}/{page}/{customer}/{action}` | `request_human`, `resume`, `toggle` |
//! | `POST` | `/customers/{tenant}/{page}/{customer}/assign` | Claim for an agent |
//! | `POST` | `/customers/{tenant}/{page}/{customer}/unassign` | Release |
//! | `POST` | `/customers/{tenant}/{page}/{customer}/reply` | Agent message (auto-assigns) |
//! | `GET`/`PUT` | `/settings/{tenant}` | Tenant settings |
//! | `GET`  | `/ws/{tenant}` | Dashboard WebSocket (`?agent_id=&agent_name=`) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "already_assigned", "message": "customer is already assigned to Ada (u1)" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_owner` (403), `not_found` (404),
//! `already_assigned` (409), `conflict` (409), `delivery_failed` (502),
//! `internal` (500).

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use replyhub_core::embedding::EmbeddingProvider;
use replyhub_core::error::HandoffError;
use replyhub_core::handoff::{HandoffCoordinator, Transition};
use replyhub_core::models::{
    AgentIdentity, Channel, ChannelSet, ConversationMode, CustomerKey, CustomerState,
    DocumentChunk, NaturalKey,
};
use replyhub_core::store::{DocumentStore, UpsertOutcome};

use crate::cache::{cache_from_config, SettingsService, TenantSettings};
use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::engine::{Degradation, RetrievalEngine, RetrievalRequest};
use crate::events::{EventKind, HubEvent};
use crate::flow::{ConversationFlow, InboundMessage, LogSink, TurnOutcome};
use crate::hub::{BroadcastHub, ConnectionInfo};
use crate::ingest::{ingest_url, IngestReport, IngestTarget};
use crate::migrate;
use crate::responder::create_responder;
use crate::sqlite_store::SqliteStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub flow: Arc<ConversationFlow>,
    pub documents: Arc<dyn DocumentStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub hub: Arc<BroadcastHub>,
    /// Cancelled on shutdown; request tokens are children of it.
    pub shutdown: CancellationToken,
}

/// Wire every component against the configured SQLite database.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));

    let embedder = create_provider(&config.embedding)?;
    let responder = create_responder(&config.responder)?;
    let hub = Arc::new(BroadcastHub::new(config.hub.mailbox_capacity));
    let settings = Arc::new(SettingsService::new(
        store.clone(),
        cache_from_config(&config.cache),
    ));
    let handoff = Arc::new(HandoffCoordinator::new(store.clone()));
    let engine = Arc::new(RetrievalEngine::new(
        store.clone(),
        embedder.clone(),
        &config.retrieval,
    ));
    let flow = Arc::new(ConversationFlow::new(
        handoff,
        engine,
        responder,
        Arc::new(LogSink),
        hub.clone(),
        settings,
        config.responder.fallback_reply.clone(),
    ));

    Ok(AppState {
        config: Arc::new(config.clone()),
        flow,
        documents: store,
        embedder,
        hub,
        shutdown: CancellationToken::new(),
    })
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/context", post(handle_context))
        .route("/messages", post(handle_message))
        .route("/documents", post(handle_upsert_document))
        .route("/documents/fetch", post(handle_fetch_document))
        .route("/documents/active", post(handle_set_active))
        .route("/documents/channel", post(handle_set_channel))
        .route("/documents/purge", post(handle_purge))
        .route("/customers/{tenant}", get(handle_list_customers))
        .route("/customers/{tenant}/{page}/{customer}", get(handle_get_customer))
        .route(
            "/customers/{tenant}/{page}/{customer}/assign",
            post(handle_assign),
        )
        .route(
            "/customers/{tenant}/{page}/{customer}/unassign",
            post(handle_unassign),
        )
        .route(
            "/customers/{tenant}/{page}/{customer}/reply",
            post(handle_agent_reply),
        )
        .route(
            "/customers/{tenant}/{page}/{customer}/{action}",
            post(handle_transition),
        )
        .route(
            "/settings/{tenant}",
            get(handle_get_settings).put(handle_put_settings),
        )
        .route("/ws/{tenant}", get(handle_ws))
        .layer(cors)
        .with_state(state)
}

/// Start the server on `[server].bind` and run until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = build_state(config).await?;
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into the JSON error contract.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

impl From<HandoffError> for AppError {
    fn from(err: HandoffError) -> Self {
        let status = match &err {
            HandoffError::AlreadyAssigned(_) | HandoffError::Conflict(_) => StatusCode::CONFLICT,
            HandoffError::NotOwner { .. } => StatusCode::FORBIDDEN,
            HandoffError::NotFound(_) => StatusCode::NOT_FOUND,
            HandoffError::Delivery(_) => StatusCode::BAD_GATEWAY,
            HandoffError::Storage(e) => {
                tracing::error!(error = %e, "conversation store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn require(value: &str, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(bad_request(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn parse_channel(raw: Option<&str>) -> Result<Option<Channel>, AppError> {
    raw.map(|c| c.parse::<Channel>().map_err(|e| bad_request(e.to_string())))
        .transpose()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /context ============

#[derive(Deserialize)]
struct ContextRequest {
    tenant_id: String,
    page_id: String,
    query: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    budget: Option<usize>,
    #[serde(default)]
    deadline_ms: Option<u64>,
}

#[derive(Serialize)]
struct ContextHit {
    natural_key: NaturalKey,
    source: String,
    score: f64,
}

#[derive(Serialize)]
struct ContextResponse {
    context: String,
    results: Vec<ContextHit>,
    threshold: f64,
    degraded: Vec<Degradation>,
}

async fn handle_context(
    State(state): State<AppState>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<ContextResponse>, AppError> {
    require(&req.query, "query")?;
    let channel = parse_channel(req.channel.as_deref())?;

    let request = RetrievalRequest {
        limit: req.limit,
        budget: req.budget,
        deadline: req.deadline_ms.map(Duration::from_millis),
        ..RetrievalRequest::new(&req.tenant_id, &req.page_id, &req.query).channel(channel)
    };
    let outcome = state
        .flow
        .engine()
        .retrieve(&request, &state.shutdown.child_token())
        .await;

    Ok(Json(ContextResponse {
        results: outcome
            .ranking
            .results
            .iter()
            .map(|r| ContextHit {
                natural_key: r.chunk.natural_key.clone(),
                source: r.chunk.source.clone(),
                score: r.score,
            })
            .collect(),
        threshold: outcome.ranking.threshold,
        degraded: outcome.degraded,
        context: outcome.context,
    }))
}

// ============ POST /messages ============

#[derive(Deserialize)]
struct MessageRequest {
    tenant_id: String,
    page_id: String,
    customer_id: String,
    text: String,
    #[serde(default)]
    channel: Option<String>,
}

async fn handle_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<TurnOutcome>, AppError> {
    require(&req.customer_id, "customer_id")?;
    require(&req.text, "text")?;
    let msg = InboundMessage {
        customer: CustomerKey::new(&req.tenant_id, &req.page_id, &req.customer_id),
        channel: parse_channel(req.channel.as_deref())?,
        text: req.text,
    };
    let outcome = state
        .flow
        .handle_inbound(&msg, &state.shutdown.child_token())
        .await?;
    Ok(Json(outcome))
}

// ============ Documents ============

#[derive(Deserialize)]
struct UpsertDocumentRequest {
    tenant_id: String,
    page_id: String,
    content: String,
    #[serde(default)]
    source: Option<String>,
    /// Natural key for synced data; uploads are keyed by content.
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    channels: ChannelSet,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct UpsertDocumentResponse {
    natural_key: NaturalKey,
    inserted: bool,
    embedded: bool,
}

async fn handle_upsert_document(
    State(state): State<AppState>,
    Json(req): Json<UpsertDocumentRequest>,
) -> Result<Json<UpsertDocumentResponse>, AppError> {
    require(&req.content, "content")?;
    let mut chunk = match &req.url {
        Some(url) => DocumentChunk::synced(
            &req.tenant_id,
            &req.page_id,
            url,
            req.source.as_deref().unwrap_or("crm"),
            &req.content,
        ),
        None => DocumentChunk::upload(&req.tenant_id, &req.page_id, &req.content),
    };
    if let (None, Some(source)) = (&req.url, &req.source) {
        chunk.source = source.clone();
    }
    chunk.channels = req.channels;
    chunk.metadata = req.metadata;

    let embedded = match state.embedder.embed(&chunk.content).await {
        Ok(vector) => {
            chunk.embedding = vector;
            true
        }
        Err(e) => {
            tracing::warn!(key = %chunk.natural_key, error = %e, "embedding failed; storing text only");
            false
        }
    };

    let outcome = state.documents.upsert(&chunk).await.map_err(internal)?;
    Ok(Json(UpsertDocumentResponse {
        natural_key: chunk.natural_key,
        inserted: outcome == UpsertOutcome::Inserted,
        embedded,
    }))
}

#[derive(Deserialize)]
struct FetchDocumentRequest {
    tenant_id: String,
    page_id: String,
    url: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    channels: ChannelSet,
}

async fn handle_fetch_document(
    State(state): State<AppState>,
    Json(req): Json<FetchDocumentRequest>,
) -> Result<Json<IngestReport>, AppError> {
    require(&req.url, "url")?;
    let target = IngestTarget {
        tenant_id: &req.tenant_id,
        page_id: &req.page_id,
        channels: req.channels,
        max_tokens: state.config.chunking.max_tokens,
    };
    let report = ingest_url(
        state.documents.as_ref(),
        state.embedder.as_ref(),
        &target,
        &req.url,
        req.source.as_deref().unwrap_or("crm"),
    )
    .await
    .map_err(internal)?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct SetActiveRequest {
    tenant_id: String,
    natural_key: NaturalKey,
    active: bool,
}

#[derive(Deserialize)]
struct SetChannelRequest {
    tenant_id: String,
    natural_key: NaturalKey,
    channel: String,
    enabled: bool,
}

#[derive(Deserialize)]
struct PurgeRequest {
    tenant_id: String,
    natural_key: NaturalKey,
}

#[derive(Serialize)]
struct Updated {
    updated: bool,
}

fn found(updated: bool, key: &NaturalKey) -> Result<Json<Updated>, AppError> {
    if updated {
        Ok(Json(Updated { updated }))
    } else {
        Err(not_found(format!("document not found: {}", key)))
    }
}

async fn handle_set_active(
    State(state): State<AppState>,
    Json(req): Json<SetActiveRequest>,
) -> Result<Json<Updated>, AppError> {
    let updated = state
        .documents
        .set_active(&req.tenant_id, &req.natural_key, req.active)
        .await
        .map_err(internal)?;
    found(updated, &req.natural_key)
}

async fn handle_set_channel(
    State(state): State<AppState>,
    Json(req): Json<SetChannelRequest>,
) -> Result<Json<Updated>, AppError> {
    let channel: Channel = req.channel.parse().map_err(|e: anyhow::Error| bad_request(e.to_string()))?;
    let updated = state
        .documents
        .set_channel(&req.tenant_id, &req.natural_key, channel, req.enabled)
        .await
        .map_err(internal)?;
    found(updated, &req.natural_key)
}

async fn handle_purge(
    State(state): State<AppState>,
    Json(req): Json<PurgeRequest>,
) -> Result<Json<Updated>, AppError> {
    let updated = state
        .documents
        .purge(&req.tenant_id, &req.natural_key)
        .await
        .map_err(internal)?;
    found(updated, &req.natural_key)
}

// ============ Customers ============

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    mode: Option<String>,
}

async fn handle_list_customers(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<CustomerState>>, AppError> {
    let mode = query
        .mode
        .as_deref()
        .map(|m| m.parse::<ConversationMode>())
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(state.flow.handoff().list(&tenant, mode).await?))
}

async fn handle_get_customer(
    State(state): State<AppState>,
    Path((tenant, page, customer)): Path<(String, String, String)>,
) -> Result<Json<CustomerState>, AppError> {
    let key = CustomerKey::new(&tenant, &page, &customer);
    match state.flow.handoff().state(&key).await? {
        Some(s) => Ok(Json(s)),
        None => Err(HandoffError::NotFound(key).into()),
    }
}

async fn handle_transition(
    State(state): State<AppState>,
    Path((tenant, page, customer, action)): Path<(String, String, String, String)>,
) -> Result<Json<Transition>, AppError> {
    let key = CustomerKey::new(&tenant, &page, &customer);
    let t = match action.as_str() {
        "request_human" => state.flow.request_human(&key).await?,
        "resume" => state.flow.resume(&key).await?,
        "toggle" => state.flow.toggle(&key).await?,
        other => return Err(not_found(format!("unknown action: {}", other))),
    };
    Ok(Json(t))
}

#[derive(Deserialize)]
struct AssignRequest {
    agent: AgentIdentity,
}

async fn handle_assign(
    State(state): State<AppState>,
    Path((tenant, page, customer)): Path<(String, String, String)>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<Transition>, AppError> {
    require(&req.agent.id, "agent.id")?;
    let key = CustomerKey::new(&tenant, &page, &customer);
    Ok(Json(state.flow.assign(&key, &req.agent).await?))
}

#[derive(Deserialize)]
struct UnassignRequest {
    agent_id: String,
}

async fn handle_unassign(
    State(state): State<AppState>,
    Path((tenant, page, customer)): Path<(String, String, String)>,
    Json(req): Json<UnassignRequest>,
) -> Result<Json<Transition>, AppError> {
    let key = CustomerKey::new(&tenant, &page, &customer);
    Ok(Json(state.flow.unassign(&key, &req.agent_id).await?))
}

#[derive(Deserialize)]
struct AgentReplyRequest {
    agent: AgentIdentity,
    text: String,
}

async fn handle_agent_reply(
    State(state): State<AppState>,
    Path((tenant, page, customer)): Path<(String, String, String)>,
    Json(req): Json<AgentReplyRequest>,
) -> Result<Json<Transition>, AppError> {
    require(&req.agent.id, "agent.id")?;
    require(&req.text, "text")?;
    let key = CustomerKey::new(&tenant, &page, &customer);
    Ok(Json(state.flow.agent_reply(&key, &req.agent, &req.text).await?))
}

// ============ Settings ============

async fn handle_get_settings(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<TenantSettings>, AppError> {
    let settings = state.flow.settings().get(&tenant).await.map_err(internal)?;
    Ok(Json(settings))
}

async fn handle_put_settings(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(settings): Json<TenantSettings>,
) -> Result<Json<TenantSettings>, AppError> {
    state
        .flow
        .settings()
        .update(&tenant, &settings)
        .await
        .map_err(internal)?;
    Ok(Json(settings))
}

// ============ GET /ws/{tenant} ============

#[derive(Deserialize)]
struct WsQuery {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    agent_name: String,
    #[serde(default)]
    agent_email: Option<String>,
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<WsQuery>,
) -> Response {
    let info = ConnectionInfo {
        agent_id: query.agent_id,
        agent_name: query.agent_name,
        agent_email: query.agent_email,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, tenant, info))
}

/// Forward the connection's mailbox to the socket until either side
/// closes, then unregister.
async fn handle_socket(socket: WebSocket, state: AppState, tenant: String, info: ConnectionInfo) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let connection_id = uuid::Uuid::new_v4().to_string();

    let (tx, mut rx) = state.hub.mailbox();
    state.hub.register(&tenant, &connection_id, info, tx);

    let hello = HubEvent::new(EventKind::Connected {
        connection_id: connection_id.clone(),
    });
    if let Err(e) = state.hub.send_event(&tenant, &connection_id, &hello) {
        tracing::debug!(connection = %connection_id, error = %e, "could not greet connection");
    }

    let sender_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let text = String::from_utf8_lossy(&payload).into_owned();
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                // Dashboards only listen; pings are answered by the protocol layer.
                Some(Ok(_)) => {}
            },
        }
    }

    state.hub.unregister(&tenant, &connection_id);
    sender_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_errors_map_to_status() {
        let key = CustomerKey::new("t1", "p1", "c1");
        let err: AppError = HandoffError::NotFound(key.clone()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "not_found");

        let err: AppError = HandoffError::Conflict(key).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn test_parse_channel_rejects_unknown() {
        assert_eq!(parse_channel(Some("messenger")).unwrap(), Some(Channel::Messenger));
        assert_eq!(parse_channel(None).unwrap(), None);
        let err = parse_channel(Some("instagram")).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
