//! Deadline- and cancellation-bounded retrieval.
//!
//! [`RetrievalEngine::retrieve`] runs the full pipeline for one customer
//! turn: embed the query and fetch candidates concurrently, rank, then
//! assemble the context block. It never returns an error. Every failure
//! becomes a [`Degradation`] on the outcome and the caller proceeds with
//! whatever context survived (possibly `""`).
//!
//! | Condition | Result |
//! |-----------|--------|
//! | embedding fails or is empty | text-only ranking, `ProviderUnavailable` |
//! | store read fails | empty context, `StoreUnavailable` |
//! | no candidates | empty context, `NoCandidates` |
//! | nothing clears the threshold | best available, `LowConfidence` |
//! | deadline elapses | empty context, `Timeout` |
//! | token cancelled | empty context, `Cancelled` |

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use replyhub_core::context::ContextAssembler;
use replyhub_core::embedding::EmbeddingProvider;
use replyhub_core::models::Channel;
use replyhub_core::rank::{rank, RankParams, Ranking};
use replyhub_core::store::{ChunkQuery, DocumentStore};

use crate::config::RetrievalConfig;

/// Reduced-functionality conditions absorbed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    ProviderUnavailable,
    StoreUnavailable,
    NoCandidates,
    LowConfidence,
    Timeout,
    Cancelled,
}

/// One retrieval request.
#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub tenant_id: &'a str,
    pub page_id: &'a str,
    pub channel: Option<Channel>,
    pub query: &'a str,
    /// Overrides the configured result count.
    pub limit: Option<usize>,
    /// Overrides the configured total context budget.
    pub budget: Option<usize>,
    /// Overrides the engine's deadline for this call.
    pub deadline: Option<Duration>,
}

impl<'a> RetrievalRequest<'a> {
    pub fn new(tenant_id: &'a str, page_id: &'a str, query: &'a str) -> Self {
        Self {
            tenant_id,
            page_id,
            channel: None,
            query,
            limit: None,
            budget: None,
            deadline: None,
        }
    }

    pub fn channel(mut self, channel: Option<Channel>) -> Self {
        self.channel = channel;
        self
    }
}

/// What a retrieval produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalOutcome {
    /// The assembled context; `""` means "no context".
    pub context: String,
    pub ranking: Ranking,
    pub degraded: Vec<Degradation>,
}

impl RetrievalOutcome {
    fn degraded(reason: Degradation) -> Self {
        Self {
            degraded: vec![reason],
            ..Self::default()
        }
    }

    pub fn is_degraded(&self, reason: Degradation) -> bool {
        self.degraded.contains(&reason)
    }
}

pub struct RetrievalEngine {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    params: RankParams,
    result_limit: usize,
    context_budget: usize,
    deadline: Duration,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            params: config.rank_params(),
            result_limit: config.result_limit,
            context_budget: config.context_budget,
            deadline: config.deadline(),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Retrieve context for `req`, bounded by `req.deadline` (or the
    /// engine's deadline) and by `cancel`. Dropping the in-flight future aborts the embedding
    /// call and the store fetch; partial rankings are discarded.
    pub async fn retrieve(
        &self,
        req: &RetrievalRequest<'_>,
        cancel: &CancellationToken,
    ) -> RetrievalOutcome {
        let deadline = req.deadline.unwrap_or(self.deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(tenant = req.tenant_id, page = req.page_id, "retrieval cancelled");
                RetrievalOutcome::degraded(Degradation::Cancelled)
            }
            result = tokio::time::timeout(deadline, self.run(req)) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(
                        tenant = req.tenant_id,
                        page = req.page_id,
                        deadline_ms = deadline.as_millis() as u64,
                        "retrieval deadline exceeded; continuing without context"
                    );
                    RetrievalOutcome::degraded(Degradation::Timeout)
                }
            },
        }
    }

    async fn run(&self, req: &RetrievalRequest<'_>) -> RetrievalOutcome {
        let query = ChunkQuery::new(req.tenant_id, req.page_id).channel(req.channel);
        let (embedded, fetched) =
            tokio::join!(self.embedder.embed(req.query), self.store.query(&query));

        let mut degraded = Vec::new();

        let candidates = match fetched {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(
                    tenant = req.tenant_id,
                    page = req.page_id,
                    error = %e,
                    "document store unavailable; continuing without context"
                );
                return RetrievalOutcome::degraded(Degradation::StoreUnavailable);
            }
        };
        if candidates.is_empty() {
            return RetrievalOutcome::degraded(Degradation::NoCandidates);
        }

        let query_vec = match embedded {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => {
                degraded.push(Degradation::ProviderUnavailable);
                None
            }
            Err(e) => {
                tracing::warn!(
                    provider = self.embedder.model_name(),
                    error = %e,
                    "embedding unavailable; ranking by text overlap only"
                );
                degraded.push(Degradation::ProviderUnavailable);
                None
            }
        };

        let limit = req.limit.unwrap_or(self.result_limit);
        let ranking = rank(
            req.query,
            query_vec.as_deref(),
            candidates,
            limit,
            &self.params,
        );
        if ranking.fallback {
            degraded.push(Degradation::LowConfidence);
        }

        let assembler = ContextAssembler::new(req.budget.unwrap_or(self.context_budget));
        let context = assembler.assemble(req.query, &ranking);

        RetrievalOutcome {
            context,
            ranking,
            degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use replyhub_core::embedding::HashEmbedder;
    use replyhub_core::models::{DocumentChunk, NaturalKey};
    use replyhub_core::store::memory::InMemoryStore;
    use replyhub_core::store::UpsertOutcome;

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            bail!("provider down")
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl EmbeddingProvider for SlowEmbedder {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![1.0; 8])
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn upsert(&self, _chunk: &DocumentChunk) -> Result<UpsertOutcome> {
            bail!("store down")
        }
        async fn query(&self, _query: &ChunkQuery<'_>) -> Result<Vec<DocumentChunk>> {
            bail!("store down")
        }
        async fn set_active(&self, _t: &str, _k: &NaturalKey, _a: bool) -> Result<bool> {
            bail!("store down")
        }
        async fn set_channel(
            &self,
            _t: &str,
            _k: &NaturalKey,
            _c: Channel,
            _e: bool,
        ) -> Result<bool> {
            bail!("store down")
        }
        async fn purge(&self, _t: &str, _k: &NaturalKey) -> Result<bool> {
            bail!("store down")
        }
    }

    async fn seeded_store(embedder: &HashEmbedder) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for text in [
            "Our store opening hours are 9am to 5pm on weekdays.",
            "Shipping is free for orders above 50 dollars.",
            "Returns are accepted within 30 days with a receipt.",
        ] {
            let chunk = DocumentChunk::upload("t1", "p1", text).with_embedding(embedder.embed_sync(text));
            store.upsert(&chunk).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_retrieve_finds_relevant_chunk() {
        let embedder = Arc::new(HashEmbedder::new(64));
        let store = seeded_store(&embedder).await;
        let engine = RetrievalEngine::new(store, embedder, &RetrievalConfig::default());

        let outcome = engine
            .retrieve(
                &RetrievalRequest::new("t1", "p1", "opening hours"),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.context.contains("opening hours"));
        assert!(outcome.context.starts_with("[Result 1"));
        assert!(!outcome.is_degraded(Degradation::ProviderUnavailable));
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_to_text() {
        let store = seeded_store(&HashEmbedder::new(64)).await;
        let engine = RetrievalEngine::new(store, Arc::new(FailingEmbedder), &RetrievalConfig::default());

        let outcome = engine
            .retrieve(
                &RetrievalRequest::new("t1", "p1", "free shipping"),
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_degraded(Degradation::ProviderUnavailable));
        assert!(outcome.context.contains("Shipping is free"));
    }

    #[tokio::test]
    async fn test_empty_store_returns_empty_context() {
        let engine = RetrievalEngine::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(HashEmbedder::new(16)),
            &RetrievalConfig::default(),
        );
        let outcome = engine
            .retrieve(&RetrievalRequest::new("t1", "p1", "anything"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.context, "");
        assert!(outcome.ranking.is_empty());
        assert!(outcome.is_degraded(Degradation::NoCandidates));
    }

    #[tokio::test]
    async fn test_store_failure_degrades() {
        let engine = RetrievalEngine::new(
            Arc::new(BrokenStore),
            Arc::new(HashEmbedder::new(16)),
            &RetrievalConfig::default(),
        );
        let outcome = engine
            .retrieve(&RetrievalRequest::new("t1", "p1", "hours"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.context, "");
        assert!(outcome.is_degraded(Degradation::StoreUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_returns_no_context() {
        let store = seeded_store(&HashEmbedder::new(64)).await;
        let engine = RetrievalEngine::new(store, Arc::new(SlowEmbedder), &RetrievalConfig::default())
            .with_deadline(Duration::from_millis(50));
        let outcome = engine
            .retrieve(&RetrievalRequest::new("t1", "p1", "hours"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.context, "");
        assert_eq!(outcome.degraded, vec![Degradation::Timeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_overrides_engine_deadline() {
        let store = seeded_store(&HashEmbedder::new(64)).await;
        let engine = RetrievalEngine::new(store, Arc::new(SlowEmbedder), &RetrievalConfig::default())
            .with_deadline(Duration::from_secs(30));
        let request = RetrievalRequest {
            deadline: Some(Duration::from_millis(50)),
            ..RetrievalRequest::new("t1", "p1", "hours")
        };
        let started = tokio::time::Instant::now();
        let outcome = engine.retrieve(&request, &CancellationToken::new()).await;
        assert_eq!(outcome.degraded, vec![Degradation::Timeout]);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts() {
        let store = seeded_store(&HashEmbedder::new(64)).await;
        let engine = RetrievalEngine::new(store, Arc::new(SlowEmbedder), &RetrievalConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = engine
            .retrieve(&RetrievalRequest::new("t1", "p1", "hours"), &cancel)
            .await;
        assert_eq!(outcome.degraded, vec![Degradation::Cancelled]);
    }
}
