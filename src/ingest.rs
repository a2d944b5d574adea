//! Knowledge ingestion: split → embed → upsert.
//!
//! Manual uploads are keyed by a hash of page and content, so re-uploading
//! the same text is a no-op update. Fetched pages are keyed by
//! `<url>#<piece index>`, so a re-sync replaces pieces in place.
//!
//! Embedding failures are not fatal: the piece is stored with an empty
//! vector and retrieval ranks it by text overlap until it is re-ingested.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use replyhub_core::chunk::split_text;
use replyhub_core::embedding::EmbeddingProvider;
use replyhub_core::models::{ChannelSet, DocumentChunk};
use replyhub_core::store::{DocumentStore, UpsertOutcome};

/// Where ingested pieces go and how they are labelled.
#[derive(Debug, Clone)]
pub struct IngestTarget<'a> {
    pub tenant_id: &'a str,
    pub page_id: &'a str,
    pub channels: ChannelSet,
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    /// Pieces stored without an embedding.
    pub unembedded: usize,
}

impl IngestReport {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Ingest uploaded text. `source` tags the pieces (e.g. `"upload"`).
pub async fn ingest_text(
    store: &dyn DocumentStore,
    embedder: &dyn EmbeddingProvider,
    target: &IngestTarget<'_>,
    source: &str,
    text: &str,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    for piece in split_text(text, target.max_tokens) {
        let mut chunk = DocumentChunk::upload(target.tenant_id, target.page_id, &piece.text)
            .with_channels(target.channels);
        chunk.source = source.to_string();
        chunk.metadata.insert("hash".to_string(), piece.hash);
        store_piece(store, embedder, chunk, &mut report).await?;
    }
    tracing::info!(
        tenant = target.tenant_id,
        page = target.page_id,
        source,
        inserted = report.inserted,
        updated = report.updated,
        "ingested text"
    );
    Ok(report)
}

pub async fn ingest_file(
    store: &dyn DocumentStore,
    embedder: &dyn EmbeddingProvider,
    target: &IngestTarget<'_>,
    path: &Path,
) -> Result<IngestReport> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    ingest_text(store, embedder, target, "upload", &text).await
}

/// Fetch `url` and ingest its body under `source`.
pub async fn ingest_url(
    store: &dyn DocumentStore,
    embedder: &dyn EmbeddingProvider,
    target: &IngestTarget<'_>,
    url: &str,
    source: &str,
) -> Result<IngestReport> {
    let body = fetch_external_source(url).await?;
    ingest_fetched(store, embedder, target, url, source, &body).await
}

/// Ingest an already-fetched page body keyed by `url`.
pub async fn ingest_fetched(
    store: &dyn DocumentStore,
    embedder: &dyn EmbeddingProvider,
    target: &IngestTarget<'_>,
    url: &str,
    source: &str,
    body: &str,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    for piece in split_text(body, target.max_tokens) {
        let key = format!("{}#{}", url, piece.index);
        let mut chunk = DocumentChunk::synced(target.tenant_id, target.page_id, &key, source, &piece.text)
            .with_channels(target.channels);
        chunk.metadata.insert("url".to_string(), url.to_string());
        chunk.metadata.insert("hash".to_string(), piece.hash);
        store_piece(store, embedder, chunk, &mut report).await?;
    }
    tracing::info!(
        tenant = target.tenant_id,
        url,
        inserted = report.inserted,
        updated = report.updated,
        "ingested url"
    );
    Ok(report)
}

async fn store_piece(
    store: &dyn DocumentStore,
    embedder: &dyn EmbeddingProvider,
    chunk: DocumentChunk,
    report: &mut IngestReport,
) -> Result<()> {
    let chunk = match embedder.embed(&chunk.content).await {
        Ok(vector) => chunk.with_embedding(vector),
        Err(e) => {
            tracing::warn!(key = %chunk.natural_key, error = %e, "embedding failed; storing text only");
            report.unembedded += 1;
            chunk
        }
    };
    match store.upsert(&chunk).await? {
        UpsertOutcome::Inserted => report.inserted += 1,
        UpsertOutcome::Updated => report.updated += 1,
    }
    Ok(())
}

async fn fetch_external_source(url: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;
    let status = response.status();
    if !status.is_success() {
        bail!("Fetching {} failed with HTTP {}", url, status);
    }
    Ok(response.text().await?)
}
