//! Storage abstraction for ReplyHub.
//!
//! Two traits cover everything the engine persists:
//!
//! - [`DocumentStore`] holds knowledge chunks. Upserts are idempotent per
//!   `(tenant, natural key)`; queries return a snapshot in storage order
//!   and ranking happens in memory.
//! - [`ConversationStore`] holds customer handoff state. Every mutation is
//!   a version-checked compare-and-swap so that concurrent agents (possibly
//!   in different processes) cannot lose updates.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! A future approximate-nearest-neighbour index would sit behind
//! [`DocumentStore::query`] without changing callers.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Channel, ConversationMode, CustomerKey, CustomerState, DocumentChunk, NaturalKey,
};

/// Filter for [`DocumentStore::query`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkQuery<'a> {
    pub tenant_id: &'a str,
    pub page_id: &'a str,
    /// Only chunks enabled for this channel.
    pub channel: Option<Channel>,
    /// Skip deactivated chunks.
    pub active_only: bool,
}

impl<'a> ChunkQuery<'a> {
    pub fn new(tenant_id: &'a str, page_id: &'a str) -> Self {
        Self {
            tenant_id,
            page_id,
            channel: None,
            active_only: true,
        }
    }

    pub fn channel(mut self, channel: Option<Channel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn include_inactive(mut self) -> Self {
        self.active_only = false;
        self
    }

    /// Whether `chunk` passes this filter.
    pub fn matches(&self, chunk: &DocumentChunk) -> bool {
        chunk.tenant_id == self.tenant_id
            && chunk.page_id == self.page_id
            && (!self.active_only || chunk.is_active)
            && self.channel.map_or(true, |c| chunk.channels.get(c))
    }
}

/// Whether an upsert created a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Persistence for knowledge chunks.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](DocumentStore::upsert) | Insert or replace by `(tenant, natural key)` |
/// | [`query`](DocumentStore::query) | All chunks for a tenant/page, in storage order |
/// | [`set_active`](DocumentStore::set_active) | Toggle the active flag |
/// | [`set_channel`](DocumentStore::set_channel) | Toggle one channel flag |
/// | [`purge`](DocumentStore::purge) | Hard delete |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace a chunk. `created_at` of an existing record is
    /// kept; `updated_at` is refreshed.
    async fn upsert(&self, chunk: &DocumentChunk) -> Result<UpsertOutcome>;

    /// Return every chunk matching `query`, in storage order.
    async fn query(&self, query: &ChunkQuery<'_>) -> Result<Vec<DocumentChunk>>;

    /// Set the active flag. Returns `false` if no such chunk exists.
    async fn set_active(&self, tenant_id: &str, key: &NaturalKey, active: bool) -> Result<bool>;

    /// Enable or disable one channel. Returns `false` if no such chunk exists.
    async fn set_channel(
        &self,
        tenant_id: &str,
        key: &NaturalKey,
        channel: Channel,
        enabled: bool,
    ) -> Result<bool>;

    /// Delete a chunk permanently. Returns `false` if no such chunk exists.
    async fn purge(&self, tenant_id: &str, key: &NaturalKey) -> Result<bool>;
}

/// Persistence for customer handoff state with atomic conditional writes.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, key: &CustomerKey) -> Result<Option<CustomerState>>;

    /// Insert the initial `bot` state unless one exists; return the stored
    /// state either way.
    async fn create_if_absent(&self, key: &CustomerKey, now: DateTime<Utc>)
        -> Result<CustomerState>;

    /// Replace the stored state with `next` only if its version still equals
    /// `expected_version`. On success the stored version becomes
    /// `expected_version + 1` and the written state is returned; `None`
    /// means a concurrent writer got there first.
    async fn compare_and_swap(
        &self,
        expected_version: i64,
        next: &CustomerState,
    ) -> Result<Option<CustomerState>>;

    /// States of a tenant's customers, most recently updated first.
    async fn list(
        &self,
        tenant_id: &str,
        mode: Option<ConversationMode>,
    ) -> Result<Vec<CustomerState>>;
}
