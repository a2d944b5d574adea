//! In-memory store for tests and single-process setups.
//!
//! Chunks live in a `Vec` (storage order is insertion order; upserts
//! replace in place) and customer states in a `HashMap`, each behind a
//! `std::sync::RwLock`. Compare-and-swap runs entirely under the write
//! lock, which gives the same atomicity as a conditional SQL `UPDATE`.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Channel, ConversationMode, CustomerKey, CustomerState, DocumentChunk, NaturalKey,
};

use super::{ChunkQuery, ConversationStore, DocumentStore, UpsertOutcome};

/// In-memory implementation of [`DocumentStore`] and [`ConversationStore`].
#[derive(Default)]
pub struct InMemoryStore {
    chunks: RwLock<Vec<DocumentChunk>>,
    states: RwLock<HashMap<CustomerKey, CustomerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
        lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
        lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn update_chunk<F>(&self, tenant_id: &str, key: &NaturalKey, f: F) -> Result<bool>
    where
        F: FnOnce(&mut DocumentChunk),
    {
        let mut chunks = Self::write(&self.chunks)?;
        match chunks
            .iter_mut()
            .find(|c| c.tenant_id == tenant_id && &c.natural_key == key)
        {
            Some(chunk) => {
                f(chunk);
                chunk.updated_at = Utc::now().timestamp();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn upsert(&self, chunk: &DocumentChunk) -> Result<UpsertOutcome> {
        let now = Utc::now().timestamp();
        let mut chunks = Self::write(&self.chunks)?;
        match chunks
            .iter_mut()
            .find(|c| c.tenant_id == chunk.tenant_id && c.natural_key == chunk.natural_key)
        {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = chunk.clone();
                existing.created_at = created_at;
                existing.updated_at = now;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let mut stored = chunk.clone();
                stored.updated_at = now;
                chunks.push(stored);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn query(&self, query: &ChunkQuery<'_>) -> Result<Vec<DocumentChunk>> {
        let chunks = Self::read(&self.chunks)?;
        Ok(chunks.iter().filter(|c| query.matches(c)).cloned().collect())
    }

    async fn set_active(&self, tenant_id: &str, key: &NaturalKey, active: bool) -> Result<bool> {
        self.update_chunk(tenant_id, key, |c| c.is_active = active)
    }

    async fn set_channel(
        &self,
        tenant_id: &str,
        key: &NaturalKey,
        channel: Channel,
        enabled: bool,
    ) -> Result<bool> {
        self.update_chunk(tenant_id, key, |c| c.channels.set(channel, enabled))
    }

    async fn purge(&self, tenant_id: &str, key: &NaturalKey) -> Result<bool> {
        let mut chunks = Self::write(&self.chunks)?;
        let before = chunks.len();
        chunks.retain(|c| !(c.tenant_id == tenant_id && &c.natural_key == key));
        Ok(chunks.len() != before)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load(&self, key: &CustomerKey) -> Result<Option<CustomerState>> {
        Ok(Self::read(&self.states)?.get(key).cloned())
    }

    async fn create_if_absent(
        &self,
        key: &CustomerKey,
        now: DateTime<Utc>,
    ) -> Result<CustomerState> {
        let mut states = Self::write(&self.states)?;
        Ok(states
            .entry(key.clone())
            .or_insert_with(|| CustomerState::new(key.clone(), now))
            .clone())
    }

    async fn compare_and_swap(
        &self,
        expected_version: i64,
        next: &CustomerState,
    ) -> Result<Option<CustomerState>> {
        let mut states = Self::write(&self.states)?;
        match states.get_mut(&next.key) {
            Some(current) if current.version == expected_version => {
                let mut written = next.clone();
                written.version = expected_version + 1;
                written.created_at = current.created_at;
                *current = written.clone();
                Ok(Some(written))
            }
            _ => Ok(None),
        }
    }

    async fn list(
        &self,
        tenant_id: &str,
        mode: Option<ConversationMode>,
    ) -> Result<Vec<CustomerState>> {
        let states = Self::read(&self.states)?;
        let mut out: Vec<CustomerState> = states
            .values()
            .filter(|s| s.key.tenant_id == tenant_id && mode.map_or(true, |m| s.mode == m))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.key.customer_id.cmp(&b.key.customer_id))
        });
        Ok(out)
    }
}
