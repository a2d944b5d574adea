//! SQLite-backed [`DocumentStore`], [`ConversationStore`] and
//! [`SettingsStore`] implementation.
//!
//! Chunk upserts are an insert-or-nothing on `UNIQUE(tenant_id, natural_key)`
//! followed by a keyed update, each a single autocommit statement;
//! customer-state writes are a single `UPDATE ... WHERE version = ?`, so
//! several server processes sharing the database still get exactly one
//! winner per version.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use replyhub_core::embedding::{blob_to_vec, vec_to_blob};
use replyhub_core::models::{
    AssignedAgent, Channel, ChannelSet, ConversationMode, CustomerKey, CustomerState,
    DocumentChunk, NaturalKey,
};
use replyhub_core::store::{ChunkQuery, ConversationStore, DocumentStore, UpsertOutcome};

use crate::cache::{SettingsStore, TenantSettings};

/// SQLite implementation of the store traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    // Fixed width so lexical order in SQL matches time order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp in customer_states: {}", raw))?
        .with_timezone(&Utc))
}

fn chunk_from_row(row: &SqliteRow) -> Result<DocumentChunk> {
    let blob: Vec<u8> = row.get("embedding");
    let metadata_json: String = row.get("metadata_json");
    Ok(DocumentChunk {
        tenant_id: row.get("tenant_id"),
        page_id: row.get("page_id"),
        natural_key: NaturalKey::from_raw(row.get::<String, _>("natural_key")),
        content: row.get("content"),
        embedding: blob_to_vec(&blob),
        source: row.get("source"),
        channels: ChannelSet {
            facebook: row.get("channel_facebook"),
            messenger: row.get("channel_messenger"),
        },
        is_active: row.get("is_active"),
        metadata: serde_json::from_str(&metadata_json)
            .context("invalid metadata_json in documents")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn state_from_row(row: &SqliteRow) -> Result<CustomerState> {
    let mode: String = row.get("mode");
    let requested_at: Option<String> = row.get("requested_at");
    let agent_json: Option<String> = row.get("agent_json");
    let assigned_agent = match agent_json {
        Some(json) => Some(
            serde_json::from_str::<AssignedAgent>(&json)
                .context("invalid agent_json in customer_states")?,
        ),
        None => None,
    };
    Ok(CustomerState {
        key: CustomerKey {
            tenant_id: row.get("tenant_id"),
            page_id: row.get("page_id"),
            customer_id: row.get("customer_id"),
        },
        mode: mode.parse()?,
        requested_at: requested_at.as_deref().map(parse_ts).transpose()?,
        assigned_agent,
        version: row.get("version"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

const UPSERT_ATTEMPTS: usize = 3;

const STATE_COLUMNS: &str = "tenant_id, page_id, customer_id, mode, requested_at, agent_json, \
                             version, created_at, updated_at";

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert(&self, chunk: &DocumentChunk) -> Result<UpsertOutcome> {
        let now = Utc::now().timestamp();
        let metadata_json = serde_json::to_string(&chunk.metadata)?;
        let embedding = vec_to_blob(&chunk.embedding);

        // Each statement takes the write lock up front, so concurrent writers
        // wait on busy_timeout instead of failing a read-to-write upgrade.
        for _ in 0..UPSERT_ATTEMPTS {
            let inserted = sqlx::query(
                r#"
                INSERT INTO documents (tenant_id, page_id, natural_key, content, embedding, source,
                                       channel_facebook, channel_messenger, is_active,
                                       metadata_json, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tenant_id, natural_key) DO NOTHING
                "#,
            )
            .bind(&chunk.tenant_id)
            .bind(&chunk.page_id)
            .bind(chunk.natural_key.as_str())
            .bind(&chunk.content)
            .bind(&embedding)
            .bind(&chunk.source)
            .bind(chunk.channels.facebook)
            .bind(chunk.channels.messenger)
            .bind(chunk.is_active)
            .bind(&metadata_json)
            .bind(chunk.created_at)
            .bind(now)
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() > 0 {
                return Ok(UpsertOutcome::Inserted);
            }

            let updated = sqlx::query(
                r#"
                UPDATE documents SET
                    page_id = ?, content = ?, embedding = ?, source = ?,
                    channel_facebook = ?, channel_messenger = ?, is_active = ?,
                    metadata_json = ?, updated_at = ?
                WHERE tenant_id = ? AND natural_key = ?
                "#,
            )
            .bind(&chunk.page_id)
            .bind(&chunk.content)
            .bind(&embedding)
            .bind(&chunk.source)
            .bind(chunk.channels.facebook)
            .bind(chunk.channels.messenger)
            .bind(chunk.is_active)
            .bind(&metadata_json)
            .bind(now)
            .bind(&chunk.tenant_id)
            .bind(chunk.natural_key.as_str())
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() > 0 {
                return Ok(UpsertOutcome::Updated);
            }
            // Purged between the two statements; insert again.
        }

        anyhow::bail!(
            "upsert of {} for tenant {} kept racing with deletes",
            chunk.natural_key.as_str(),
            chunk.tenant_id
        )
    }

    async fn query(&self, query: &ChunkQuery<'_>) -> Result<Vec<DocumentChunk>> {
        let mut sql = String::from(
            "SELECT tenant_id, page_id, natural_key, content, embedding, source, \
             channel_facebook, channel_messenger, is_active, metadata_json, created_at, updated_at \
             FROM documents WHERE tenant_id = ? AND page_id = ?",
        );
        if query.active_only {
            sql.push_str(" AND is_active = 1");
        }
        match query.channel {
            Some(Channel::Facebook) => sql.push_str(" AND channel_facebook = 1"),
            Some(Channel::Messenger) => sql.push_str(" AND channel_messenger = 1"),
            None => {}
        }
        sql.push_str(" ORDER BY seq ASC");

        let rows = sqlx::query(&sql)
            .bind(query.tenant_id)
            .bind(query.page_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    async fn set_active(&self, tenant_id: &str, key: &NaturalKey, active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET is_active = ?, updated_at = ? WHERE tenant_id = ? AND natural_key = ?",
        )
        .bind(active)
        .bind(Utc::now().timestamp())
        .bind(tenant_id)
        .bind(key.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_channel(
        &self,
        tenant_id: &str,
        key: &NaturalKey,
        channel: Channel,
        enabled: bool,
    ) -> Result<bool> {
        let sql = match channel {
            Channel::Facebook => {
                "UPDATE documents SET channel_facebook = ?, updated_at = ? WHERE tenant_id = ? AND natural_key = ?"
            }
            Channel::Messenger => {
                "UPDATE documents SET channel_messenger = ?, updated_at = ? WHERE tenant_id = ? AND natural_key = ?"
            }
        };
        let result = sqlx::query(sql)
            .bind(enabled)
            .bind(Utc::now().timestamp())
            .bind(tenant_id)
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge(&self, tenant_id: &str, key: &NaturalKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE tenant_id = ? AND natural_key = ?")
            .bind(tenant_id)
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn load(&self, key: &CustomerKey) -> Result<Option<CustomerState>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM customer_states WHERE tenant_id = ? AND page_id = ? AND customer_id = ?",
            STATE_COLUMNS
        ))
        .bind(&key.tenant_id)
        .bind(&key.page_id)
        .bind(&key.customer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(state_from_row).transpose()
    }

    async fn create_if_absent(
        &self,
        key: &CustomerKey,
        now: DateTime<Utc>,
    ) -> Result<CustomerState> {
        let ts = format_ts(now);
        sqlx::query(
            r#"
            INSERT INTO customer_states (tenant_id, page_id, customer_id, mode, version,
                                         created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(tenant_id, page_id, customer_id) DO NOTHING
            "#,
        )
        .bind(&key.tenant_id)
        .bind(&key.page_id)
        .bind(&key.customer_id)
        .bind(ConversationMode::Bot.as_str())
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await?;

        self.load(key)
            .await?
            .with_context(|| format!("customer state {} vanished after insert", key))
    }

    async fn compare_and_swap(
        &self,
        expected_version: i64,
        next: &CustomerState,
    ) -> Result<Option<CustomerState>> {
        let agent_json = next
            .assigned_agent
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE customer_states
            SET mode = ?, requested_at = ?, agent_json = ?, version = version + 1, updated_at = ?
            WHERE tenant_id = ? AND page_id = ? AND customer_id = ? AND version = ?
            "#,
        )
        .bind(next.mode.as_str())
        .bind(next.requested_at.map(format_ts))
        .bind(agent_json)
        .bind(format_ts(next.updated_at))
        .bind(&next.key.tenant_id)
        .bind(&next.key.page_id)
        .bind(&next.key.customer_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let mut written = next.clone();
        written.version = expected_version + 1;
        Ok(Some(written))
    }

    async fn list(
        &self,
        tenant_id: &str,
        mode: Option<ConversationMode>,
    ) -> Result<Vec<CustomerState>> {
        let rows = match mode {
            Some(mode) => {
                sqlx::query(&format!(
                    "SELECT {} FROM customer_states WHERE tenant_id = ? AND mode = ? \
                     ORDER BY updated_at DESC, customer_id ASC",
                    STATE_COLUMNS
                ))
                .bind(tenant_id)
                .bind(mode.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM customer_states WHERE tenant_id = ? \
                     ORDER BY updated_at DESC, customer_id ASC",
                    STATE_COLUMNS
                ))
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(state_from_row).collect()
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn load_settings(&self, tenant_id: &str) -> Result<Option<TenantSettings>> {
        let row = sqlx::query(
            "SELECT bot_enabled, context_budget, result_limit FROM tenant_settings WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| TenantSettings {
            bot_enabled: row.get("bot_enabled"),
            context_budget: row
                .get::<Option<i64>, _>("context_budget")
                .map(|v| v.max(1) as usize),
            result_limit: row
                .get::<Option<i64>, _>("result_limit")
                .map(|v| v.max(1) as usize),
        }))
    }

    async fn save_settings(&self, tenant_id: &str, settings: &TenantSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_settings (tenant_id, bot_enabled, context_budget, result_limit, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET
                bot_enabled = excluded.bot_enabled,
                context_budget = excluded.context_budget,
                result_limit = excluded.result_limit,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(settings.bot_enabled)
        .bind(settings.context_budget.map(|v| v as i64))
        .bind(settings.result_limit.map(|v| v as i64))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
