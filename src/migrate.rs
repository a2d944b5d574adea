use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // `seq` preserves insertion order; ranking ties fall back to it.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            page_id TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            source TEXT NOT NULL,
            channel_facebook INTEGER NOT NULL DEFAULT 1,
            channel_messenger INTEGER NOT NULL DEFAULT 1,
            is_active INTEGER NOT NULL DEFAULT 1,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(tenant_id, natural_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS customer_states (
            tenant_id TEXT NOT NULL,
            page_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            requested_at TEXT,
            agent_json TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, page_id, customer_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenant_settings (
            tenant_id TEXT PRIMARY KEY,
            bot_enabled INTEGER NOT NULL DEFAULT 1,
            context_budget INTEGER,
            result_limit INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_scope ON documents(tenant_id, page_id, is_active)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_customer_states_mode ON customer_states(tenant_id, mode, updated_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
