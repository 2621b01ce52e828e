//! Schema migrations
//!
//! Idempotent `CREATE TABLE IF NOT EXISTS` statements run in one
//! transaction at startup.

use crate::error::{Error, Result};
use sqlx::postgres::PgPool;

/// Run database migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| Error::Migration(e.to_string()))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clients (
            id BIGSERIAL PRIMARY KEY,
            user_id BIGINT NOT NULL,
            company_name TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::Migration(format!("Migration failed (clients): {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            id BIGSERIAL PRIMARY KEY,
            client_id BIGINT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            agent_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'offline',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::Migration(format!("Migration failed (agents): {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS whatsapp_accounts (
            id BIGSERIAL PRIMARY KEY,
            client_id BIGINT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
            phone_number TEXT NOT NULL,
            business_account_id TEXT NOT NULL,
            access_token TEXT NOT NULL,
            webhook_token TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::Migration(format!("Migration failed (whatsapp_accounts): {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS whatsapp_conversations (
            id BIGSERIAL PRIMARY KEY,
            whatsapp_account_id BIGINT NOT NULL REFERENCES whatsapp_accounts(id) ON DELETE CASCADE,
            agent_id BIGINT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
            contact_phone_number TEXT NOT NULL,
            contact_name TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            message_count INTEGER NOT NULL DEFAULT 0,
            last_message_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::Migration(format!("Migration failed (whatsapp_conversations): {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS whatsapp_messages (
            id BIGSERIAL PRIMARY KEY,
            conversation_id BIGINT NOT NULL REFERENCES whatsapp_conversations(id) ON DELETE CASCADE,
            provider_message_id TEXT NOT NULL UNIQUE,
            sender TEXT NOT NULL,
            content TEXT NOT NULL,
            message_type TEXT NOT NULL DEFAULT 'text',
            status TEXT NOT NULL DEFAULT 'sent',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::Migration(format!("Migration failed (whatsapp_messages): {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS whatsapp_webhooks (
            id BIGSERIAL PRIMARY KEY,
            whatsapp_account_id BIGINT NOT NULL REFERENCES whatsapp_accounts(id) ON DELETE CASCADE,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::Migration(format!("Migration failed (whatsapp_webhooks): {}", e)))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversations_account_contact \
         ON whatsapp_conversations(whatsapp_account_id, contact_phone_number)",
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::Migration(format!("Migration failed (idx_conversations_account_contact): {}", e)))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation \
         ON whatsapp_messages(conversation_id)",
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::Migration(format!("Migration failed (idx_messages_conversation): {}", e)))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_webhooks_account ON whatsapp_webhooks(whatsapp_account_id)",
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::Migration(format!("Migration failed (idx_webhooks_account): {}", e)))?;

    tx.commit()
        .await
        .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}
