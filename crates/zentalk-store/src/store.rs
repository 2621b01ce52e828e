//! Store - Relay persistence using PostgreSQL
//!
//! This module provides the storage layer for accounts, agents,
//! conversations, messages and webhook logs. It uses sqlx for async
//! PostgreSQL access.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{debug, instrument};
use zentalk_core::{
    Agent, AgentStatus, Client, Conversation, DeliveryStatus, Message, MessageSender, MessageType,
    WebhookLogStatus, WhatsAppAccount,
};

/// Input for registering a WhatsApp account
#[derive(Debug, Clone)]
pub struct NewAccount {
    /// Owning client
    pub client_id: i64,
    /// E.164 phone number of the sending identity
    pub phone_number: String,
    /// Provider phone-number id used in the send endpoint path
    pub business_account_id: String,
    /// Provider API bearer credential
    pub access_token: String,
    /// Per-account webhook secret
    pub webhook_token: String,
}

/// Input for opening a conversation
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub whatsapp_account_id: i64,
    pub agent_id: i64,
    pub contact_phone_number: String,
    pub contact_name: Option<String>,
}

/// Input for storing a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    /// Dedupe key; a second insert with the same id is a no-op
    pub provider_message_id: String,
    pub sender: MessageSender,
    pub content: String,
    pub message_type: MessageType,
    pub status: DeliveryStatus,
}

/// Trait for relay storage backends
///
/// This trait allows different storage implementations (PostgreSQL,
/// in-memory, etc.) to be used interchangeably.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RelayStore: Send + Sync {
    // =========================================================================
    // Clients and agents
    // =========================================================================

    /// Get a client by ID
    async fn get_client(&self, id: i64) -> Result<Client>;

    /// Get an agent by ID
    async fn get_agent(&self, id: i64) -> Result<Agent>;

    /// Pick the client's agent with the fewest active conversations.
    /// Ties break on lowest agent id.
    async fn least_loaded_agent(&self, client_id: i64) -> Result<Agent>;

    /// Set an agent's presence state
    async fn update_agent_status(&self, id: i64, status: AgentStatus) -> Result<Agent>;

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Register a WhatsApp account
    async fn create_account(&self, new: NewAccount) -> Result<WhatsAppAccount>;

    /// Get an account by ID
    async fn get_account(&self, id: i64) -> Result<WhatsAppAccount>;

    /// List accounts reachable through the user's clients
    async fn list_accounts_for_user(&self, user_id: i64) -> Result<Vec<WhatsAppAccount>>;

    /// Replace both credentials of an account
    async fn rotate_account_credentials(
        &self,
        id: i64,
        access_token: &str,
        webhook_token: &str,
    ) -> Result<WhatsAppAccount>;

    // =========================================================================
    // Conversations
    // =========================================================================

    /// Find the active conversation for an (account, contact) pair
    async fn find_active_conversation(
        &self,
        whatsapp_account_id: i64,
        contact_phone_number: &str,
    ) -> Result<Option<Conversation>>;

    /// Open a conversation with message_count 0
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation>;

    /// Get a conversation by ID
    async fn get_conversation(&self, id: i64) -> Result<Conversation>;

    /// List conversations for an account, most recently updated first
    async fn list_conversations(
        &self,
        whatsapp_account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>>;

    /// Bump message_count and advance last_message_at after a stored message
    async fn touch_conversation(&self, id: i64, last_message_at: DateTime<Utc>) -> Result<()>;

    // =========================================================================
    // Messages
    // =========================================================================

    /// Store a message.
    ///
    /// Returns `None` when a message with the same provider id already
    /// exists; the caller treats that as a redelivered webhook.
    async fn insert_message(&self, new: NewMessage) -> Result<Option<Message>>;

    /// The most recent `limit` messages of a conversation, oldest first
    async fn recent_messages(&self, conversation_id: i64, limit: i64) -> Result<Vec<Message>>;

    /// List messages for a conversation in chronological order
    async fn list_messages(
        &self,
        conversation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>>;

    /// Apply a provider delivery callback. Returns false when the
    /// provider id matches no stored message.
    async fn update_message_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool>;

    // =========================================================================
    // Webhook logs
    // =========================================================================

    /// Append a raw webhook delivery to the audit log, status `pending`.
    /// Returns the log id.
    async fn append_webhook_log(
        &self,
        whatsapp_account_id: i64,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<i64>;

    /// Record the processing outcome of a logged webhook
    async fn set_webhook_log_status(&self, id: i64, status: WebhookLogStatus) -> Result<()>;
}

/// Relay store backed by PostgreSQL
#[derive(Clone)]
pub struct PgRelayStore {
    pool: PgPool,
}

impl PgRelayStore {
    /// Create a new store with the given connection pool
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    fn row_to_client(row: sqlx::postgres::PgRow) -> Result<Client> {
        Ok(Client {
            id: row.get("id"),
            user_id: row.get("user_id"),
            company_name: row.get("company_name"),
            created_at: row.get("created_at"),
        })
    }

    fn row_to_agent(row: sqlx::postgres::PgRow) -> Result<Agent> {
        let status_str: String = row.get("status");
        let status: AgentStatus = status_str
            .parse()
            .map_err(|e: String| Error::Serialization(e))?;

        Ok(Agent {
            id: row.get("id"),
            client_id: row.get("client_id"),
            name: row.get("name"),
            agent_type: row.get("agent_type"),
            status,
            created_at: row.get("created_at"),
        })
    }

    fn row_to_account(row: sqlx::postgres::PgRow) -> Result<WhatsAppAccount> {
        let status_str: String = row.get("status");
        let status = status_str
            .parse()
            .map_err(|e: String| Error::Serialization(e))?;

        Ok(WhatsAppAccount {
            id: row.get("id"),
            client_id: row.get("client_id"),
            phone_number: row.get("phone_number"),
            business_account_id: row.get("business_account_id"),
            access_token: row.get("access_token"),
            webhook_token: row.get("webhook_token"),
            status,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_conversation(row: sqlx::postgres::PgRow) -> Result<Conversation> {
        let status_str: String = row.get("status");
        let status = status_str
            .parse()
            .map_err(|e: String| Error::Serialization(e))?;

        Ok(Conversation {
            id: row.get("id"),
            whatsapp_account_id: row.get("whatsapp_account_id"),
            agent_id: row.get("agent_id"),
            contact_phone_number: row.get("contact_phone_number"),
            contact_name: row.get("contact_name"),
            status,
            message_count: row.get("message_count"),
            last_message_at: row.get("last_message_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_message(row: sqlx::postgres::PgRow) -> Result<Message> {
        let sender_str: String = row.get("sender");
        let sender = sender_str
            .parse()
            .map_err(|e: String| Error::Serialization(e))?;
        let type_str: String = row.get("message_type");
        let message_type = type_str
            .parse()
            .map_err(|e: String| Error::Serialization(e))?;
        let status_str: String = row.get("status");
        let status = status_str
            .parse()
            .map_err(|e: String| Error::Serialization(e))?;

        Ok(Message {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            provider_message_id: row.get("provider_message_id"),
            sender,
            content: row.get("content"),
            message_type,
            status,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait::async_trait]
impl RelayStore for PgRelayStore {
    #[instrument(skip(self))]
    async fn get_client(&self, id: i64) -> Result<Client> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, company_name, created_at
            FROM clients
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("client {}", id)))?;

        Self::row_to_client(row)
    }

    #[instrument(skip(self))]
    async fn get_agent(&self, id: i64) -> Result<Agent> {
        let row = sqlx::query(
            r#"
            SELECT id, client_id, name, agent_type, status, created_at
            FROM agents
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("agent {}", id)))?;

        Self::row_to_agent(row)
    }

    #[instrument(skip(self))]
    async fn least_loaded_agent(&self, client_id: i64) -> Result<Agent> {
        let row = sqlx::query(
            r#"
            SELECT a.id, a.client_id, a.name, a.agent_type, a.status, a.created_at
            FROM agents a
            LEFT JOIN whatsapp_conversations c
                ON c.agent_id = a.id AND c.status = 'active'
            WHERE a.client_id = $1
            GROUP BY a.id
            ORDER BY COUNT(c.id) ASC, a.id ASC
            LIMIT 1
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("no agents for client {}", client_id)))?;

        Self::row_to_agent(row)
    }

    #[instrument(skip(self))]
    async fn update_agent_status(&self, id: i64, status: AgentStatus) -> Result<Agent> {
        let row = sqlx::query(
            r#"
            UPDATE agents
            SET status = $2
            WHERE id = $1
            RETURNING id, client_id, name, agent_type, status, created_at
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("agent {}", id)))?;

        debug!("Updated agent {} status to {}", id, status);
        Self::row_to_agent(row)
    }

    #[instrument(skip(self, new), fields(client_id = new.client_id))]
    async fn create_account(&self, new: NewAccount) -> Result<WhatsAppAccount> {
        let row = sqlx::query(
            r#"
            INSERT INTO whatsapp_accounts (
                client_id, phone_number, business_account_id,
                access_token, webhook_token
            ) VALUES ($1, $2, $3, $4, $5)
            RETURNING id, client_id, phone_number, business_account_id,
                      access_token, webhook_token, status, created_at, updated_at
            "#,
        )
        .bind(new.client_id)
        .bind(&new.phone_number)
        .bind(&new.business_account_id)
        .bind(&new.access_token)
        .bind(&new.webhook_token)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let account = Self::row_to_account(row)?;
        debug!("Created account {}", account.id);
        Ok(account)
    }

    #[instrument(skip(self))]
    async fn get_account(&self, id: i64) -> Result<WhatsAppAccount> {
        let row = sqlx::query(
            r#"
            SELECT id, client_id, phone_number, business_account_id,
                   access_token, webhook_token, status, created_at, updated_at
            FROM whatsapp_accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("account {}", id)))?;

        Self::row_to_account(row)
    }

    #[instrument(skip(self))]
    async fn list_accounts_for_user(&self, user_id: i64) -> Result<Vec<WhatsAppAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.client_id, a.phone_number, a.business_account_id,
                   a.access_token, a.webhook_token, a.status, a.created_at, a.updated_at
            FROM whatsapp_accounts a
            JOIN clients c ON c.id = a.client_id
            WHERE c.user_id = $1
            ORDER BY a.id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter().map(Self::row_to_account).collect()
    }

    #[instrument(skip(self, access_token, webhook_token))]
    async fn rotate_account_credentials(
        &self,
        id: i64,
        access_token: &str,
        webhook_token: &str,
    ) -> Result<WhatsAppAccount> {
        let row = sqlx::query(
            r#"
            UPDATE whatsapp_accounts
            SET access_token = $2, webhook_token = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING id, client_id, phone_number, business_account_id,
                      access_token, webhook_token, status, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(access_token)
        .bind(webhook_token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("account {}", id)))?;

        debug!("Rotated credentials for account {}", id);
        Self::row_to_account(row)
    }

    #[instrument(skip(self))]
    async fn find_active_conversation(
        &self,
        whatsapp_account_id: i64,
        contact_phone_number: &str,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, whatsapp_account_id, agent_id, contact_phone_number,
                   contact_name, status, message_count, last_message_at,
                   created_at, updated_at
            FROM whatsapp_conversations
            WHERE whatsapp_account_id = $1
              AND contact_phone_number = $2
              AND status = 'active'
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(whatsapp_account_id)
        .bind(contact_phone_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.map(Self::row_to_conversation).transpose()
    }

    #[instrument(skip(self, new), fields(whatsapp_account_id = new.whatsapp_account_id))]
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation> {
        let row = sqlx::query(
            r#"
            INSERT INTO whatsapp_conversations (
                whatsapp_account_id, agent_id, contact_phone_number, contact_name
            ) VALUES ($1, $2, $3, $4)
            RETURNING id, whatsapp_account_id, agent_id, contact_phone_number,
                      contact_name, status, message_count, last_message_at,
                      created_at, updated_at
            "#,
        )
        .bind(new.whatsapp_account_id)
        .bind(new.agent_id)
        .bind(&new.contact_phone_number)
        .bind(&new.contact_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let conversation = Self::row_to_conversation(row)?;
        debug!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    #[instrument(skip(self))]
    async fn get_conversation(&self, id: i64) -> Result<Conversation> {
        let row = sqlx::query(
            r#"
            SELECT id, whatsapp_account_id, agent_id, contact_phone_number,
                   contact_name, status, message_count, last_message_at,
                   created_at, updated_at
            FROM whatsapp_conversations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("conversation {}", id)))?;

        Self::row_to_conversation(row)
    }

    #[instrument(skip(self))]
    async fn list_conversations(
        &self,
        whatsapp_account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, whatsapp_account_id, agent_id, contact_phone_number,
                   contact_name, status, message_count, last_message_at,
                   created_at, updated_at
            FROM whatsapp_conversations
            WHERE whatsapp_account_id = $1
            ORDER BY updated_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(whatsapp_account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter().map(Self::row_to_conversation).collect()
    }

    #[instrument(skip(self))]
    async fn touch_conversation(&self, id: i64, last_message_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE whatsapp_conversations
            SET message_count = message_count + 1,
                last_message_at = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last_message_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self, new), fields(conversation_id = new.conversation_id))]
    async fn insert_message(&self, new: NewMessage) -> Result<Option<Message>> {
        // ON CONFLICT DO NOTHING makes webhook redelivery idempotent:
        // no row comes back for a provider id we already stored.
        let row = sqlx::query(
            r#"
            INSERT INTO whatsapp_messages (
                conversation_id, provider_message_id, sender, content,
                message_type, status
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (provider_message_id) DO NOTHING
            RETURNING id, conversation_id, provider_message_id, sender,
                      content, message_type, status, created_at
            "#,
        )
        .bind(new.conversation_id)
        .bind(&new.provider_message_id)
        .bind(new.sender.as_str())
        .bind(&new.content)
        .bind(new.message_type.as_str())
        .bind(new.status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let message = Self::row_to_message(row)?;
                debug!("Stored message {}", message.id);
                Ok(Some(message))
            }
            None => {
                debug!(
                    provider_message_id = %new.provider_message_id,
                    "Duplicate message skipped"
                );
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    async fn recent_messages(&self, conversation_id: i64, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, provider_message_id, sender,
                   content, message_type, status, created_at
            FROM (
                SELECT id, conversation_id, provider_message_id, sender,
                       content, message_type, status, created_at
                FROM whatsapp_messages
                WHERE conversation_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2
            ) recent
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    #[instrument(skip(self))]
    async fn list_messages(
        &self,
        conversation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, provider_message_id, sender,
                   content, message_type, status, created_at
            FROM whatsapp_messages
            WHERE conversation_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    #[instrument(skip(self))]
    async fn update_message_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE whatsapp_messages
            SET status = $2
            WHERE provider_message_id = $1
            "#,
        )
        .bind(provider_message_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, payload))]
    async fn append_webhook_log(
        &self,
        whatsapp_account_id: i64,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO whatsapp_webhooks (whatsapp_account_id, event_type, payload)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(whatsapp_account_id)
        .bind(event_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("id"))
    }

    #[instrument(skip(self))]
    async fn set_webhook_log_status(&self, id: i64, status: WebhookLogStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE whatsapp_webhooks
            SET status = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
