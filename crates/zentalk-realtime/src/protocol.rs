//! Wire protocol for the dashboard WebSocket
//!
//! Tagged JSON messages in both directions. Clients authenticate first;
//! everything else on an unauthenticated connection is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zentalk_core::{AgentStatus, Message};

/// Message from client to server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind the connection to a user. The token must belong to the
    /// asserted user.
    Authenticate {
        /// Session token issued at login
        token: String,
        /// User the client claims to be
        user_id: i64,
    },
    /// Start receiving updates for a conversation
    SubscribeConversation { conversation_id: i64 },
    /// Stop receiving updates for a conversation
    UnsubscribeConversation { conversation_id: i64 },
    /// Keepalive
    Ping,
}

/// Message from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection established
    Connected { connection_id: Uuid },
    /// Authentication accepted
    Authenticated { user_id: i64 },
    /// Subscription confirmed
    Subscribed { conversation_id: i64 },
    /// Unsubscription confirmed
    Unsubscribed { conversation_id: i64 },
    /// A message was stored in a subscribed conversation
    NewMessage {
        conversation_id: i64,
        message: Message,
    },
    /// Conversation counters changed
    ConversationUpdate {
        conversation_id: i64,
        message_count: i32,
        last_message_at: Option<DateTime<Utc>>,
    },
    /// An agent changed presence state
    AgentStatusChange {
        agent_id: i64,
        status: AgentStatus,
        timestamp: DateTime<Utc>,
    },
    /// Error notification
    Error {
        message: String,
        code: Option<String>,
    },
    /// Keepalive response
    Pong,
}
