//! Persistent entity types shared across the relay
//!
//! These mirror the relational schema one-to-one. Status fields are stored
//! as lowercase strings, so the enums carry `as_str` and `FromStr`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a provisioned WhatsApp Business account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhatsAppAccountStatus {
    /// Account can send and receive
    Active,
    /// Temporarily disabled by the owner
    Inactive,
    /// Disabled by an operator
    Suspended,
}

impl WhatsAppAccountStatus {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for WhatsAppAccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WhatsAppAccountStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown account status: {}", other)),
        }
    }
}

/// Lifecycle state of a conversation thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Closed,
    Archived,
}

impl ConversationStatus {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown conversation status: {}", other)),
        }
    }
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSender {
    /// The external WhatsApp contact
    User,
    /// The AI agent persona
    Agent,
}

impl MessageSender {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MessageSender {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown message sender: {}", other)),
        }
    }
}

/// Content type of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Document,
    Audio,
    Video,
}

impl MessageType {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "document" => Ok(Self::Document),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown message type: {}", other)),
        }
    }
}

/// Delivery state reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown delivery status: {}", other)),
        }
    }
}

/// Processing outcome of a logged webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookLogStatus {
    Pending,
    Processed,
    Failed,
}

impl WebhookLogStatus {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WebhookLogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WebhookLogStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown webhook log status: {}", other)),
        }
    }
}

/// Presence state of an agent persona
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown agent status: {}", other)),
        }
    }
}

/// A tenant owning agents and WhatsApp accounts.
///
/// Clients are managed by the surrounding web app; the relay only needs the
/// ownership link back to a user for the account→client→user chain check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub user_id: i64,
    pub company_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An AI agent persona owned by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub client_id: i64,
    pub name: String,
    /// Model identifier, e.g. "gpt-4o-mini"
    pub agent_type: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

/// A provider-registered WhatsApp Business sending identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppAccount {
    pub id: i64,
    pub client_id: i64,
    pub phone_number: String,
    /// Provider phone-number id used in the send endpoint path
    pub business_account_id: String,
    /// Bearer credential for the provider API. Never logged.
    #[serde(skip_serializing)]
    pub access_token: String,
    /// Per-account webhook secret. Never logged.
    #[serde(skip_serializing)]
    pub webhook_token: String,
    pub status: WhatsAppAccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The thread between one account and one external contact phone number.
///
/// Invariant: at most one `active` conversation per (account, contact) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub whatsapp_account_id: i64,
    pub agent_id: i64,
    pub contact_phone_number: String,
    pub contact_name: Option<String>,
    pub status: ConversationStatus,
    pub message_count: i32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored inbound or outbound message.
///
/// Immutable once created except for `status`, which is driven by provider
/// delivery callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    /// Provider message id — unique, the dedupe key for webhook redelivery
    pub provider_message_id: String,
    pub sender: MessageSender,
    pub content: String,
    pub message_type: MessageType,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record of a raw webhook delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: i64,
    pub whatsapp_account_id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: WebhookLogStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trip() {
        assert_eq!(ConversationStatus::Active.as_str(), "active");
        assert_eq!(
            ConversationStatus::from_str("archived").unwrap(),
            ConversationStatus::Archived
        );
        assert!(ConversationStatus::from_str("zombie").is_err());
    }

    #[test]
    fn test_delivery_status_parse() {
        for status in ["sent", "delivered", "read", "failed"] {
            assert_eq!(DeliveryStatus::from_str(status).unwrap().as_str(), status);
        }
    }

    #[test]
    fn test_account_secret_fields_not_serialized() {
        let account = WhatsAppAccount {
            id: 1,
            client_id: 1,
            phone_number: "+15550001111".to_string(),
            business_account_id: "pn-123".to_string(),
            access_token: "secret-token".to_string(),
            webhook_token: "hook-secret".to_string(),
            status: WhatsAppAccountStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let json = serde_json::to_string(&account).unwrap();
        assert!(!json.contains("secret-token"));
        assert!(!json.contains("hook-secret"));
    }

    #[test]
    fn test_message_serde_lowercase() {
        let json = serde_json::to_value(MessageSender::Agent).unwrap();
        assert_eq!(json, serde_json::json!("agent"));
    }
}
