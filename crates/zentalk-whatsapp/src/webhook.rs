//! Webhook payload types and verification
//!
//! Covers both halves of the WhatsApp Business webhook contract: the GET
//! challenge handshake used when registering the callback URL, and the
//! POST event payloads carrying inbound messages and delivery receipts.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::info;
use zentalk_core::{DeliveryStatus, WhatsAppAccount};

/// Maximum length of message text to log
const MAX_LOG_TEXT_LENGTH: usize = 50;

/// Sensitive patterns to mask
const SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "bearer",
    "credential",
    "private",
];

/// Mask message text for logging
pub fn mask_for_logging(text: &str) -> String {
    let lower = text.to_lowercase();
    for pattern in SENSITIVE_PATTERNS {
        if lower.contains(pattern) {
            return "[REDACTED]".to_string();
        }
    }
    if text.len() > MAX_LOG_TEXT_LENGTH {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i < MAX_LOG_TEXT_LENGTH)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        format!("{}...", &text[..cut])
    } else {
        text.to_string()
    }
}

// ============================================================================
// Challenge handshake
// ============================================================================

/// Query parameters of the webhook verification GET
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyQuery {
    /// Should be "subscribe"
    #[serde(rename = "hub.mode")]
    pub mode: String,
    /// Must equal the account's webhook token
    #[serde(rename = "hub.verify_token")]
    pub verify_token: String,
    /// Echoed back verbatim on success
    #[serde(rename = "hub.challenge")]
    pub challenge: String,
}

/// Answer the registration handshake.
///
/// Returns the challenge to echo, or `None` when the mode or token is
/// wrong and the provider should see a 403.
pub fn verify_challenge(account: &WhatsAppAccount, query: &VerifyQuery) -> Option<String> {
    if query.mode == "subscribe" && token_matches(account, &query.verify_token) {
        info!(account_id = account.id, "Webhook verified");
        Some(query.challenge.clone())
    } else {
        None
    }
}

/// Compare a presented webhook token against the account's secret
pub fn token_matches(account: &WhatsAppAccount, presented: &str) -> bool {
    let expected = account.webhook_token.as_bytes();
    let presented = presented.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    expected.ct_eq(presented).into()
}

// ============================================================================
// Event payload
// ============================================================================

/// Incoming webhook event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Object type (should be "whatsapp_business_account")
    pub object: String,
    /// Entry array
    pub entry: Vec<WebhookEntry>,
}

/// Webhook entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEntry {
    /// Business Account ID
    pub id: String,
    /// Changes array
    pub changes: Vec<WebhookChange>,
}

/// Webhook change event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChange {
    /// Value containing the actual message data
    pub value: WebhookValue,
    /// Field name
    pub field: String,
}

/// Webhook value containing message data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookValue {
    /// Messaging product
    pub messaging_product: String,
    /// Metadata
    pub metadata: WebhookMetadata,
    /// Contacts (sender info)
    #[serde(default)]
    pub contacts: Vec<WebhookContact>,
    /// Messages
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    /// Statuses (delivery receipts)
    #[serde(default)]
    pub statuses: Vec<StatusUpdate>,
}

/// Webhook metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMetadata {
    /// Display phone number
    pub display_phone_number: String,
    /// Phone number ID
    pub phone_number_id: String,
}

/// Webhook contact (sender info)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookContact {
    /// Profile info
    pub profile: Option<WebhookProfile>,
    /// Phone number
    pub wa_id: String,
}

/// Webhook profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookProfile {
    /// Display name
    pub name: String,
}

/// Inbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Sender phone number
    pub from: String,
    /// Provider message ID
    pub id: String,
    /// Unix timestamp, as a string
    pub timestamp: String,
    /// Message type
    #[serde(rename = "type")]
    pub message_type: String,
    /// Text content (for text messages)
    pub text: Option<TextContent>,
}

impl InboundMessage {
    /// Provider timestamp as UTC, falling back to now when unparseable
    #[must_use]
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        self.timestamp
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now)
    }
}

/// Text content in a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextContent {
    /// Message body
    pub body: String,
}

/// Delivery receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Provider message ID
    pub id: String,
    /// Status (sent, delivered, read, failed)
    pub status: String,
    /// Unix timestamp, as a string
    pub timestamp: String,
    /// Recipient phone number
    pub recipient_id: String,
}

impl StatusUpdate {
    /// Parse the provider status into the stored taxonomy
    #[must_use]
    pub fn delivery_status(&self) -> Option<DeliveryStatus> {
        self.status.parse().ok()
    }
}

impl WebhookPayload {
    /// Name of the first change field, used for the audit log
    #[must_use]
    pub fn event_type(&self) -> &str {
        self.entry
            .first()
            .and_then(|e| e.changes.first())
            .map_or("unknown", |c| c.field.as_str())
    }

    /// Extract inbound text messages with their sender's display name
    #[must_use]
    pub fn text_messages(&self) -> Vec<(Option<String>, &InboundMessage)> {
        let mut messages = Vec::new();

        for entry in &self.entry {
            for change in &entry.changes {
                if change.field != "messages" {
                    continue;
                }

                let sender_name = change
                    .value
                    .contacts
                    .first()
                    .and_then(|c| c.profile.as_ref())
                    .map(|p| p.name.clone());

                for msg in &change.value.messages {
                    if msg.message_type == "text" && msg.text.is_some() {
                        messages.push((sender_name.clone(), msg));
                    }
                }
            }
        }

        messages
    }

    /// Extract delivery receipts
    #[must_use]
    pub fn status_updates(&self) -> Vec<&StatusUpdate> {
        self.entry
            .iter()
            .flat_map(|e| &e.changes)
            .flat_map(|c| &c.value.statuses)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use zentalk_core::WhatsAppAccountStatus;

    fn test_account(webhook_token: &str) -> WhatsAppAccount {
        WhatsAppAccount {
            id: 1,
            client_id: 1,
            phone_number: "+15550001111".to_string(),
            business_account_id: "pn-1".to_string(),
            access_token: "access".to_string(),
            webhook_token: webhook_token.to_string(),
            status: WhatsAppAccountStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn text_payload() -> WebhookPayload {
        serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "biz-1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {
                            "display_phone_number": "+15550001111",
                            "phone_number_id": "pn-1"
                        },
                        "contacts": [{
                            "profile": { "name": "Ana" },
                            "wa_id": "15550002222"
                        }],
                        "messages": [{
                            "from": "15550002222",
                            "id": "wamid.abc",
                            "timestamp": "1700000000",
                            "type": "text",
                            "text": { "body": "hi there" }
                        }]
                    }
                }]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_verify_challenge_echoes_on_match() {
        let account = test_account("hook-secret");
        let query = VerifyQuery {
            mode: "subscribe".to_string(),
            verify_token: "hook-secret".to_string(),
            challenge: "challenge_123".to_string(),
        };

        assert_eq!(
            verify_challenge(&account, &query),
            Some("challenge_123".to_string())
        );
    }

    #[test]
    fn test_verify_challenge_rejects_wrong_token_or_mode() {
        let account = test_account("hook-secret");

        let wrong_token = VerifyQuery {
            mode: "subscribe".to_string(),
            verify_token: "wrong".to_string(),
            challenge: "c".to_string(),
        };
        assert_eq!(verify_challenge(&account, &wrong_token), None);

        let wrong_mode = VerifyQuery {
            mode: "unsubscribe".to_string(),
            verify_token: "hook-secret".to_string(),
            challenge: "c".to_string(),
        };
        assert_eq!(verify_challenge(&account, &wrong_mode), None);
    }

    #[test]
    fn test_verify_query_parses_hub_params() {
        let query: VerifyQuery = serde_urlencoded::from_str(
            "hub.mode=subscribe&hub.verify_token=hook-secret&hub.challenge=42",
        )
        .unwrap();
        assert_eq!(query.mode, "subscribe");
        assert_eq!(query.challenge, "42");
    }

    #[test]
    fn test_text_messages_extracts_sender_name() {
        let payload = text_payload();
        let messages = payload.text_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0.as_deref(), Some("Ana"));
        assert_eq!(messages[0].1.id, "wamid.abc");
        assert_eq!(payload.event_type(), "messages");
    }

    #[test]
    fn test_non_text_messages_are_skipped() {
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "biz-1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {
                            "display_phone_number": "+15550001111",
                            "phone_number_id": "pn-1"
                        },
                        "messages": [{
                            "from": "15550002222",
                            "id": "wamid.img",
                            "timestamp": "1700000000",
                            "type": "image"
                        }]
                    }
                }]
            }]
        }))
        .unwrap();

        assert!(payload.text_messages().is_empty());
    }

    #[test]
    fn test_status_updates_parse_into_taxonomy() {
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "biz-1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {
                            "display_phone_number": "+15550001111",
                            "phone_number_id": "pn-1"
                        },
                        "statuses": [{
                            "id": "wamid.abc",
                            "status": "delivered",
                            "timestamp": "1700000100",
                            "recipient_id": "15550002222"
                        }]
                    }
                }]
            }]
        }))
        .unwrap();

        let statuses = payload.status_updates();
        assert_eq!(statuses.len(), 1);
        assert_eq!(
            statuses[0].delivery_status(),
            Some(DeliveryStatus::Delivered)
        );
    }

    #[test]
    fn test_timestamp_parses_unix_seconds() {
        let payload = text_payload();
        let ts = payload.text_messages()[0].1.timestamp_utc();
        assert_eq!(ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_mask_for_logging() {
        assert_eq!(mask_for_logging("my password is 123"), "[REDACTED]");
        assert_eq!(mask_for_logging("hello"), "hello");

        let long = "a".repeat(80);
        let masked = mask_for_logging(&long);
        assert!(masked.ends_with("..."));
        assert!(masked.len() < long.len());
    }
}
