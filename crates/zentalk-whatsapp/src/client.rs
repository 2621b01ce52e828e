//! Outbound send client for the WhatsApp Business Cloud API

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};
use zentalk_core::WhatsAppAccount;

/// Graph API version used for the messages endpoint
const DEFAULT_API_VERSION: &str = "v18.0";

/// Outbound request timeout
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    message_type: &'static str,
    text: TextBody<'a>,
}

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    messages: Option<Vec<MessageInfo>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    code: i32,
}

// ============================================================================
// API trait
// ============================================================================

/// Trait for the outbound provider API
///
/// The pipeline sends through this seam; tests substitute a recording
/// stub for the HTTP client.
#[async_trait::async_trait]
pub trait WhatsAppApi: Send + Sync {
    /// Send a text message from the account's number.
    ///
    /// Returns the provider's message id on success.
    async fn send_text(&self, account: &WhatsAppAccount, to: &str, body: &str) -> Result<String>;
}

// ============================================================================
// HTTP client
// ============================================================================

/// WhatsApp Business Cloud API client
pub struct WhatsAppClient {
    client: reqwest::Client,
    api_version: String,
}

impl WhatsAppClient {
    /// Create a new client
    pub fn new() -> Result<Self> {
        Self::with_api_version(DEFAULT_API_VERSION)
    }

    /// Create a client pinned to a specific Graph API version
    pub fn with_api_version(api_version: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        Ok(Self {
            client,
            api_version: api_version.into(),
        })
    }

    fn messages_url(&self, account: &WhatsAppAccount) -> String {
        format!(
            "https://graph.facebook.com/{}/{}/messages",
            self.api_version, account.business_account_id
        )
    }
}

#[async_trait::async_trait]
impl WhatsAppApi for WhatsAppClient {
    #[instrument(skip(self, account, body), fields(account_id = account.id))]
    async fn send_text(&self, account: &WhatsAppAccount, to: &str, body: &str) -> Result<String> {
        let url = self.messages_url(account);

        let request = SendRequest {
            messaging_product: "whatsapp",
            to,
            message_type: "text",
            text: TextBody { body },
        };

        let response: ApiResponse = self
            .client
            .post(&url)
            .bearer_auth(&account.access_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to send message: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Api(format!("Invalid API response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(Error::Api(format!(
                "API error {}: {}",
                error.code, error.message
            )));
        }

        let message_id = response
            .messages
            .and_then(|m| m.first().map(|msg| msg.id.clone()))
            .ok_or_else(|| Error::Api("response carried no message id".to_string()))?;

        debug!(provider_message_id = %message_id, "Message sent");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use zentalk_core::WhatsAppAccountStatus;

    #[test]
    fn test_messages_url_uses_account_number_id() {
        let client = WhatsAppClient::with_api_version("v18.0").unwrap();
        let account = WhatsAppAccount {
            id: 1,
            client_id: 1,
            phone_number: "+15550001111".to_string(),
            business_account_id: "123456".to_string(),
            access_token: "access".to_string(),
            webhook_token: "hook".to_string(),
            status: WhatsAppAccountStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(
            client.messages_url(&account),
            "https://graph.facebook.com/v18.0/123456/messages"
        );
    }

    #[test]
    fn test_send_request_wire_shape() {
        let request = SendRequest {
            messaging_product: "whatsapp",
            to: "15550002222",
            message_type: "text",
            text: TextBody { body: "hello" },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messaging_product"], "whatsapp");
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"]["body"], "hello");
    }

    #[test]
    fn test_api_error_body_parses() {
        let response: ApiResponse = serde_json::from_value(serde_json::json!({
            "error": { "message": "invalid token", "code": 190 }
        }))
        .unwrap();

        let error = response.error.unwrap();
        assert_eq!(error.code, 190);
        assert_eq!(error.message, "invalid token");
    }
}
