//! zentalk-core - Domain model and shared infrastructure for the ZenTalk relay
//!
//! This crate holds the pieces every other crate depends on: the error
//! taxonomy, the persistent entity types, and the in-memory session token
//! store used by the HTTP and WebSocket surfaces.

#![forbid(unsafe_code)]

pub mod auth;
pub mod error;
pub mod models;

pub use auth::{AuthContext, AuthError, AuthStore};
pub use error::{Error, Result};
pub use models::{
    Agent, AgentStatus, Client, Conversation, ConversationStatus, DeliveryStatus, Message,
    MessageSender, MessageType, WebhookLog, WebhookLogStatus, WhatsAppAccount,
    WhatsAppAccountStatus,
};
