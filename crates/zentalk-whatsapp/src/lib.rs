//! zentalk-whatsapp - WhatsApp Business relay for ZenTalk
//!
//! This crate provides:
//! - Webhook: payload types, challenge handshake and token verification
//! - Client: outbound send against the Business Cloud API
//! - Pipeline: ingestion of inbound events with detached auto-reply

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod pipeline;
pub mod webhook;

pub use client::{WhatsAppApi, WhatsAppClient};
pub use error::{Error, Result};
pub use pipeline::IngestPipeline;
pub use webhook::{
    mask_for_logging, token_matches, verify_challenge, InboundMessage, StatusUpdate, VerifyQuery,
    WebhookPayload,
};
