//! zentalk-llm - Reply generation for the ZenTalk relay
//!
//! This crate provides:
//! - Message: chat message and completion request types
//! - Client: HTTP client for OpenAI-compatible completion endpoints
//! - Reply: persona-driven reply generation with canned fallbacks

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod message;
pub mod reply;

pub use client::{CompletionBackend, CompletionConfig, HttpCompletionClient, DEFAULT_MODEL};
pub use error::{Error, Result};
pub use message::{CompletionRequest, CompletionResponse, Message, MessageRole};
pub use reply::{ReplyGenerator, HISTORY_TURNS};
