//! zentalk-realtime - Push updates for the ZenTalk dashboard
//!
//! This crate provides:
//! - Protocol: the tagged JSON wire format for the dashboard WebSocket
//! - Hub: connection registry with per-user and per-conversation fan-out

#![forbid(unsafe_code)]

pub mod hub;
pub mod protocol;

pub use hub::RealtimeHub;
pub use protocol::{ClientEvent, ServerEvent};
