//! Realtime relay WebSocket handler
//!
//! Sockets register with the hub on connect and authenticate in-band
//! with an `authenticate` event; the upgrade itself is unauthenticated.
//! Outbound events flow through the hub's per-connection channel so
//! pipeline pushes and protocol replies share one writer.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    Extension,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zentalk_realtime::{ClientEvent, RealtimeHub, ServerEvent};

/// WebSocket upgrade handler
pub async fn relay_handler(
    ws: WebSocketUpgrade,
    Extension(hub): Extension<Arc<RealtimeHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Drive one connection until it closes
async fn handle_socket(socket: WebSocket, hub: Arc<RealtimeHub>) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let connection_id = hub.register(tx.clone()).await;
    info!(%connection_id, "WebSocket connection established");

    if tx.send(ServerEvent::Connected { connection_id }).is_err() {
        hub.disconnect(connection_id).await;
        return;
    }

    loop {
        tokio::select! {
            // Events pushed by the hub or queued protocol replies
            event = rx.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%connection_id, error = %e, "Failed to encode event"),
                }
            }

            // Frames from the client
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => handle_event(&hub, connection_id, event).await,
                            Err(e) => {
                                debug!(%connection_id, error = %e, "Unparseable client event");
                                ServerEvent::Error {
                                    message: format!("invalid event: {}", e),
                                    code: Some("BAD_EVENT".to_string()),
                                }
                            }
                        };
                        if tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%connection_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(connection_id).await;
    info!(%connection_id, "WebSocket connection closed");
}

/// Dispatch one client event against the hub
async fn handle_event(
    hub: &RealtimeHub,
    connection_id: Uuid,
    event: ClientEvent,
) -> ServerEvent {
    match event {
        ClientEvent::Authenticate { token, user_id } => {
            match hub.authenticate(connection_id, &token, user_id).await {
                Ok(()) => ServerEvent::Authenticated { user_id },
                Err(e) => error_event(e),
            }
        }
        ClientEvent::SubscribeConversation { conversation_id } => {
            match hub.subscribe(connection_id, conversation_id).await {
                Ok(()) => ServerEvent::Subscribed { conversation_id },
                Err(e) => error_event(e),
            }
        }
        ClientEvent::UnsubscribeConversation { conversation_id } => {
            match hub.unsubscribe(connection_id, conversation_id).await {
                Ok(()) => ServerEvent::Unsubscribed { conversation_id },
                Err(e) => error_event(e),
            }
        }
        ClientEvent::Ping => ServerEvent::Pong,
    }
}

fn error_event(err: zentalk_core::Error) -> ServerEvent {
    let code = match &err {
        zentalk_core::Error::Unauthorized(_) => "UNAUTHORIZED",
        zentalk_core::Error::NotFound(_) => "NOT_FOUND",
        _ => "INTERNAL_ERROR",
    };
    ServerEvent::Error {
        message: err.to_string(),
        code: Some(code.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zentalk_core::AuthStore;

    async fn registered_connection(hub: &RealtimeHub) -> Uuid {
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.register(tx).await
    }

    #[tokio::test]
    async fn test_authenticate_event_binds_user() {
        let auth = Arc::new(AuthStore::new());
        let (token, _) = auth.issue_token(7, "ws test").unwrap();
        let hub = RealtimeHub::new(auth);
        let connection_id = registered_connection(&hub).await;

        let reply = handle_event(
            &hub,
            connection_id,
            ClientEvent::Authenticate { token, user_id: 7 },
        )
        .await;
        assert!(matches!(reply, ServerEvent::Authenticated { user_id: 7 }));
    }

    #[tokio::test]
    async fn test_subscribe_before_authenticate_yields_error() {
        let hub = RealtimeHub::new(Arc::new(AuthStore::new()));
        let connection_id = registered_connection(&hub).await;

        let reply = handle_event(
            &hub,
            connection_id,
            ClientEvent::SubscribeConversation { conversation_id: 3 },
        )
        .await;
        match reply {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code.as_deref(), Some("UNAUTHORIZED"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_yields_pong() {
        let hub = RealtimeHub::new(Arc::new(AuthStore::new()));
        let connection_id = registered_connection(&hub).await;

        let reply = handle_event(&hub, connection_id, ClientEvent::Ping).await;
        assert!(matches!(reply, ServerEvent::Pong));
    }
}
