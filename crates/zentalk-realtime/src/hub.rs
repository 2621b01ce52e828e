//! Connection hub
//!
//! Tracks live WebSocket connections, which user each one belongs to and
//! which conversations it watches. Producers push [`ServerEvent`]s through
//! the hub; delivery to a user with no open connections is a silent no-op.

use crate::protocol::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zentalk_core::{AgentStatus, AuthStore, Conversation, Error, Message, Result};

/// Per-connection state
struct ConnectionHandle {
    /// Set once the connection has authenticated
    user_id: Option<i64>,
    /// Conversations this connection watches
    subscriptions: HashSet<i64>,
    /// Push channel drained by the socket task
    sender: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<Uuid, ConnectionHandle>,
    user_connections: HashMap<i64, HashSet<Uuid>>,
    conversation_subscriptions: HashMap<i64, HashSet<Uuid>>,
}

/// Fan-out hub for dashboard push updates
pub struct RealtimeHub {
    auth: Arc<AuthStore>,
    state: RwLock<HubState>,
}

impl RealtimeHub {
    /// Create a new hub validating tokens against the given store
    pub fn new(auth: Arc<AuthStore>) -> Self {
        Self {
            auth,
            state: RwLock::new(HubState::default()),
        }
    }

    /// Register a new connection and get its id.
    ///
    /// The caller keeps the receiving half of the channel and forwards
    /// events to the socket.
    pub async fn register(&self, sender: mpsc::UnboundedSender<ServerEvent>) -> Uuid {
        let connection_id = Uuid::new_v4();
        let mut state = self.state.write().await;
        state.connections.insert(
            connection_id,
            ConnectionHandle {
                user_id: None,
                subscriptions: HashSet::new(),
                sender,
            },
        );
        info!(%connection_id, "Connection registered");
        connection_id
    }

    /// Bind a connection to a user.
    ///
    /// The token is validated server-side and must belong to the user the
    /// client asserts; a client cannot listen in on another user's
    /// notifications by claiming their id.
    #[instrument(skip(self, token))]
    pub async fn authenticate(
        &self,
        connection_id: Uuid,
        token: &str,
        asserted_user_id: i64,
    ) -> Result<()> {
        let ctx = self
            .auth
            .validate_token(token)
            .map_err(|e| Error::Unauthorized(e.to_string()))?;

        if ctx.user_id != asserted_user_id {
            warn!(
                token_user = ctx.user_id,
                asserted_user = asserted_user_id,
                "Token does not match asserted user"
            );
            return Err(Error::Unauthorized(
                "token does not belong to the asserted user".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        let handle = state
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;

        handle.user_id = Some(ctx.user_id);
        state
            .user_connections
            .entry(ctx.user_id)
            .or_default()
            .insert(connection_id);

        debug!(user_id = ctx.user_id, "Connection authenticated");
        Ok(())
    }

    /// Subscribe an authenticated connection to a conversation
    #[instrument(skip(self))]
    pub async fn subscribe(&self, connection_id: Uuid, conversation_id: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let handle = state
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;

        if handle.user_id.is_none() {
            return Err(Error::Unauthorized(
                "authenticate before subscribing".to_string(),
            ));
        }

        handle.subscriptions.insert(conversation_id);
        state
            .conversation_subscriptions
            .entry(conversation_id)
            .or_default()
            .insert(connection_id);

        debug!("Subscribed to conversation {}", conversation_id);
        Ok(())
    }

    /// Drop a connection's subscription to a conversation
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, connection_id: Uuid, conversation_id: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let handle = state
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;

        handle.subscriptions.remove(&conversation_id);
        if let Some(subscribers) = state.conversation_subscriptions.get_mut(&conversation_id) {
            subscribers.remove(&connection_id);
            if subscribers.is_empty() {
                state.conversation_subscriptions.remove(&conversation_id);
            }
        }

        Ok(())
    }

    /// Remove a connection from every map. Called when the socket closes.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, connection_id: Uuid) {
        let mut state = self.state.write().await;
        let Some(handle) = state.connections.remove(&connection_id) else {
            return;
        };

        if let Some(user_id) = handle.user_id {
            if let Some(connections) = state.user_connections.get_mut(&user_id) {
                connections.remove(&connection_id);
                if connections.is_empty() {
                    state.user_connections.remove(&user_id);
                }
            }
        }

        for conversation_id in handle.subscriptions {
            if let Some(subscribers) = state.conversation_subscriptions.get_mut(&conversation_id) {
                subscribers.remove(&connection_id);
                if subscribers.is_empty() {
                    state.conversation_subscriptions.remove(&conversation_id);
                }
            }
        }

        info!(%connection_id, "Connection removed");
    }

    /// Push an event to every connection of a user.
    ///
    /// Returns how many connections received it; zero is fine.
    pub async fn notify_user(&self, user_id: i64, event: ServerEvent) -> usize {
        let targets: Vec<Uuid> = {
            let state = self.state.read().await;
            state
                .user_connections
                .get(&user_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        };
        self.deliver(&targets, event).await
    }

    /// Push an event to every subscriber of a conversation
    pub async fn notify_conversation(&self, conversation_id: i64, event: ServerEvent) -> usize {
        let targets: Vec<Uuid> = {
            let state = self.state.read().await;
            state
                .conversation_subscriptions
                .get(&conversation_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        };
        self.deliver(&targets, event).await
    }

    /// Push an event to every live connection
    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        let targets: Vec<Uuid> = {
            let state = self.state.read().await;
            state.connections.keys().copied().collect()
        };
        self.deliver(&targets, event).await
    }

    /// Announce a stored message to the conversation's subscribers
    pub async fn notify_new_message(&self, message: &Message) -> usize {
        self.notify_conversation(
            message.conversation_id,
            ServerEvent::NewMessage {
                conversation_id: message.conversation_id,
                message: message.clone(),
            },
        )
        .await
    }

    /// Announce new conversation counters to the conversation's subscribers
    pub async fn notify_conversation_update(&self, conversation: &Conversation) -> usize {
        self.notify_conversation(
            conversation.id,
            ServerEvent::ConversationUpdate {
                conversation_id: conversation.id,
                message_count: conversation.message_count,
                last_message_at: conversation.last_message_at,
            },
        )
        .await
    }

    /// Announce an agent presence change to every live connection
    pub async fn notify_agent_status(&self, agent_id: i64, status: AgentStatus) -> usize {
        self.broadcast(ServerEvent::AgentStatusChange {
            agent_id,
            status,
            timestamp: chrono::Utc::now(),
        })
        .await
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    async fn deliver(&self, targets: &[Uuid], event: ServerEvent) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();

        {
            let state = self.state.read().await;
            for connection_id in targets {
                let Some(handle) = state.connections.get(connection_id) else {
                    continue;
                };
                if handle.sender.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    stale.push(*connection_id);
                }
            }
        }

        // A closed channel means the socket task is gone.
        for connection_id in stale {
            warn!(%connection_id, "Dropping connection with closed channel");
            self.disconnect(connection_id).await;
        }

        delivered
    }
}
