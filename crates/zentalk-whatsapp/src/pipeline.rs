//! Webhook ingestion pipeline
//!
//! One inbound event runs through five steps: audit-log the raw payload,
//! resolve or open the conversation, store the message (skipping
//! provider redeliveries), bump the conversation counters, then hand the
//! auto-reply to a detached task so the webhook can answer immediately.

use crate::client::WhatsAppApi;
use crate::error::{Error, Result};
use crate::webhook::{mask_for_logging, InboundMessage, WebhookPayload};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use zentalk_core::{
    Conversation, DeliveryStatus, Message, MessageSender, MessageType, WebhookLogStatus,
    WhatsAppAccount,
};
use zentalk_llm::{ReplyGenerator, HISTORY_TURNS};
use zentalk_realtime::RealtimeHub;
use zentalk_store::{NewConversation, NewMessage, RelayStore};

/// Processes webhook events for one relay instance
#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn RelayStore>,
    generator: Arc<ReplyGenerator>,
    api: Arc<dyn WhatsAppApi>,
    hub: Arc<RealtimeHub>,
}

impl IngestPipeline {
    /// Create a new pipeline
    pub fn new(
        store: Arc<dyn RelayStore>,
        generator: Arc<ReplyGenerator>,
        api: Arc<dyn WhatsAppApi>,
        hub: Arc<RealtimeHub>,
    ) -> Self {
        Self {
            store,
            generator,
            api,
            hub,
        }
    }

    /// Process one webhook event for an account.
    ///
    /// `raw` is the payload exactly as the provider delivered it; it is
    /// logged before anything else, so even events that later fail leave
    /// an audit trail fit for replay.
    #[instrument(skip(self, account, raw, payload), fields(account_id = account.id))]
    pub async fn process_event(
        &self,
        account: &WhatsAppAccount,
        raw: serde_json::Value,
        payload: WebhookPayload,
    ) -> Result<()> {
        let log_id = self
            .store
            .append_webhook_log(account.id, payload.event_type(), raw)
            .await?;

        match self.apply(account, &payload).await {
            Ok(()) => {
                self.store
                    .set_webhook_log_status(log_id, WebhookLogStatus::Processed)
                    .await?;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, log_id, "Webhook processing failed");
                if let Err(log_err) = self
                    .store
                    .set_webhook_log_status(log_id, WebhookLogStatus::Failed)
                    .await
                {
                    warn!(error = %log_err, log_id, "Failed to mark webhook log");
                }
                Err(e)
            }
        }
    }

    /// Apply every message and status update in the payload.
    ///
    /// Each message carries its own error boundary: a failure on one is
    /// logged and remembered for the webhook-log outcome, but never stops
    /// its siblings from being processed.
    async fn apply(&self, account: &WhatsAppAccount, payload: &WebhookPayload) -> Result<()> {
        let mut first_error: Option<Error> = None;

        for status in payload.status_updates() {
            match status.delivery_status() {
                Some(delivery) => {
                    match self.store.update_message_status(&status.id, delivery).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(provider_message_id = %status.id, "Receipt for unknown message");
                        }
                        Err(e) => {
                            warn!(provider_message_id = %status.id, error = %e, "Failed to apply receipt");
                            first_error.get_or_insert(e.into());
                        }
                    }
                }
                None => {
                    debug!(status = %status.status, "Unrecognized delivery status");
                }
            }
        }

        for (sender_name, inbound) in payload.text_messages() {
            if let Err(e) = self.ingest_message(account, sender_name, inbound).await {
                warn!(
                    provider_message_id = %inbound.id,
                    error = %e,
                    "Failed to ingest message, continuing with siblings"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run one inbound message through conversation resolution, storage
    /// and the detached auto-reply
    async fn ingest_message(
        &self,
        account: &WhatsAppAccount,
        sender_name: Option<String>,
        inbound: &InboundMessage,
    ) -> Result<()> {
        let Some(body) = inbound.text.as_ref().map(|t| t.body.as_str()) else {
            return Ok(());
        };
        if body.is_empty() {
            return Ok(());
        }

        info!(
            from = %inbound.from,
            text = %mask_for_logging(body),
            "Received WhatsApp message"
        );

        let conversation = self
            .resolve_conversation(account, &inbound.from, sender_name)
            .await?;

        let stored = self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                provider_message_id: inbound.id.clone(),
                sender: MessageSender::User,
                content: body.to_string(),
                message_type: MessageType::Text,
                status: DeliveryStatus::Delivered,
            })
            .await?;

        let Some(stored) = stored else {
            info!(provider_message_id = %inbound.id, "Redelivered message ignored");
            return Ok(());
        };

        self.store
            .touch_conversation(conversation.id, inbound.timestamp_utc())
            .await?;

        self.hub.notify_new_message(&stored).await;
        self.push_conversation_update(conversation.id).await;

        // The provider expects its 200 quickly; reply generation can
        // take seconds, so it runs detached.
        let pipeline = self.clone();
        let account = account.clone();
        let inbound_id = inbound.id.clone();
        let inbound_text = body.to_string();
        tokio::spawn(async move {
            pipeline
                .send_reply(&account, &conversation, &inbound_id, &inbound_text)
                .await;
        });

        Ok(())
    }

    async fn resolve_conversation(
        &self,
        account: &WhatsAppAccount,
        contact_phone_number: &str,
        contact_name: Option<String>,
    ) -> Result<Conversation> {
        if let Some(conversation) = self
            .store
            .find_active_conversation(account.id, contact_phone_number)
            .await?
        {
            return Ok(conversation);
        }

        let agent = self.store.least_loaded_agent(account.client_id).await?;
        let conversation = self
            .store
            .create_conversation(NewConversation {
                whatsapp_account_id: account.id,
                agent_id: agent.id,
                contact_phone_number: contact_phone_number.to_string(),
                contact_name,
            })
            .await?;

        info!(
            conversation_id = conversation.id,
            agent_id = agent.id,
            "Opened conversation"
        );
        Ok(conversation)
    }

    /// Re-read the conversation and push its counters to subscribers
    async fn push_conversation_update(&self, conversation_id: i64) {
        match self.store.get_conversation(conversation_id).await {
            Ok(updated) => {
                self.hub.notify_conversation_update(&updated).await;
            }
            Err(e) => {
                warn!(error = %e, conversation_id, "Cannot load conversation for push");
            }
        }
    }

    /// Generate and send the agent's reply to an inbound message.
    ///
    /// Runs detached from the webhook request. The send is at-most-once:
    /// any failure is logged, nothing is stored, and `None` comes back.
    #[instrument(skip(self, account, conversation, inbound_text), fields(conversation_id = conversation.id))]
    pub async fn send_reply(
        &self,
        account: &WhatsAppAccount,
        conversation: &Conversation,
        inbound_id: &str,
        inbound_text: &str,
    ) -> Option<Message> {
        let agent = match self.store.get_agent(conversation.agent_id).await {
            Ok(agent) => agent,
            Err(e) => {
                warn!(error = %e, "Cannot load agent for reply");
                return None;
            }
        };

        // The inbound message is already stored; keep it out of the
        // history so the prompt does not carry it twice.
        let mut history = match self
            .store
            .recent_messages(conversation.id, (HISTORY_TURNS + 1) as i64)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "Cannot load history for reply");
                Vec::new()
            }
        };
        if history
            .last()
            .is_some_and(|m| m.provider_message_id == inbound_id)
        {
            history.pop();
        }

        let reply = self.generator.generate(&agent, &history, inbound_text).await;

        let provider_id = match self
            .api
            .send_text(account, &conversation.contact_phone_number, &reply)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Outbound send failed, dropping reply");
                return None;
            }
        };

        let stored = match self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                provider_message_id: provider_id,
                sender: MessageSender::Agent,
                content: reply,
                message_type: MessageType::Text,
                status: DeliveryStatus::Sent,
            })
            .await
        {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!("Provider returned an already-stored message id");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to store outbound message");
                return None;
            }
        };

        if let Err(e) = self
            .store
            .touch_conversation(conversation.id, Utc::now())
            .await
        {
            warn!(error = %e, "Failed to bump conversation after reply");
        }

        self.hub.notify_new_message(&stored).await;
        self.push_conversation_update(conversation.id).await;
        Some(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WhatsAppApi;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use zentalk_core::{Agent, AgentStatus, AuthStore, Client};
    use zentalk_llm::{CompletionBackend, CompletionRequest, CompletionResponse};
    use zentalk_store::{NewAccount, NewConversation, NewMessage};

    // ------------------------------------------------------------------
    // In-memory store
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MemState {
        agents: Vec<Agent>,
        conversations: Vec<Conversation>,
        messages: Vec<Message>,
        webhook_logs: Vec<(i64, String, WebhookLogStatus, serde_json::Value)>,
        next_id: i64,
    }

    #[derive(Default)]
    struct MemStore {
        state: Mutex<MemState>,
        /// Provider message id whose insert is refused, for failure tests
        fail_insert_for: Mutex<Option<String>>,
    }

    impl MemStore {
        fn with_agent() -> Self {
            let store = Self::default();
            {
                let mut state = store.state.lock().unwrap();
                state.agents.push(Agent {
                    id: 1,
                    client_id: 1,
                    name: "Maya".to_string(),
                    agent_type: "gpt-4o-mini".to_string(),
                    status: AgentStatus::Online,
                    created_at: Utc::now(),
                });
                state.next_id = 100;
            }
            store
        }

        fn messages(&self) -> Vec<Message> {
            self.state.lock().unwrap().messages.clone()
        }

        fn conversations(&self) -> Vec<Conversation> {
            self.state.lock().unwrap().conversations.clone()
        }

        fn webhook_logs(&self) -> Vec<(i64, String, WebhookLogStatus, serde_json::Value)> {
            self.state.lock().unwrap().webhook_logs.clone()
        }
    }

    fn unsupported<T>() -> zentalk_store::Result<T> {
        Err(zentalk_store::Error::Database(
            "unsupported in test store".to_string(),
        ))
    }

    #[async_trait::async_trait]
    impl RelayStore for MemStore {
        async fn get_client(&self, _id: i64) -> zentalk_store::Result<Client> {
            unsupported()
        }

        async fn get_agent(&self, id: i64) -> zentalk_store::Result<Agent> {
            self.state
                .lock()
                .unwrap()
                .agents
                .iter()
                .find(|a| a.id == id)
                .cloned()
                .ok_or_else(|| zentalk_store::Error::NotFound(format!("agent {}", id)))
        }

        async fn least_loaded_agent(&self, client_id: i64) -> zentalk_store::Result<Agent> {
            let state = self.state.lock().unwrap();
            let mut agents: Vec<_> = state
                .agents
                .iter()
                .filter(|a| a.client_id == client_id)
                .collect();
            agents.sort_by_key(|a| {
                let load = state
                    .conversations
                    .iter()
                    .filter(|c| c.agent_id == a.id)
                    .count();
                (load, a.id)
            });
            agents.first().map(|a| (*a).clone()).ok_or_else(|| {
                zentalk_store::Error::NotFound(format!("no agents for client {}", client_id))
            })
        }

        async fn update_agent_status(
            &self,
            _id: i64,
            _status: AgentStatus,
        ) -> zentalk_store::Result<Agent> {
            unsupported()
        }

        async fn create_account(
            &self,
            _new: NewAccount,
        ) -> zentalk_store::Result<WhatsAppAccount> {
            unsupported()
        }

        async fn get_account(&self, _id: i64) -> zentalk_store::Result<WhatsAppAccount> {
            unsupported()
        }

        async fn list_accounts_for_user(
            &self,
            _user_id: i64,
        ) -> zentalk_store::Result<Vec<WhatsAppAccount>> {
            unsupported()
        }

        async fn rotate_account_credentials(
            &self,
            _id: i64,
            _access_token: &str,
            _webhook_token: &str,
        ) -> zentalk_store::Result<WhatsAppAccount> {
            unsupported()
        }

        async fn find_active_conversation(
            &self,
            whatsapp_account_id: i64,
            contact_phone_number: &str,
        ) -> zentalk_store::Result<Option<Conversation>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .conversations
                .iter()
                .find(|c| {
                    c.whatsapp_account_id == whatsapp_account_id
                        && c.contact_phone_number == contact_phone_number
                })
                .cloned())
        }

        async fn create_conversation(
            &self,
            new: NewConversation,
        ) -> zentalk_store::Result<Conversation> {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let conversation = Conversation {
                id: state.next_id,
                whatsapp_account_id: new.whatsapp_account_id,
                agent_id: new.agent_id,
                contact_phone_number: new.contact_phone_number,
                contact_name: new.contact_name,
                status: zentalk_core::ConversationStatus::Active,
                message_count: 0,
                last_message_at: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            state.conversations.push(conversation.clone());
            Ok(conversation)
        }

        async fn get_conversation(&self, id: i64) -> zentalk_store::Result<Conversation> {
            self.state
                .lock()
                .unwrap()
                .conversations
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| zentalk_store::Error::NotFound(format!("conversation {}", id)))
        }

        async fn list_conversations(
            &self,
            _whatsapp_account_id: i64,
            _limit: i64,
            _offset: i64,
        ) -> zentalk_store::Result<Vec<Conversation>> {
            unsupported()
        }

        async fn touch_conversation(
            &self,
            id: i64,
            last_message_at: DateTime<Utc>,
        ) -> zentalk_store::Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(conversation) = state.conversations.iter_mut().find(|c| c.id == id) {
                conversation.message_count += 1;
                conversation.last_message_at = Some(last_message_at);
            }
            Ok(())
        }

        async fn insert_message(
            &self,
            new: NewMessage,
        ) -> zentalk_store::Result<Option<Message>> {
            if self.fail_insert_for.lock().unwrap().as_deref()
                == Some(new.provider_message_id.as_str())
            {
                return Err(zentalk_store::Error::Database("insert refused".to_string()));
            }
            let mut state = self.state.lock().unwrap();
            if state
                .messages
                .iter()
                .any(|m| m.provider_message_id == new.provider_message_id)
            {
                return Ok(None);
            }
            state.next_id += 1;
            let message = Message {
                id: state.next_id,
                conversation_id: new.conversation_id,
                provider_message_id: new.provider_message_id,
                sender: new.sender,
                content: new.content,
                message_type: new.message_type,
                status: new.status,
                created_at: Utc::now(),
            };
            state.messages.push(message.clone());
            Ok(Some(message))
        }

        async fn recent_messages(
            &self,
            conversation_id: i64,
            limit: i64,
        ) -> zentalk_store::Result<Vec<Message>> {
            let state = self.state.lock().unwrap();
            let mut messages: Vec<_> = state
                .messages
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .cloned()
                .collect();
            messages.sort_by_key(|m| m.id);
            let skip = messages.len().saturating_sub(limit as usize);
            Ok(messages.into_iter().skip(skip).collect())
        }

        async fn list_messages(
            &self,
            _conversation_id: i64,
            _limit: i64,
            _offset: i64,
        ) -> zentalk_store::Result<Vec<Message>> {
            unsupported()
        }

        async fn update_message_status(
            &self,
            provider_message_id: &str,
            status: DeliveryStatus,
        ) -> zentalk_store::Result<bool> {
            let mut state = self.state.lock().unwrap();
            match state
                .messages
                .iter_mut()
                .find(|m| m.provider_message_id == provider_message_id)
            {
                Some(message) => {
                    message.status = status;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn append_webhook_log(
            &self,
            _whatsapp_account_id: i64,
            event_type: &str,
            payload: serde_json::Value,
        ) -> zentalk_store::Result<i64> {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = state.next_id;
            state
                .webhook_logs
                .push((id, event_type.to_string(), WebhookLogStatus::Pending, payload));
            Ok(id)
        }

        async fn set_webhook_log_status(
            &self,
            id: i64,
            status: WebhookLogStatus,
        ) -> zentalk_store::Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state
                .webhook_logs
                .iter_mut()
                .find(|(log_id, _, _, _)| *log_id == id)
            {
                entry.2 = status;
            }
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Stubs
    // ------------------------------------------------------------------

    struct StubApi {
        fail: AtomicBool,
        counter: AtomicU64,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl StubApi {
        fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
                counter: AtomicU64::new(0),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            let api = Self::new();
            api.fail.store(true, Ordering::SeqCst);
            api
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl WhatsAppApi for StubApi {
        async fn send_text(
            &self,
            _account: &WhatsAppAccount,
            to: &str,
            body: &str,
        ) -> crate::error::Result<String> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(crate::error::Error::Api("send refused".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), body.to_string()));
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("wamid.out-{}", n))
        }
    }

    struct EchoBackend;

    #[async_trait::async_trait]
    impl CompletionBackend for EchoBackend {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> zentalk_llm::Result<CompletionResponse> {
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(CompletionResponse {
                content: format!("echo: {}", last),
                model: request.model,
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn test_account() -> WhatsAppAccount {
        WhatsAppAccount {
            id: 1,
            client_id: 1,
            phone_number: "+15550001111".to_string(),
            business_account_id: "pn-1".to_string(),
            access_token: "access".to_string(),
            webhook_token: "hook".to_string(),
            status: zentalk_core::WhatsAppAccountStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn message_value(message_id: &str, body: &str) -> serde_json::Value {
        serde_json::json!({
            "from": "15550002222",
            "id": message_id,
            "timestamp": "1700000000",
            "type": "text",
            "text": { "body": body }
        })
    }

    fn payload_with_messages(messages: Vec<serde_json::Value>) -> serde_json::Value {
        serde_json::json!({
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
                        "messages": messages
                    }
                }]
            }]
        })
    }

    fn text_payload(message_id: &str, body: &str) -> serde_json::Value {
        payload_with_messages(vec![message_value(message_id, body)])
    }

    async fn process(
        pipeline: &IngestPipeline,
        account: &WhatsAppAccount,
        raw: serde_json::Value,
    ) -> crate::error::Result<()> {
        let payload: WebhookPayload = serde_json::from_value(raw.clone()).unwrap();
        pipeline.process_event(account, raw, payload).await
    }

    fn build_pipeline(
        store: Arc<MemStore>,
        api: Arc<StubApi>,
    ) -> IngestPipeline {
        let generator = Arc::new(ReplyGenerator::new(Arc::new(EchoBackend)));
        let hub = Arc::new(RealtimeHub::new(Arc::new(AuthStore::new())));
        IngestPipeline::new(store, generator, api, hub)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_inbound_message_is_stored_and_answered() {
        let store = Arc::new(MemStore::with_agent());
        let api = Arc::new(StubApi::new());
        let pipeline = build_pipeline(store.clone(), api.clone());

        process(&pipeline, &test_account(), text_payload("wamid.1", "hello"))
            .await
            .unwrap();

        let conversations = store.conversations();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].agent_id, 1);
        assert_eq!(conversations[0].contact_name.as_deref(), Some("Ana"));

        let user_messages: Vec<_> = store
            .messages()
            .into_iter()
            .filter(|m| m.sender == MessageSender::User)
            .collect();
        assert_eq!(user_messages.len(), 1);
        assert_eq!(user_messages[0].content, "hello");
        assert_eq!(user_messages[0].status, DeliveryStatus::Delivered);

        // Reply runs detached; wait for it to land.
        let probe = store.clone();
        wait_for(move || probe.messages().len() == 2).await;

        let reply = store
            .messages()
            .into_iter()
            .find(|m| m.sender == MessageSender::Agent)
            .unwrap();
        assert_eq!(reply.content, "echo: hello");
        assert_eq!(reply.status, DeliveryStatus::Sent);
        assert_eq!(api.sent(), vec![("15550002222".to_string(), "echo: hello".to_string())]);

        let probe = store.clone();
        wait_for(move || probe.conversations()[0].message_count == 2).await;

        let logs = store.webhook_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].1, "messages");
        assert_eq!(logs[0].2, WebhookLogStatus::Processed);
    }

    #[tokio::test]
    async fn test_redelivered_webhook_stores_nothing_new() {
        let store = Arc::new(MemStore::with_agent());
        let api = Arc::new(StubApi::new());
        let pipeline = build_pipeline(store.clone(), api.clone());
        let account = test_account();

        process(&pipeline, &account, text_payload("wamid.1", "hello"))
            .await
            .unwrap();
        let probe = store.clone();
        wait_for(move || probe.messages().len() == 2).await;

        process(&pipeline, &account, text_payload("wamid.1", "hello"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let user_messages = store
            .messages()
            .into_iter()
            .filter(|m| m.sender == MessageSender::User)
            .count();
        assert_eq!(user_messages, 1);
        // No second reply either.
        assert_eq!(api.sent().len(), 1);
        // Count bumped once per stored message, not per delivery.
        assert_eq!(store.conversations()[0].message_count, 2);
    }

    #[tokio::test]
    async fn test_same_contact_reuses_conversation() {
        let store = Arc::new(MemStore::with_agent());
        let api = Arc::new(StubApi::new());
        let pipeline = build_pipeline(store.clone(), api.clone());
        let account = test_account();

        process(&pipeline, &account, text_payload("wamid.1", "first"))
            .await
            .unwrap();
        process(&pipeline, &account, text_payload("wamid.2", "second"))
            .await
            .unwrap();

        assert_eq!(store.conversations().len(), 1);
        let user_messages = store
            .messages()
            .into_iter()
            .filter(|m| m.sender == MessageSender::User)
            .count();
        assert_eq!(user_messages, 2);
    }

    #[tokio::test]
    async fn test_send_failure_stores_no_outbound_message() {
        let store = Arc::new(MemStore::with_agent());
        let api = Arc::new(StubApi::failing());
        let pipeline = build_pipeline(store.clone(), api.clone());
        let account = test_account();

        let conversation = store
            .create_conversation(NewConversation {
                whatsapp_account_id: account.id,
                agent_id: 1,
                contact_phone_number: "15550002222".to_string(),
                contact_name: None,
            })
            .await
            .unwrap();

        let result = pipeline
            .send_reply(&account, &conversation, "wamid.1", "hello")
            .await;

        assert!(result.is_none());
        assert!(store.messages().is_empty());
        assert_eq!(store.conversations()[0].message_count, 0);
    }

    #[tokio::test]
    async fn test_delivery_receipt_updates_message_status() {
        let store = Arc::new(MemStore::with_agent());
        let api = Arc::new(StubApi::new());
        let pipeline = build_pipeline(store.clone(), api.clone());
        let account = test_account();

        let conversation = store
            .create_conversation(NewConversation {
                whatsapp_account_id: account.id,
                agent_id: 1,
                contact_phone_number: "15550002222".to_string(),
                contact_name: None,
            })
            .await
            .unwrap();
        store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                provider_message_id: "wamid.out".to_string(),
                sender: MessageSender::Agent,
                content: "hi".to_string(),
                message_type: MessageType::Text,
                status: DeliveryStatus::Sent,
            })
            .await
            .unwrap();

        let raw = serde_json::json!({
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
                            "id": "wamid.out",
                            "status": "read",
                            "timestamp": "1700000100",
                            "recipient_id": "15550002222"
                        }]
                    }
                }]
            }]
        });

        process(&pipeline, &account, raw).await.unwrap();

        assert_eq!(store.messages()[0].status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn test_one_failing_message_does_not_drop_siblings() {
        let store = Arc::new(MemStore::with_agent());
        *store.fail_insert_for.lock().unwrap() = Some("wamid.1".to_string());
        let api = Arc::new(StubApi::new());
        let pipeline = build_pipeline(store.clone(), api.clone());
        let account = test_account();

        let raw = payload_with_messages(vec![
            message_value("wamid.1", "first"),
            message_value("wamid.2", "second"),
        ]);
        let result = process(&pipeline, &account, raw).await;
        assert!(result.is_err());

        // The second message survives its sibling's failure.
        let user_messages: Vec<_> = store
            .messages()
            .into_iter()
            .filter(|m| m.sender == MessageSender::User)
            .collect();
        assert_eq!(user_messages.len(), 1);
        assert_eq!(user_messages[0].content, "second");

        // The event still lands in the audit trail, marked failed.
        let logs = store.webhook_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].2, WebhookLogStatus::Failed);
    }

    #[tokio::test]
    async fn test_audit_log_keeps_unmodeled_provider_fields() {
        let store = Arc::new(MemStore::with_agent());
        let api = Arc::new(StubApi::new());
        let pipeline = build_pipeline(store.clone(), api.clone());
        let account = test_account();

        // A field the payload types do not model must still reach the log.
        let mut raw = text_payload("wamid.1", "hello");
        raw["entry"][0]["changes"][0]["value"]["messages"][0]["context"] =
            serde_json::json!({ "id": "wamid.prev" });

        process(&pipeline, &account, raw.clone()).await.unwrap();

        let logs = store.webhook_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].3, raw);
        assert_eq!(
            logs[0].3["entry"][0]["changes"][0]["value"]["messages"][0]["context"]["id"],
            "wamid.prev"
        );
    }
}
