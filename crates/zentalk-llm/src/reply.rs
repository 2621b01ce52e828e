//! Reply generation
//!
//! Turns an inbound contact message plus conversation history into the
//! agent's reply. Generation never fails: when the completion backend
//! errors out, a canned response carrying the agent's name goes out
//! instead so the contact always hears back.

use crate::client::CompletionBackend;
use crate::message::{CompletionRequest, Message};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use zentalk_core::{Agent, MessageSender};

/// How many history turns accompany the prompt
pub const HISTORY_TURNS: usize = 10;

/// Token cap for generated replies
const MAX_REPLY_TOKENS: u32 = 300;

/// Sampling temperature for replies
const REPLY_TEMPERATURE: f32 = 0.7;

/// Canned replies used when the completion backend is unavailable.
/// `{agent}` is replaced with the agent's display name.
const FALLBACK_REPLIES: &[&str] = &[
    "Hi! This is {agent}. Thanks for your message, how can I help you today?",
    "Hello, {agent} here. I got your message and I'm happy to help. What do you need?",
    "Thanks for reaching out! This is {agent}. Could you tell me a bit more about what you're looking for?",
    "Hi there, {agent} speaking. I'm here to help, what can I do for you?",
    "Hello! {agent} here. Sorry for the wait, how can I assist you?",
];

/// Generates agent replies from conversation context
pub struct ReplyGenerator {
    backend: Option<Arc<dyn CompletionBackend>>,
}

impl ReplyGenerator {
    /// Create a new generator over the given backend
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Create a generator that only produces canned replies.
    ///
    /// Used when no completion backend is configured; contacts still
    /// hear back.
    #[must_use]
    pub fn without_backend() -> Self {
        Self { backend: None }
    }

    /// Generate a reply to `inbound` on behalf of `agent`.
    ///
    /// `history` is the conversation so far, oldest first; only the last
    /// [`HISTORY_TURNS`] entries reach the prompt. Falls back to a canned
    /// reply on any backend failure.
    #[instrument(skip(self, history, inbound), fields(agent_id = agent.id))]
    pub async fn generate(
        &self,
        agent: &Agent,
        history: &[zentalk_core::Message],
        inbound: &str,
    ) -> String {
        let Some(backend) = &self.backend else {
            debug!("No completion backend configured, using fallback reply");
            return Self::fallback_reply(&agent.name);
        };

        let request = Self::build_request(agent, history, inbound);

        match backend.complete(request).await {
            Ok(response) => {
                debug!(model = %response.model, "Reply generated");
                response.content
            }
            Err(e) => {
                warn!(error = %e, backend = backend.name(), "Completion failed, using fallback reply");
                Self::fallback_reply(&agent.name)
            }
        }
    }

    fn build_request(
        agent: &Agent,
        history: &[zentalk_core::Message],
        inbound: &str,
    ) -> CompletionRequest {
        let persona = format!(
            "You are {}, a customer support agent answering over WhatsApp. \
             Be helpful, concise and friendly. Answer in the language the \
             customer writes in. Keep replies short enough for a chat message.",
            agent.name
        );

        let mut request = CompletionRequest::new(agent.agent_type.clone())
            .with_message(Message::system(persona))
            .with_max_tokens(MAX_REPLY_TOKENS)
            .with_temperature(REPLY_TEMPERATURE);

        let start = history.len().saturating_sub(HISTORY_TURNS);
        for entry in &history[start..] {
            let message = match entry.sender {
                MessageSender::User => Message::user(entry.content.clone()),
                MessageSender::Agent => Message::assistant(entry.content.clone()),
            };
            request = request.with_message(message);
        }

        request.with_message(Message::user(inbound.to_string()))
    }

    fn fallback_reply(agent_name: &str) -> String {
        let template = FALLBACK_REPLIES
            .choose(&mut rand::thread_rng())
            .unwrap_or(&FALLBACK_REPLIES[0]);
        template.replace("{agent}", agent_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::message::CompletionResponse;
    use chrono::Utc;
    use zentalk_core::{AgentStatus, DeliveryStatus, MessageType};

    struct CannedBackend {
        reply: Option<String>,
    }

    #[async_trait::async_trait]
    impl CompletionBackend for CannedBackend {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            match &self.reply {
                Some(reply) => Ok(CompletionResponse {
                    content: reply.clone(),
                    model: request.model,
                }),
                None => Err(Error::Api("backend down".to_string())),
            }
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    fn test_agent() -> Agent {
        Agent {
            id: 1,
            client_id: 1,
            name: "Maya".to_string(),
            agent_type: "gpt-4o-mini".to_string(),
            status: AgentStatus::Online,
            created_at: Utc::now(),
        }
    }

    fn stored_message(sender: MessageSender, content: &str) -> zentalk_core::Message {
        zentalk_core::Message {
            id: 0,
            conversation_id: 1,
            provider_message_id: format!("wamid.{}", content.len()),
            sender,
            content: content.to_string(),
            message_type: MessageType::Text,
            status: DeliveryStatus::Delivered,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_generate_uses_backend_reply() {
        let generator = ReplyGenerator::new(Arc::new(CannedBackend {
            reply: Some("Sure, I can help with that.".to_string()),
        }));

        let reply = generator.generate(&test_agent(), &[], "Can you help?").await;
        assert_eq!(reply, "Sure, I can help with that.");
    }

    #[tokio::test]
    async fn test_backend_failure_falls_back_to_canned_reply() {
        let generator = ReplyGenerator::new(Arc::new(CannedBackend { reply: None }));

        let reply = generator.generate(&test_agent(), &[], "Hello?").await;
        assert!(reply.contains("Maya"));
        assert!(!reply.contains("{agent}"));
    }

    #[tokio::test]
    async fn test_missing_backend_falls_back_to_canned_reply() {
        let generator = ReplyGenerator::without_backend();

        let reply = generator.generate(&test_agent(), &[], "Hello?").await;
        assert!(reply.contains("Maya"));
    }

    #[test]
    fn test_prompt_contains_persona_and_inbound() {
        let agent = test_agent();
        let request = ReplyGenerator::build_request(&agent, &[], "Where is my order?");

        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages.len(), 2);
        assert!(request.messages[0].content.contains("Maya"));
        assert_eq!(request.messages[1].content, "Where is my order?");
    }

    #[test]
    fn test_history_is_capped_to_last_turns() {
        let agent = test_agent();
        let history: Vec<_> = (0..25)
            .map(|i| {
                let sender = if i % 2 == 0 {
                    MessageSender::User
                } else {
                    MessageSender::Agent
                };
                stored_message(sender, &format!("turn {}", i))
            })
            .collect();

        let request = ReplyGenerator::build_request(&agent, &history, "latest");

        // system + capped history + inbound
        assert_eq!(request.messages.len(), 1 + HISTORY_TURNS + 1);
        // oldest surviving turn is 25 - 10 = 15
        assert_eq!(request.messages[1].content, "turn 15");
        assert_eq!(request.messages.last().unwrap().content, "latest");
    }

    #[test]
    fn test_history_roles_map_to_chat_roles() {
        let agent = test_agent();
        let history = vec![
            stored_message(MessageSender::User, "hi"),
            stored_message(MessageSender::Agent, "hello!"),
        ];

        let request = ReplyGenerator::build_request(&agent, &history, "ok");
        assert_eq!(request.messages[1].role, crate::message::MessageRole::User);
        assert_eq!(
            request.messages[2].role,
            crate::message::MessageRole::Assistant
        );
    }
}
