//! Chat manager.
//!
//! Chat persistence is an external concern; the core only needs message
//! creation events (for activity rewards and the applications' chat module)
//! and shadowban awareness.

use std::sync::Arc;

use marquee_core::db::unix_timestamp;
use marquee_core::event::Event;
use marquee_core::user::User;
use uuid::Uuid;

use crate::moderation::ModerationStore;

/// Errors from chat operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message content must not be empty")]
    EmptyContent,

    #[error("message content too long")]
    ContentTooLong,
}

const MAX_CONTENT_LENGTH: usize = 512;

/// A chat message. `author` is `None` for system messages.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub author: Option<User>,
    pub content: String,
    pub reference: Option<String>,
    pub attachments: Vec<String>,
    pub shadowbanned: bool,
    pub created_at: i64,
}

/// The chat manager.
pub struct ChatManager {
    moderation: Arc<dyn ModerationStore>,
    on_message_created: Event<ChatMessage>,
}

impl ChatManager {
    pub fn new(moderation: Arc<dyn ModerationStore>) -> Arc<Self> {
        Arc::new(Self {
            moderation,
            on_message_created: Event::new(),
        })
    }

    pub fn on_message_created(&self) -> &Event<ChatMessage> {
        &self.on_message_created
    }

    /// Create a user message. Messages from chat-banned authors are created
    /// shadowbanned: the author sees them, nobody else reacts to them.
    pub async fn create_message(
        &self,
        author: User,
        content: String,
        reference: Option<String>,
        attachments: Vec<String>,
    ) -> Result<ChatMessage, ChatError> {
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        if content.len() > MAX_CONTENT_LENGTH {
            return Err(ChatError::ContentTooLong);
        }

        let shadowbanned = self
            .moderation
            .address_banned_from_chat(author.address())
            .await;

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            author: Some(author),
            content,
            reference,
            attachments,
            shadowbanned,
            created_at: unix_timestamp(),
        };
        self.on_message_created.notify(message.clone());
        Ok(message)
    }

    /// Create a system message (no author, never shadowbanned).
    pub fn create_system_message(&self, content: impl Into<String>) -> ChatMessage {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            author: None,
            content: content.into(),
            reference: None,
            attachments: Vec::new(),
            shadowbanned: false,
            created_at: unix_timestamp(),
        };
        self.on_message_created.notify(message.clone());
        message
    }
}
