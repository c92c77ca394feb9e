//! Language-model transport and the conversation a generation session holds with it.

pub mod client;
pub mod parse;
pub mod prompts;

pub use client::OpenAiClient;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Sends a full message history and returns the reply text.
pub trait ModelClient: Send + Sync {
    fn complete<'a>(&'a self, messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String>>;
}

/// Linear role-tagged history, resent in full on every turn.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            messages: vec![ChatMessage::new(Role::System, prompts::SYSTEM_MESSAGE)],
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Append a user message, send the history, and record the reply.
    pub async fn send(&mut self, model: &dyn ModelClient, content: String) -> Result<String> {
        self.messages.push(ChatMessage::new(Role::User, content));
        let reply = model.complete(&self.messages).await?;
        self.messages.push(ChatMessage::new(Role::Assistant, reply.clone()));
        Ok(reply)
    }
}
