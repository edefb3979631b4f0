// ABOUTME: In-memory conversation store with copy-on-write updates and snapshot persistence
// ABOUTME: Owns the Conversation and Message models mutated by the respond pipeline
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # Conversation Store
//!
//! Keyed collection of conversations and their messages. Mutations go
//! through [`ConversationStore::patch`] (copy-on-write replacement of the
//! matching entry) and every mutation persists a serialized snapshot to the
//! durable cache, so a crash at any point loses at most the in-flight
//! update. Only the respond pipeline and the thread/message commands in
//! [`crate::session`] mutate conversation fields; everything else gets
//! read-only clones.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{keys, CacheStore};
use crate::errors::ClientResult;

// ============================================================================
// Models
// ============================================================================

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User input message
    User,
    /// Assistant response message
    Assistant,
    /// System instruction message
    System,
}

impl MessageRole {
    /// String representation used on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message identity; client-assigned for optimistic entries, replaced by
    /// the server's identity on reconciliation
    pub id: String,
    /// Role of the sender
    pub role: MessageRole,
    /// Message text; grows incrementally while an assistant reply streams
    pub content: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Failure note when the producing stream ended in an error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Create a message with a fresh client-assigned identity
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            error: None,
        }
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create the empty assistant placeholder appended when a stream opens
    #[must_use]
    pub fn assistant_placeholder() -> Self {
        Self::new(MessageRole::Assistant, "")
    }
}

/// A conversation and its ordered transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation identity
    pub id: String,
    /// Display title
    pub title: String,
    /// Model answering in this conversation
    pub model: String,
    /// Optional system prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Ordered transcript; append-only during a session, replaced wholesale
    /// on reconciliation
    pub messages: Vec<Message>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last-mutation timestamp
    pub updated_at: DateTime<Utc>,
    /// Server-side optimistic-concurrency token; every mutating request to
    /// the thread collaborator carries the last-known value
    pub version: i64,
}

/// Partial update applied through [`ConversationStore::patch`]
///
/// `system_prompt` is doubly optional: the outer `Option` means "leave
/// unchanged", the inner one allows clearing the prompt.
#[derive(Debug, Default)]
pub struct ConversationPatch {
    /// New title
    pub title: Option<String>,
    /// New model
    pub model: Option<String>,
    /// New system prompt (`Some(None)` clears it)
    pub system_prompt: Option<Option<String>>,
    /// New transcript (reconciliation)
    pub messages: Option<Vec<Message>>,
    /// New concurrency token
    pub version: Option<i64>,
}

// ============================================================================
// Store
// ============================================================================

/// In-memory conversation collection with durable snapshots
pub struct ConversationStore {
    cache: Arc<dyn CacheStore>,
    conversations: RwLock<Vec<Conversation>>,
}

impl ConversationStore {
    /// Create an empty store backed by the given cache
    #[must_use]
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            conversations: RwLock::new(Vec::new()),
        }
    }

    /// Load the persisted conversation list from the cache
    ///
    /// Missing or corrupt snapshots degrade to an empty list without failing
    /// startup.
    pub async fn hydrate(&self) {
        let loaded = match self.cache.get(keys::THREADS).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(error = %e, "stored conversation snapshot corrupt, starting empty");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "conversation cache read failed, starting empty");
                Vec::new()
            }
        };

        *self.conversations.write().await = loaded;
    }

    /// Clone of the full conversation list
    pub async fn snapshot(&self) -> Vec<Conversation> {
        self.conversations.read().await.clone()
    }

    /// Clone of one conversation by id
    pub async fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations
            .read()
            .await
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned()
    }

    /// Insert a conversation at the front of the list (newest first)
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the snapshot fails.
    pub async fn insert_front(&self, conversation: Conversation) -> ClientResult<()> {
        self.conversations.write().await.insert(0, conversation);
        self.persist().await
    }

    /// Remove a conversation; absent ids are a no-op
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the snapshot fails.
    pub async fn remove(&self, conversation_id: &str) -> ClientResult<()> {
        self.conversations
            .write()
            .await
            .retain(|c| c.id != conversation_id);
        self.persist().await
    }

    /// Replace the whole conversation list (server hydration)
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the snapshot fails.
    pub async fn replace_all(&self, conversations: Vec<Conversation>) -> ClientResult<()> {
        *self.conversations.write().await = conversations;
        self.persist().await
    }

    /// Copy-on-write update of the matching conversation
    ///
    /// Replaces the entry with a patched clone and bumps `updated_at`.
    /// Unknown ids are a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the snapshot fails.
    pub async fn patch(
        &self,
        conversation_id: &str,
        patch: ConversationPatch,
    ) -> ClientResult<()> {
        {
            let mut conversations = self.conversations.write().await;
            let Some(existing) = conversations.iter_mut().find(|c| c.id == conversation_id)
            else {
                warn!(conversation_id, "patch targeted an unknown conversation");
                return Ok(());
            };

            let mut next = existing.clone();
            if let Some(title) = patch.title {
                next.title = title;
            }
            if let Some(model) = patch.model {
                next.model = model;
            }
            if let Some(system_prompt) = patch.system_prompt {
                next.system_prompt = system_prompt;
            }
            if let Some(messages) = patch.messages {
                next.messages = messages;
            }
            if let Some(version) = patch.version {
                next.version = version;
            }
            next.updated_at = Utc::now();
            *existing = next;
        }

        self.persist().await
    }

    /// Append a message to a conversation's transcript
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the snapshot fails.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> ClientResult<()> {
        let messages = {
            let conversations = self.conversations.read().await;
            let Some(conversation) = conversations.iter().find(|c| c.id == conversation_id)
            else {
                warn!(conversation_id, "append targeted an unknown conversation");
                return Ok(());
            };
            let mut messages = conversation.messages.clone();
            messages.push(message);
            messages
        };

        self.patch(
            conversation_id,
            ConversationPatch {
                messages: Some(messages),
                ..ConversationPatch::default()
            },
        )
        .await
    }

    /// Rewrite one message's content, optionally replacing its error marker
    ///
    /// `updater` receives the previous content and returns the next one.
    /// The `error` argument replaces the message's error field verbatim
    /// (`None` clears it), mirroring the patch semantics of the transcript.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the snapshot fails.
    pub async fn mutate_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        updater: impl FnOnce(&str) -> String + Send,
        error: Option<String>,
    ) -> ClientResult<()> {
        let messages = {
            let conversations = self.conversations.read().await;
            let Some(conversation) = conversations.iter().find(|c| c.id == conversation_id)
            else {
                warn!(conversation_id, "mutate targeted an unknown conversation");
                return Ok(());
            };

            let mut messages = conversation.messages.clone();
            let Some(message) = messages.iter_mut().find(|m| m.id == message_id) else {
                warn!(conversation_id, message_id, "mutate targeted an unknown message");
                return Ok(());
            };
            message.content = updater(&message.content);
            message.error = error;
            messages
        };

        self.patch(
            conversation_id,
            ConversationPatch {
                messages: Some(messages),
                ..ConversationPatch::default()
            },
        )
        .await
    }

    /// Replace a conversation's transcript wholesale (reconciliation)
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the snapshot fails.
    pub async fn replace_messages(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> ClientResult<()> {
        self.patch(
            conversation_id,
            ConversationPatch {
                messages: Some(messages),
                ..ConversationPatch::default()
            },
        )
        .await
    }

    /// Persist the current snapshot to the durable cache
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the cache write fails.
    pub async fn persist(&self) -> ClientResult<()> {
        let snapshot = self.conversations.read().await.clone();
        self.cache
            .set(keys::THREADS, serde_json::to_value(&snapshot)?)
            .await
    }
}
