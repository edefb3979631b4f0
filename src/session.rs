// ABOUTME: Respond pipeline driving conversation state from stream lifecycle events
// ABOUTME: Switch-latest session supersession, stop/retry commands, and post-session reconciliation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # Chat Session Pipeline
//!
//! [`ChatSession`] is the only writer of conversation state. Each respond
//! command appends an optimistic assistant message, opens a streaming
//! session, and folds the session's [`StreamEvent`]s into the store.
//!
//! Concurrency policy is **switch-latest**: starting a respond command for a
//! conversation cancels and discards any in-flight one before the new
//! session opens. Every session carries a sequence number; events are only
//! applied while their session is still the registered one, so a cancelled
//! session's late-arriving events can never mutate the store once a newer
//! session has started.
//!
//! After every session — completed, failed, or cancelled — the pipeline
//! persists a snapshot and re-fetches the conversation's message list from
//! the server, replacing optimistic identities and any drift with the
//! authoritative record. A session superseded by a newer one skips
//! reconciliation; the newer session will reconcile when it ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{CreateThreadRequest, MessagesApi, ThreadPatchRequest, ThreadsApi};
use crate::config::ClientConfig;
use crate::errors::ClientResult;
use crate::store::{Conversation, ConversationPatch, ConversationStore, Message, MessageRole};
use crate::stream::{RespondHandle, RespondRequest, StreamEvent};
use crate::transport::AuthTransport;

/// Per-conversation record of the one in-flight streaming session
struct ActiveSession {
    cancel: CancellationToken,
    seq: u64,
    awaiting_first_token: bool,
    /// Server identity announced by the `created` event. Recorded for
    /// diagnostics; mutations keep targeting the local message id and
    /// reconciliation swaps identities wholesale.
    server_message_id: Option<String>,
}

/// The respond pipeline and thread/message command surface
pub struct ChatSession {
    store: Arc<ConversationStore>,
    transport: Arc<AuthTransport>,
    threads: ThreadsApi,
    messages: MessagesApi,
    idle_timeout: Duration,
    active: Mutex<HashMap<String, ActiveSession>>,
    next_seq: AtomicU64,
}

impl ChatSession {
    /// Create the pipeline over a shared transport and store
    #[must_use]
    pub fn new(
        config: &ClientConfig,
        transport: Arc<AuthTransport>,
        store: Arc<ConversationStore>,
    ) -> Self {
        Self {
            store,
            threads: ThreadsApi::new(Arc::clone(&transport)),
            messages: MessagesApi::new(Arc::clone(&transport)),
            transport,
            idle_timeout: config.idle_timeout,
            active: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// The conversation store this pipeline mutates
    #[must_use]
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    // ========================================================================
    // Session state queries
    // ========================================================================

    /// Whether a streaming session is in flight for the conversation
    pub async fn is_streaming(&self, conversation_id: &str) -> bool {
        self.active.lock().await.contains_key(conversation_id)
    }

    /// Whether the in-flight session has not yet received its first token
    pub async fn awaiting_first_token(&self, conversation_id: &str) -> bool {
        self.active
            .lock()
            .await
            .get(conversation_id)
            .is_some_and(|session| session.awaiting_first_token)
    }

    /// Server-assigned identity of the assistant message being generated,
    /// once the in-flight session's `created` event announced it
    pub async fn server_message_id(&self, conversation_id: &str) -> Option<String> {
        self.active
            .lock()
            .await
            .get(conversation_id)
            .and_then(|session| session.server_message_id.clone())
    }

    // ========================================================================
    // Message commands
    // ========================================================================

    /// Append a user message and stream the assistant's reply
    ///
    /// Blank input is ignored. The user message is created on the server with
    /// the client-assigned id so a retried create stays idempotent; a failed
    /// create is logged and the respond still runs — reconciliation converges
    /// the transcript afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot persist, or if the streaming
    /// request cannot be issued at all.
    pub async fn send_user_message(&self, conversation_id: &str, text: &str) -> ClientResult<()> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let Some(conversation) = self.store.get(conversation_id).await else {
            warn!(conversation_id, "send targeted an unknown conversation");
            return Ok(());
        };

        let message = Message::user(trimmed);
        let client_message_id = message.id.clone();
        self.store.append_message(conversation_id, message).await?;

        if let Err(error) = self
            .messages
            .create_user(conversation_id, trimmed, Some(&client_message_id))
            .await
        {
            warn!(conversation_id, %error, "user message create failed; relying on reconciliation");
        }

        self.respond(
            conversation_id,
            RespondRequest {
                prompt: trimmed.to_owned(),
                model: Some(conversation.model),
                system_prompt: conversation.system_prompt,
            },
        )
        .await
    }

    /// Replay the conversation's last user prompt through the pipeline
    ///
    /// Stream failures are never retried automatically; this is the distinct
    /// user-initiated command that does it.
    ///
    /// # Errors
    ///
    /// Returns an error under the same conditions as
    /// [`respond`](Self::respond).
    pub async fn retry(&self, conversation_id: &str) -> ClientResult<()> {
        let Some(conversation) = self.store.get(conversation_id).await else {
            warn!(conversation_id, "retry targeted an unknown conversation");
            return Ok(());
        };
        let Some(prompt) = conversation
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
        else {
            warn!(conversation_id, "retry on a conversation with no user message");
            return Ok(());
        };

        self.respond(
            conversation_id,
            RespondRequest {
                prompt,
                model: Some(conversation.model),
                system_prompt: conversation.system_prompt,
            },
        )
        .await
    }

    /// Run one respond command, superseding any in-flight session
    ///
    /// Drives the streaming session to completion, folding its events into
    /// the store, then reconciles the transcript with the server. The
    /// in-flight session it replaces is cancelled before the new one opens;
    /// its partial assistant message stays in the store as-is.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot persist, or if the streaming
    /// request cannot be issued at all. In-stream failures are recorded on
    /// the assistant message rather than returned.
    pub async fn respond(&self, conversation_id: &str, request: RespondRequest) -> ClientResult<()> {
        if self.store.get(conversation_id).await.is_none() {
            warn!(conversation_id, "respond targeted an unknown conversation");
            return Ok(());
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.insert(
                conversation_id.to_owned(),
                ActiveSession {
                    cancel: cancel.clone(),
                    seq,
                    awaiting_first_token: true,
                    server_message_id: None,
                },
            ) {
                previous.cancel.cancel();
                debug!(conversation_id, "superseded in-flight respond session");
            }
        }

        let assistant = Message::assistant_placeholder();
        let assistant_id = assistant.id.clone();
        self.store.append_message(conversation_id, assistant).await?;

        let handle = RespondHandle::open_with_token(
            &self.transport,
            conversation_id,
            &request,
            self.idle_timeout,
            cancel,
        )
        .await;

        let mut events = match handle {
            Ok(handle) => handle.events,
            Err(error) => {
                self.store
                    .mutate_message(
                        conversation_id,
                        &assistant_id,
                        |prev| prev.to_owned(),
                        Some(error.to_string()),
                    )
                    .await?;
                self.finish_session(conversation_id, seq).await;
                return Err(error);
            }
        };

        while let Some(event) = events.next().await {
            if !self.is_current(conversation_id, seq).await {
                debug!(conversation_id, seq, "discarding event from superseded session");
                break;
            }

            match event {
                StreamEvent::Created { message_id } => {
                    debug!(conversation_id, server_message_id = %message_id, "assistant message created");
                    self.record_server_id(conversation_id, seq, message_id).await;
                }
                StreamEvent::Token { text } => {
                    self.clear_awaiting(conversation_id, seq).await;
                    self.store
                        .mutate_message(
                            conversation_id,
                            &assistant_id,
                            |prev| format!("{prev}{text}"),
                            None,
                        )
                        .await?;
                }
                StreamEvent::Error { reason } => {
                    self.store
                        .mutate_message(
                            conversation_id,
                            &assistant_id,
                            |prev| prev.to_owned(),
                            Some(reason),
                        )
                        .await?;
                }
                StreamEvent::Done { .. } => {}
            }
        }
        drop(events);

        let was_current = self.finish_session(conversation_id, seq).await;
        self.store.persist().await?;
        if was_current {
            self.reconcile(conversation_id).await;
        }
        Ok(())
    }

    /// Cancel the conversation's in-flight session
    ///
    /// Clears the streaming state immediately; the session task finishes the
    /// reconciliation in the background of its own call. No-op when nothing
    /// is streaming.
    pub async fn stop(&self, conversation_id: &str) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.remove(conversation_id) {
            session.cancel.cancel();
            debug!(conversation_id, "respond session stopped");
        }
    }

    // ========================================================================
    // Thread commands
    // ========================================================================

    /// Create a conversation on the server and insert it locally
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or when persisting fails.
    pub async fn create_thread(
        &self,
        title: &str,
        model: &str,
        system_prompt: Option<&str>,
    ) -> ClientResult<Conversation> {
        let dto = self
            .threads
            .create(&CreateThreadRequest {
                title: title.to_owned(),
                model: model.to_owned(),
                system_prompt: system_prompt.map(ToOwned::to_owned),
            })
            .await?;

        let conversation = Conversation::from(dto);
        self.store.insert_front(conversation.clone()).await?;
        Ok(conversation)
    }

    /// Replace the local conversation list with the server's, page by page
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or when persisting fails.
    pub async fn hydrate_threads(&self, page_size: Option<u32>) -> ClientResult<()> {
        let mut conversations = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.threads.list(page_size, cursor.as_deref()).await?;
            conversations.extend(page.items.into_iter().map(Conversation::from));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        self.store.replace_all(conversations).await
    }

    /// Rename a conversation under optimistic concurrency
    ///
    /// # Errors
    ///
    /// Returns [`crate::errors::ClientError::ConflictFailure`] when the
    /// server rejects the stale version; the caller decides how to refresh.
    pub async fn rename(&self, conversation_id: &str, title: &str) -> ClientResult<()> {
        let Some(conversation) = self.store.get(conversation_id).await else {
            warn!(conversation_id, "rename targeted an unknown conversation");
            return Ok(());
        };
        self.patch_thread(
            conversation_id,
            ThreadPatchRequest {
                title: Some(title.to_owned()),
                version: conversation.version,
                ..ThreadPatchRequest::default()
            },
        )
        .await
    }

    /// Switch the conversation's model
    ///
    /// # Errors
    ///
    /// Same contract as [`rename`](Self::rename).
    pub async fn set_model(&self, conversation_id: &str, model: &str) -> ClientResult<()> {
        let Some(conversation) = self.store.get(conversation_id).await else {
            warn!(conversation_id, "set_model targeted an unknown conversation");
            return Ok(());
        };
        self.patch_thread(
            conversation_id,
            ThreadPatchRequest {
                model: Some(model.to_owned()),
                version: conversation.version,
                ..ThreadPatchRequest::default()
            },
        )
        .await
    }

    /// Replace the conversation's system prompt
    ///
    /// # Errors
    ///
    /// Same contract as [`rename`](Self::rename).
    pub async fn set_system_prompt(
        &self,
        conversation_id: &str,
        system_prompt: &str,
    ) -> ClientResult<()> {
        let Some(conversation) = self.store.get(conversation_id).await else {
            warn!(conversation_id, "set_system_prompt targeted an unknown conversation");
            return Ok(());
        };
        self.patch_thread(
            conversation_id,
            ThreadPatchRequest {
                system_prompt: Some(system_prompt.to_owned()),
                version: conversation.version,
                ..ThreadPatchRequest::default()
            },
        )
        .await
    }

    /// Remove a conversation locally, stopping any in-flight session
    ///
    /// The collaborator contract has no delete endpoint; removal is a local
    /// store operation.
    ///
    /// # Errors
    ///
    /// Returns an error when persisting the snapshot fails.
    pub async fn remove(&self, conversation_id: &str) -> ClientResult<()> {
        self.stop(conversation_id).await;
        self.store.remove(conversation_id).await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn patch_thread(
        &self,
        conversation_id: &str,
        request: ThreadPatchRequest,
    ) -> ClientResult<()> {
        let dto = self.threads.patch(conversation_id, &request).await?;
        self.store
            .patch(
                conversation_id,
                ConversationPatch {
                    title: Some(dto.title),
                    model: Some(dto.model),
                    system_prompt: Some(dto.system_prompt),
                    version: Some(dto.version),
                    ..ConversationPatch::default()
                },
            )
            .await
    }

    async fn is_current(&self, conversation_id: &str, seq: u64) -> bool {
        self.active
            .lock()
            .await
            .get(conversation_id)
            .is_some_and(|session| session.seq == seq)
    }

    async fn clear_awaiting(&self, conversation_id: &str, seq: u64) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.get_mut(conversation_id) {
            if session.seq == seq {
                session.awaiting_first_token = false;
            }
        }
    }

    async fn record_server_id(&self, conversation_id: &str, seq: u64, message_id: String) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.get_mut(conversation_id) {
            if session.seq == seq {
                session.server_message_id = Some(message_id);
            }
        }
    }

    /// Deregister the session; returns whether it was still the current one
    ///
    /// A session removed by [`stop`](Self::stop) still counts as current —
    /// it was cancelled, not superseded, so its reconciliation should run.
    async fn finish_session(&self, conversation_id: &str, seq: u64) -> bool {
        let mut active = self.active.lock().await;
        match active.get(conversation_id) {
            Some(session) if session.seq == seq => {
                active.remove(conversation_id);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Replace the local transcript with the server's record
    async fn reconcile(&self, conversation_id: &str) {
        match self.messages.list(conversation_id, None, None).await {
            Ok(dtos) => {
                let messages: Vec<Message> = dtos.into_iter().map(Message::from).collect();
                if let Err(error) = self.store.replace_messages(conversation_id, messages).await {
                    warn!(conversation_id, %error, "reconciled transcript failed to persist");
                }
            }
            Err(error) => {
                warn!(conversation_id, %error, "reconciliation fetch failed; keeping local transcript");
            }
        }
    }
}
