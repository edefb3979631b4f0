// ABOUTME: Typed wrappers for the thread and message collaborator endpoints
// ABOUTME: Wire DTOs (camelCase), pagination, and status-to-error mapping
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # Server API Adapters
//!
//! Thin typed wrappers over [`crate::transport::AuthTransport`] for the
//! collaborator endpoints the core consumes. The wire format is owned by
//! the server and assumed stable; these DTOs mirror it field-for-field with
//! camelCase names. Authorization handling lives entirely in the transport —
//! by the time a 401 reaches this layer, renewal has already failed and the
//! request maps to [`ClientError::AuthExpired`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{ClientError, ClientResult};
use crate::store::{Conversation, Message, MessageRole};
use crate::transport::AuthTransport;

// ============================================================================
// Wire DTOs
// ============================================================================

/// Server record of a conversation thread
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDto {
    /// Thread identity
    pub id: String,
    /// Display title
    pub title: String,
    /// Model answering in this thread
    pub model: String,
    /// Server-side lifecycle status
    #[serde(default)]
    pub status: Option<String>,
    /// Optional system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Server-generated summary, when available
    #[serde(default)]
    pub summary: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency token
    pub version: i64,
}

/// One page of a cursor-paginated listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDto<T> {
    /// Records on this page
    pub items: Vec<T>,
    /// Cursor for the next page; `None` on the last page
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Server record of a message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    /// Message identity (server-assigned)
    pub id: String,
    /// Owning thread
    pub thread_id: String,
    /// Author role
    pub author: MessageRole,
    /// Position within the thread
    pub position: i64,
    /// Lifecycle status (`draft`, `streaming`, `complete`, `error`)
    pub status: String,
    /// Message text
    #[serde(default)]
    pub content: Option<String>,
    /// Model that produced an assistant message
    #[serde(default)]
    pub model: Option<String>,
    /// Prompt token usage, when reported
    #[serde(default)]
    pub usage_prompt_tokens: Option<i64>,
    /// Completion token usage, when reported
    #[serde(default)]
    pub usage_completion_tokens: Option<i64>,
    /// Generation latency, when reported
    #[serde(default)]
    pub latency_ms: Option<i64>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Body for `POST /threads`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadRequest {
    /// Display title
    pub title: String,
    /// Model answering in the thread
    pub model: String,
    /// Optional system prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Body for `PATCH /threads/{id}`; must carry the last-known `version`
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPatchRequest {
    /// New title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New lifecycle status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// New model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// New system prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Last-known concurrency token
    pub version: i64,
}

/// Body for `POST /threads/{id}/messages`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateMessageRequest<'a> {
    author: MessageRole,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_message_id: Option<&'a str>,
}

impl From<ThreadDto> for Conversation {
    fn from(dto: ThreadDto) -> Self {
        Self {
            id: dto.id,
            title: dto.title,
            model: dto.model,
            system_prompt: dto.system_prompt,
            messages: Vec::new(),
            created_at: dto.created_at,
            updated_at: dto.updated_at,
            version: dto.version,
        }
    }
}

impl From<MessageDto> for Message {
    fn from(dto: MessageDto) -> Self {
        // The record carries no error text, only a lifecycle status; keep the
        // marker so a failed generation stays visible after reconciliation.
        let error = (dto.status == "error").then(|| "error".to_owned());
        Self {
            id: dto.id,
            role: dto.author,
            content: dto.content.unwrap_or_default(),
            created_at: dto.created_at,
            error,
        }
    }
}

// ============================================================================
// Adapters
// ============================================================================

/// Thread CRUD adapter
pub struct ThreadsApi {
    transport: Arc<AuthTransport>,
}

impl ThreadsApi {
    /// Create an adapter over the shared transport
    #[must_use]
    pub fn new(transport: Arc<AuthTransport>) -> Self {
        Self { transport }
    }

    /// Create a thread
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn create(&self, request: &CreateThreadRequest) -> ClientResult<ThreadDto> {
        let body = serde_json::to_value(request)?;
        let response = self
            .transport
            .request(Method::POST, "threads", Some(&body))
            .await?;
        decode(response).await
    }

    /// List threads, one page at a time
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn list(
        &self,
        limit: Option<u32>,
        cursor: Option<&str>,
    ) -> ClientResult<PageDto<ThreadDto>> {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(limit) = limit {
            query.append_pair("limit", &limit.to_string());
        }
        if let Some(cursor) = cursor {
            query.append_pair("cursor", cursor);
        }
        let query = query.finish();

        let path = if query.is_empty() {
            "threads".to_owned()
        } else {
            format!("threads?{query}")
        };

        let response = self.transport.request(Method::GET, &path, None).await?;
        decode(response).await
    }

    /// Fetch one thread
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn get(&self, thread_id: &str) -> ClientResult<ThreadDto> {
        let response = self
            .transport
            .request(Method::GET, &format!("threads/{thread_id}"), None)
            .await?;
        decode(response).await
    }

    /// Update thread fields under optimistic concurrency
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConflictFailure`] on a version mismatch, and
    /// the usual transport errors otherwise. Conflicts are surfaced, never
    /// auto-merged.
    pub async fn patch(
        &self,
        thread_id: &str,
        request: &ThreadPatchRequest,
    ) -> ClientResult<ThreadDto> {
        let body = serde_json::to_value(request)?;
        let response = self
            .transport
            .request(Method::PATCH, &format!("threads/{thread_id}"), Some(&body))
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Err(ClientError::conflict(thread_id));
        }
        decode(response).await
    }
}

/// Message list/create adapter
pub struct MessagesApi {
    transport: Arc<AuthTransport>,
}

impl MessagesApi {
    /// Create an adapter over the shared transport
    #[must_use]
    pub fn new(transport: Arc<AuthTransport>) -> Self {
        Self { transport }
    }

    /// List a thread's messages in position order
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn list(
        &self,
        thread_id: &str,
        after_position: Option<i64>,
        limit: Option<u32>,
    ) -> ClientResult<Vec<MessageDto>> {
        let query = {
            let mut query = url::form_urlencoded::Serializer::new(String::new());
            if let Some(after) = after_position {
                query.append_pair("afterPosition", &after.to_string());
            }
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            query.finish()
        };

        let path = if query.is_empty() {
            format!("threads/{thread_id}/messages")
        } else {
            format!("threads/{thread_id}/messages?{query}")
        };

        let response = self.transport.request(Method::GET, &path, None).await?;
        decode(response).await
    }

    /// Create a user message with an idempotency-style client-assigned id
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn create_user(
        &self,
        thread_id: &str,
        content: &str,
        client_message_id: Option<&str>,
    ) -> ClientResult<MessageDto> {
        let body = serde_json::to_value(CreateMessageRequest {
            author: MessageRole::User,
            content,
            client_message_id,
        })?;
        let response = self
            .transport
            .request(
                Method::POST,
                &format!("threads/{thread_id}/messages"),
                Some(&body),
            )
            .await?;
        decode(response).await
    }
}

/// Map a response to a decoded body or the matching error variant
async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED {
        return Err(ClientError::AuthExpired);
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ClientError::transport_status(
            status.as_u16(),
            if message.is_empty() {
                status.to_string()
            } else {
                message
            },
        ));
    }

    Ok(response.json::<T>().await?)
}
