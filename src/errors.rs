// ABOUTME: Unified error taxonomy for the chat client core
// ABOUTME: Closed set of failure modes spanning transport, auth renewal, and streaming
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # Unified Error Handling
//!
//! Every fallible operation in the crate returns [`ClientResult`]. The
//! taxonomy is deliberately closed: stream consumers and UI layers match on
//! it exhaustively instead of probing stringly-typed payloads.
//!
//! Authorization failures deserve a note: a 401 is handled *inside* the
//! transport (renew-and-retry-once) and only surfaces as [`ClientError::AuthExpired`]
//! when no usable refresh path remains — at which point the credential pair
//! has already been cleared, which is the signal for the embedding
//! application to drop to its login flow.

use thiserror::Error;

/// Unified error type for the client core
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or HTTP-level failure, with the status code when one was received
    #[error("transport failure{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    TransportFailure {
        /// HTTP status code, if the request got far enough to receive one
        status: Option<u16>,
        /// Human-readable description of the failure
        message: String,
    },

    /// Authorization failed and no refresh path remains; the credential pair is cleared
    #[error("authorization expired and could not be renewed")]
    AuthExpired,

    /// The per-session idle threshold elapsed without a frame
    #[error("stream idle timeout")]
    StreamTimeout,

    /// The server emitted an `error` frame on the event stream
    #[error("stream error: {0}")]
    StreamError(String),

    /// Optimistic-concurrency version mismatch on a conversation update
    #[error("version conflict updating conversation {conversation_id}")]
    ConflictFailure {
        /// Conversation whose update was rejected
        conversation_id: String,
    },

    /// Durable cache read or write failed
    #[error("cache failure: {0}")]
    Cache(String),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization or deserialization failed
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying HTTP client failure (connect, body, decode)
    #[error("http client failure: {0}")]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    /// Transport failure for a response with a known HTTP status
    #[must_use]
    pub fn transport_status(status: u16, message: impl Into<String>) -> Self {
        Self::TransportFailure {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Transport failure without an HTTP status (connection-level)
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            status: None,
            message: message.into(),
        }
    }

    /// Version conflict on a conversation mutation
    #[must_use]
    pub fn conflict(conversation_id: impl Into<String>) -> Self {
        Self::ConflictFailure {
            conversation_id: conversation_id.into(),
        }
    }

    /// Cache failure
    #[must_use]
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache(message.into())
    }

    /// Configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error is an optimistic-concurrency conflict
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConflictFailure { .. })
    }
}

/// Result type alias for convenience
pub type ClientResult<T> = Result<T, ClientError>;
