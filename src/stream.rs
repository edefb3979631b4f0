// ABOUTME: Streaming session controller for the respond endpoint
// ABOUTME: Maps SSE frames to typed lifecycle events with an idle timer and cooperative cancellation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # Streaming Session Controller
//!
//! [`RespondHandle::open`] issues one authenticated streaming POST to a
//! conversation's respond endpoint, decodes the body through
//! [`crate::sse::SseFrameBuffer`], and exposes the result as a finite,
//! non-restartable sequence of [`StreamEvent`]s plus an explicit cancel.
//!
//! Liveness: an idle timer is armed when the session opens and re-armed
//! after every frame; if it fires before a terminal event the controller
//! synthesizes `Error("timeout")` and terminates. Cancellation is
//! cooperative via a [`CancellationToken`] raced against every body read, so
//! it is observable within one I/O step; the timer and connection are
//! dropped with the stream state on every exit path.

use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Method;
use serde::Serialize;
use tokio::time::sleep;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::{ClientError, ClientResult};
use crate::sse::{SseFrame, SseFrameBuffer};
use crate::transport::AuthTransport;

/// Lifecycle event of one streaming respond session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The server assigned an identity to the assistant message being generated
    Created {
        /// Server-side message identity
        message_id: String,
    },
    /// An incremental piece of assistant text
    Token {
        /// Text to append
        text: String,
    },
    /// The session completed; no further events follow
    Done {
        /// Completion reason, when the server supplied one
        reason: Option<String>,
    },
    /// The session failed; no further events follow
    Error {
        /// Failure reason (server-emitted, transport, or `"timeout"`)
        reason: String,
    },
}

impl StreamEvent {
    /// Whether this event terminates the sequence
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Typed failure for a terminal `Error` event, `None` otherwise
    ///
    /// The synthesized idle-timer reason maps to
    /// [`ClientError::StreamTimeout`]; everything else is a server-emitted
    /// [`ClientError::StreamError`].
    #[must_use]
    pub fn failure(&self) -> Option<ClientError> {
        match self {
            Self::Error { reason } if reason == "timeout" => Some(ClientError::StreamTimeout),
            Self::Error { reason } => Some(ClientError::StreamError(reason.clone())),
            Self::Created { .. } | Self::Token { .. } | Self::Done { .. } => None,
        }
    }
}

/// Stream type for respond session lifecycle events
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Parameters of a respond command
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondRequest {
    /// Prompt the assistant answers
    pub prompt: String,
    /// Model override, when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// System prompt override, when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// An open streaming session: its event sequence and its cancel handle
pub struct RespondHandle {
    /// Finite, non-restartable lifecycle event sequence
    pub events: EventStream,
    cancel: CancellationToken,
}

impl RespondHandle {
    /// Open a streaming session with a fresh cancellation token
    ///
    /// # Errors
    ///
    /// Returns an error if the streaming request cannot be issued at all;
    /// HTTP-level failures after connection are reported in-band as a single
    /// `Error` event.
    pub async fn open(
        transport: &AuthTransport,
        conversation_id: &str,
        request: &RespondRequest,
        idle_timeout: Duration,
    ) -> ClientResult<Self> {
        Self::open_with_token(
            transport,
            conversation_id,
            request,
            idle_timeout,
            CancellationToken::new(),
        )
        .await
    }

    /// Open a streaming session bound to a caller-supplied cancellation token
    ///
    /// The respond pipeline registers the token *before* opening so a
    /// superseding command can cancel a session that is still connecting.
    ///
    /// # Errors
    ///
    /// Returns an error if the streaming request cannot be issued at all.
    pub async fn open_with_token(
        transport: &AuthTransport,
        conversation_id: &str,
        request: &RespondRequest,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> ClientResult<Self> {
        let body = serde_json::to_value(request)?;
        let path = format!("threads/{conversation_id}/respond");

        let token = cancel.clone();
        let outcome = tokio::select! {
            () = token.cancelled() => None,
            result = transport.request_stream(Method::POST, &path, Some(&body)) => Some(result),
        };

        // Cancelled while connecting: an already-dead session with no events.
        let Some(result) = outcome else {
            debug!(conversation_id, "respond session cancelled before connect");
            return Ok(Self {
                events: Box::pin(futures_util::stream::empty::<StreamEvent>()),
                cancel,
            });
        };
        let response = result?;
        let status = response.status();

        let events = async_stream::stream! {
            if !status.is_success() {
                yield StreamEvent::Error {
                    reason: format!("HTTP {}", status.as_u16()),
                };
                return;
            }

            let mut frames = SseFrameBuffer::new();
            let mut body = Box::pin(response.bytes_stream());
            let idle = sleep(idle_timeout);
            tokio::pin!(idle);

            'session: loop {
                let step = tokio::select! {
                    () = token.cancelled() => SessionStep::Cancelled,
                    () = &mut idle => SessionStep::IdleExpired,
                    chunk = body.next() => SessionStep::Body(chunk),
                };

                match step {
                    SessionStep::Cancelled => break 'session,
                    SessionStep::IdleExpired => {
                        yield StreamEvent::Error { reason: "timeout".to_owned() };
                        break 'session;
                    }
                    SessionStep::Body(Some(Ok(bytes))) => {
                        for frame in frames.feed(&bytes) {
                            idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                            if let Some(event) = map_frame(frame) {
                                let terminal = event.is_terminal();
                                yield event;
                                if terminal {
                                    break 'session;
                                }
                            }
                        }
                    }
                    SessionStep::Body(Some(Err(e))) => {
                        yield StreamEvent::Error { reason: format!("stream read error: {e}") };
                        break 'session;
                    }
                    SessionStep::Body(None) => {
                        let mut terminated = false;
                        if let Some(frame) = frames.flush() {
                            if let Some(event) = map_frame(frame) {
                                terminated = event.is_terminal();
                                yield event;
                            }
                        }
                        // Streams that just close without a done frame still
                        // complete the session.
                        if !terminated {
                            yield StreamEvent::Done { reason: None };
                        }
                        break 'session;
                    }
                }
            }
        };

        Ok(Self {
            events: Box::pin(events),
            cancel,
        })
    }

    /// Abort the underlying request immediately
    ///
    /// Idempotent and safe to call after natural completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The session's cancellation token
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Outcome of one wait on the session's select loop
enum SessionStep {
    Cancelled,
    IdleExpired,
    Body(Option<Result<bytes::Bytes, reqwest::Error>>),
}

/// Map a parsed frame to a lifecycle event
///
/// Unknown named frames are dropped. An unnamed frame with non-empty data is
/// treated as an implicit token — a documented accommodation for servers
/// that omit the `event:` field on token frames.
fn map_frame(frame: SseFrame) -> Option<StreamEvent> {
    match frame.event.as_deref() {
        Some("message.created" | "created") => Some(StreamEvent::Created {
            message_id: frame.data,
        }),
        Some("token") => Some(StreamEvent::Token { text: frame.data }),
        Some("done") => Some(StreamEvent::Done {
            reason: (!frame.data.is_empty()).then_some(frame.data),
        }),
        Some("error") => Some(StreamEvent::Error {
            reason: if frame.data.is_empty() {
                "error".to_owned()
            } else {
                frame.data
            },
        }),
        Some(other) => {
            trace!(event = other, "dropping unrecognized stream frame");
            None
        }
        None if !frame.data.is_empty() => Some(StreamEvent::Token { text: frame.data }),
        None => None,
    }
}
