// ABOUTME: Library entry point for the Palaver streaming chat session core
// ABOUTME: Wires the SSE parser, authenticated transport, respond pipeline, and conversation store
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

#![deny(unsafe_code)]

//! # Palaver Client Core
//!
//! The headless core of the Palaver chat dashboard: everything between a
//! submitted prompt and a live-updating assistant message, with none of the
//! UI. The crate guarantees:
//!
//! - **One stream per conversation** — a new respond command cancels and
//!   supersedes the in-flight one (switch-latest), and the superseded
//!   session's late events never reach the store.
//! - **Transparent credential renewal** — a 401 triggers a single-flight
//!   refresh-token exchange shared by all concurrently failing requests,
//!   followed by exactly one retry of each.
//! - **Convergent state** — optimistic local messages are reconciled against
//!   the server's record after every session, so the visible transcript
//!   never permanently diverges, even after a failed stream.
//!
//! ## Architecture
//!
//! Leaf-first: [`sse`] decodes bytes into frames with no network knowledge;
//! [`transport`] owns authentication and renewal; [`stream`] turns one
//! respond request into typed lifecycle events with an idle timer and a
//! cancel handle; [`session`] serializes respond commands and drives
//! [`store`], the single owner of conversation state.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use palaver::auth::CredentialStore;
//! use palaver::cache::MemoryCache;
//! use palaver::config::ClientConfig;
//! use palaver::errors::ClientResult;
//! use palaver::session::ChatSession;
//! use palaver::store::ConversationStore;
//! use palaver::transport::AuthTransport;
//!
//! #[tokio::main]
//! async fn main() -> ClientResult<()> {
//!     let config = ClientConfig::from_env()?;
//!     let cache = Arc::new(MemoryCache::new());
//!
//!     let credentials = Arc::new(CredentialStore::load(cache.clone()).await);
//!     let transport = Arc::new(AuthTransport::new(&config, credentials)?);
//!     let store = Arc::new(ConversationStore::new(cache));
//!     store.hydrate().await;
//!
//!     let session = ChatSession::new(&config, transport, store);
//!     let conversation = session.create_thread("New conversation", "gpt-mini", None).await?;
//!     session.send_user_message(&conversation.id, "Hi").await?;
//!     Ok(())
//! }
//! ```

/// Typed wrappers for the thread and message collaborator endpoints
pub mod api;

/// Bearer credential pair state with durable persistence
pub mod auth;

/// Durable cache abstraction with memory and file backends
pub mod cache;

/// Runtime configuration
pub mod config;

/// Unified error taxonomy
pub mod errors;

/// Structured logging setup
pub mod logging;

/// Respond pipeline and thread/message commands
pub mod session;

/// Incremental Server-Sent Events frame parser
pub mod sse;

/// In-memory conversation store with durable snapshots
pub mod store;

/// Streaming session controller
pub mod stream;

/// Authenticated HTTP transport with single-flight renewal
pub mod transport;

pub use errors::{ClientError, ClientResult};
pub use session::ChatSession;
pub use store::{Conversation, Message, MessageRole};
pub use stream::{RespondRequest, StreamEvent};
