// ABOUTME: Integration tests for the respond pipeline
// ABOUTME: Validates switch-latest supersession, stop, retry, reconciliation, and conflict surfacing
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use palaver::cache::MemoryCache;
use palaver::errors::ClientError;
use palaver::session::ChatSession;
use palaver::store::{Conversation, ConversationStore, Message, MessageRole};
use palaver::stream::RespondRequest;
use serde_json::{json, Value};
use tokio::sync::Mutex;

// ============================================================================
// Mock server
// ============================================================================

/// How one respond call should stream
enum RespondScript {
    /// Whole body delivered at once
    Immediate(&'static str),
    /// First chunk after `delay_ms`, then an endless drip of `x` tokens
    Endless { first: &'static str, delay_ms: u64 },
}

#[derive(Default)]
struct PipelineServer {
    respond_scripts: Mutex<VecDeque<RespondScript>>,
    respond_bodies: Mutex<Vec<Value>>,
    message_creates: Mutex<Vec<Value>>,
    /// Messages returned by the list endpoint; `None` makes it answer 500
    messages: Mutex<Option<Vec<Value>>>,
    patch_conflict: AtomicBool,
    thread_counter: AtomicUsize,
}

fn thread_dto(id: &str, title: &str, model: &str, version: i64) -> Value {
    let now = Utc::now().to_rfc3339();
    json!({
        "id": id,
        "title": title,
        "model": model,
        "status": "active",
        "createdAt": now,
        "updatedAt": now,
        "version": version,
    })
}

fn message_dto(id: &str, thread_id: &str, author: &str, position: i64, content: &str) -> Value {
    json!({
        "id": id,
        "threadId": thread_id,
        "author": author,
        "position": position,
        "status": "complete",
        "content": content,
        "createdAt": Utc::now().to_rfc3339(),
    })
}

fn pipeline_router(state: Arc<PipelineServer>) -> Router {
    async fn create_thread(
        State(state): State<Arc<PipelineServer>>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let n = state.thread_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let title = body["title"].as_str().unwrap_or("Untitled");
        let model = body["model"].as_str().unwrap_or("default");
        (
            StatusCode::CREATED,
            Json(thread_dto(&format!("t{n}"), title, model, 1)),
        )
    }

    async fn patch_thread(
        State(state): State<Arc<PipelineServer>>,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        if state.patch_conflict.load(Ordering::SeqCst) {
            return (StatusCode::CONFLICT, Json(json!({"error": "version mismatch"})));
        }
        let version = body["version"].as_i64().unwrap_or(0) + 1;
        let title = body["title"].as_str().unwrap_or("Untitled");
        let model = body["model"].as_str().unwrap_or("default");
        (StatusCode::OK, Json(thread_dto(&id, title, model, version)))
    }

    async fn list_messages(State(state): State<Arc<PipelineServer>>) -> Response {
        match state.messages.lock().await.clone() {
            Some(messages) => Json(messages).into_response(),
            None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    async fn create_message(
        State(state): State<Arc<PipelineServer>>,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let content = body["content"].as_str().unwrap_or_default().to_owned();
        state.message_creates.lock().await.push(body);
        (
            StatusCode::CREATED,
            Json(message_dto("srv-u1", &id, "user", 1, &content)),
        )
    }

    async fn respond(
        State(state): State<Arc<PipelineServer>>,
        Json(body): Json<Value>,
    ) -> Response {
        state.respond_bodies.lock().await.push(body);
        let script = state
            .respond_scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or(RespondScript::Immediate("event: done\ndata:\n\n"));

        match script {
            RespondScript::Immediate(sse) => common::sse_response(sse),
            RespondScript::Endless { first, delay_ms } => {
                let stream = async_stream::stream! {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    yield Ok::<_, Infallible>(Bytes::from_static(first.as_bytes()));
                    loop {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        yield Ok(Bytes::from_static(b"event: token\ndata: x\n\n"));
                    }
                };
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/event-stream")
                    .body(Body::from_stream(stream))
                    .unwrap()
            }
        }
    }

    async fn list_threads() -> Json<Value> {
        Json(json!({"items": [], "nextCursor": null}))
    }

    Router::new()
        .route("/api/threads", post(create_thread).get(list_threads))
        .route("/api/threads/:id", patch(patch_thread))
        .route(
            "/api/threads/:id/messages",
            get(list_messages).post(create_message),
        )
        .route("/api/threads/:id/respond", post(respond))
        .with_state(state)
}

async fn make_session(addr: SocketAddr) -> Arc<ChatSession> {
    let config = common::test_config(addr);
    let transport = common::test_transport(addr, Some("t"), None).await;
    let store = Arc::new(ConversationStore::new(Arc::new(MemoryCache::new())));
    Arc::new(ChatSession::new(&config, transport, store))
}

/// Poll a condition until it holds or a deadline passes
async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn respond_request(prompt: &str) -> RespondRequest {
    RespondRequest {
        prompt: prompt.to_owned(),
        model: Some("gpt-mini".to_owned()),
        system_prompt: None,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_end_to_end_prompt_to_reconciled_transcript() {
    let state = Arc::new(PipelineServer::default());
    state.respond_scripts.lock().await.push_back(RespondScript::Immediate(
        "event: created\ndata: srv-1\n\n\
         event: token\ndata: He\n\n\
         event: token\ndata: llo\n\n\
         event: done\ndata:\n\n",
    ));
    let addr = common::spawn_server(pipeline_router(Arc::clone(&state))).await;
    let session = make_session(addr).await;

    let conversation = session
        .create_thread("New conversation", "gpt-mini", None)
        .await
        .expect("create thread");

    // The authoritative record reconciliation will fetch afterwards.
    *state.messages.lock().await = Some(vec![
        message_dto("srv-u1", &conversation.id, "user", 1, "Hi"),
        message_dto("srv-1", &conversation.id, "assistant", 2, "Hello"),
    ]);

    session
        .send_user_message(&conversation.id, "Hi")
        .await
        .expect("send");

    assert!(!session.is_streaming(&conversation.id).await);

    let reconciled = session.store().get(&conversation.id).await.expect("conversation");
    assert_eq!(reconciled.messages.len(), 2);
    assert_eq!(reconciled.messages[0].role, MessageRole::User);
    assert_eq!(reconciled.messages[0].content, "Hi");
    assert_eq!(reconciled.messages[1].role, MessageRole::Assistant);
    assert_eq!(reconciled.messages[1].content, "Hello");
    assert_eq!(reconciled.messages[1].id, "srv-1", "identity reconciled to the server's");
    assert!(reconciled.messages[1].error.is_none());

    // The optimistic user create carried an idempotency-style client id.
    let creates = state.message_creates.lock().await;
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0]["author"], json!("user"));
    assert_eq!(creates[0]["content"], json!("Hi"));
    assert!(creates[0]["clientMessageId"].is_string());

    // The respond command carried the prompt and model.
    let bodies = state.respond_bodies.lock().await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["prompt"], json!("Hi"));
    assert_eq!(bodies[0]["model"], json!("gpt-mini"));
}

#[tokio::test]
async fn test_switch_latest_supersedes_inflight_session() {
    let state = Arc::new(PipelineServer::default());
    {
        let mut scripts = state.respond_scripts.lock().await;
        scripts.push_back(RespondScript::Endless {
            first: "event: token\ndata: alpha\n\n",
            delay_ms: 0,
        });
        scripts.push_back(RespondScript::Immediate(
            "event: token\ndata: beta\n\nevent: done\ndata:\n\n",
        ));
    }
    let addr = common::spawn_server(pipeline_router(Arc::clone(&state))).await;
    let session = make_session(addr).await;

    let conversation = session
        .create_thread("New conversation", "gpt-mini", None)
        .await
        .expect("create thread");
    let conversation_id = conversation.id.clone();

    // Command A: endless stream, driven from its own task.
    let task_a = {
        let session = Arc::clone(&session);
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            session
                .respond(&conversation_id, respond_request("first prompt"))
                .await
        })
    };

    wait_for("command A's first token", || {
        let session = Arc::clone(&session);
        let conversation_id = conversation_id.clone();
        async move {
            session
                .store()
                .get(&conversation_id)
                .await
                .is_some_and(|c| c.messages.iter().any(|m| m.content.starts_with("alpha")))
        }
    })
    .await;
    assert!(session.is_streaming(&conversation_id).await);

    // Command B supersedes A.
    session
        .respond(&conversation_id, respond_request("second prompt"))
        .await
        .expect("respond B");

    // A's task winds down with its session cancelled.
    let result_a = tokio::time::timeout(Duration::from_secs(2), task_a)
        .await
        .expect("command A must terminate after supersession")
        .unwrap();
    assert!(result_a.is_ok());
    assert!(!session.is_streaming(&conversation_id).await);

    let after_b = session.store().get(&conversation_id).await.expect("conversation");
    assert_eq!(after_b.messages.len(), 2, "one assistant message per command");
    assert_eq!(after_b.messages[1].content, "beta");
    let partial_a = after_b.messages[0].content.clone();
    assert!(partial_a.starts_with("alpha"));

    // Any late-buffered events from A must never reach the store.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = session.store().get(&conversation_id).await.expect("conversation");
    assert_eq!(settled.messages[0].content, partial_a);
    assert_eq!(settled.messages[1].content, "beta");
}

#[tokio::test]
async fn test_stop_clears_streaming_immediately() {
    let state = Arc::new(PipelineServer::default());
    state.respond_scripts.lock().await.push_back(RespondScript::Endless {
        first: "event: token\ndata: partial\n\n",
        delay_ms: 0,
    });
    let addr = common::spawn_server(pipeline_router(Arc::clone(&state))).await;
    let session = make_session(addr).await;

    let conversation = session
        .create_thread("New conversation", "gpt-mini", None)
        .await
        .expect("create thread");
    let conversation_id = conversation.id.clone();

    let task = {
        let session = Arc::clone(&session);
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            session
                .respond(&conversation_id, respond_request("prompt"))
                .await
        })
    };

    wait_for("first token", || {
        let session = Arc::clone(&session);
        let conversation_id = conversation_id.clone();
        async move {
            session
                .store()
                .get(&conversation_id)
                .await
                .is_some_and(|c| c.messages.iter().any(|m| !m.content.is_empty()))
        }
    })
    .await;

    session.stop(&conversation_id).await;
    assert!(
        !session.is_streaming(&conversation_id).await,
        "stop clears streaming without waiting for reconciliation"
    );

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("stopped session must terminate")
        .unwrap()
        .expect("respond returns cleanly after stop");

    let conversation = session.store().get(&conversation_id).await.expect("conversation");
    assert!(conversation.messages[0].content.starts_with("partial"));
    assert!(
        conversation.messages[0].error.is_none(),
        "a stopped stream is not an error"
    );
}

#[tokio::test]
async fn test_stream_error_recorded_on_partial_message() {
    let state = Arc::new(PipelineServer::default());
    state.respond_scripts.lock().await.push_back(RespondScript::Immediate(
        "event: token\ndata: partial\n\nevent: error\ndata: boom\n\n",
    ));
    let addr = common::spawn_server(pipeline_router(Arc::clone(&state))).await;
    let session = make_session(addr).await;

    let conversation = session
        .create_thread("New conversation", "gpt-mini", None)
        .await
        .expect("create thread");

    session
        .respond(&conversation.id, respond_request("prompt"))
        .await
        .expect("respond");

    let conversation = session.store().get(&conversation.id).await.expect("conversation");
    let assistant = &conversation.messages[0];
    assert_eq!(
        assistant.content, "partial",
        "failed stream leaves the partial text visible"
    );
    assert_eq!(assistant.error.as_deref(), Some("boom"));
    assert!(!session.is_streaming(&conversation.id).await);
}

#[tokio::test]
async fn test_awaiting_first_token_lifecycle() {
    let state = Arc::new(PipelineServer::default());
    state.respond_scripts.lock().await.push_back(RespondScript::Endless {
        first: "event: created\ndata: srv-9\n\nevent: token\ndata: alpha\n\n",
        delay_ms: 300,
    });
    let addr = common::spawn_server(pipeline_router(Arc::clone(&state))).await;
    let session = make_session(addr).await;

    let conversation = session
        .create_thread("New conversation", "gpt-mini", None)
        .await
        .expect("create thread");
    let conversation_id = conversation.id.clone();

    let task = {
        let session = Arc::clone(&session);
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            session
                .respond(&conversation_id, respond_request("prompt"))
                .await
        })
    };

    wait_for("session registration", || {
        let session = Arc::clone(&session);
        let conversation_id = conversation_id.clone();
        async move { session.is_streaming(&conversation_id).await }
    })
    .await;
    assert!(session.awaiting_first_token(&conversation_id).await);

    wait_for("first token", || {
        let session = Arc::clone(&session);
        let conversation_id = conversation_id.clone();
        async move { !session.awaiting_first_token(&conversation_id).await }
    })
    .await;

    assert_eq!(
        session.server_message_id(&conversation_id).await.as_deref(),
        Some("srv-9"),
        "created event's identity is recorded on the active session"
    );

    session.stop(&conversation_id).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
}

#[tokio::test]
async fn test_retry_replays_last_user_prompt() {
    let state = Arc::new(PipelineServer::default());
    state.respond_scripts.lock().await.push_back(RespondScript::Immediate(
        "event: token\ndata: again\n\nevent: done\ndata:\n\n",
    ));
    let addr = common::spawn_server(pipeline_router(Arc::clone(&state))).await;
    let session = make_session(addr).await;

    let conversation = session
        .create_thread("New conversation", "gpt-mini", None)
        .await
        .expect("create thread");

    session
        .store()
        .append_message(&conversation.id, Message::user("What happened?"))
        .await
        .expect("seed user message");

    session.retry(&conversation.id).await.expect("retry");

    let bodies = state.respond_bodies.lock().await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["prompt"], json!("What happened?"));

    let conversation = session.store().get(&conversation.id).await.expect("conversation");
    assert_eq!(conversation.messages.last().unwrap().content, "again");
}

#[tokio::test]
async fn test_version_conflict_surfaces_to_caller() {
    let state = Arc::new(PipelineServer::default());
    state.patch_conflict.store(true, Ordering::SeqCst);
    let addr = common::spawn_server(pipeline_router(Arc::clone(&state))).await;
    let session = make_session(addr).await;

    let conversation = session
        .create_thread("New conversation", "gpt-mini", None)
        .await
        .expect("create thread");

    let result = session.rename(&conversation.id, "Renamed").await;
    match result {
        Err(ClientError::ConflictFailure { conversation_id }) => {
            assert_eq!(conversation_id, conversation.id);
        }
        other => panic!("expected ConflictFailure, got {other:?}"),
    }

    // No auto-merge: the local title is untouched.
    let local = session.store().get(&conversation.id).await.expect("conversation");
    assert_eq!(local.title, "New conversation");
}

#[tokio::test]
async fn test_rename_applies_server_confirmed_record() {
    let state = Arc::new(PipelineServer::default());
    let addr = common::spawn_server(pipeline_router(Arc::clone(&state))).await;
    let session = make_session(addr).await;

    let conversation = session
        .create_thread("New conversation", "gpt-mini", None)
        .await
        .expect("create thread");
    assert_eq!(conversation.version, 1);

    session
        .rename(&conversation.id, "Renamed")
        .await
        .expect("rename");

    let local = session.store().get(&conversation.id).await.expect("conversation");
    assert_eq!(local.title, "Renamed");
    assert_eq!(local.version, 2, "confirmed version token replaces the local one");
}

#[tokio::test]
async fn test_connect_failure_records_error_on_message() {
    // A bound-then-dropped listener gives an address that refuses connections.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let session = make_session(dead_addr).await;
    let conversation_id = "local-1";
    let now = Utc::now();
    session
        .store()
        .insert_front(Conversation {
            id: conversation_id.to_owned(),
            title: "Offline".to_owned(),
            model: "gpt-mini".to_owned(),
            system_prompt: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        })
        .await
        .expect("insert");

    let result = session
        .respond(conversation_id, respond_request("prompt"))
        .await;
    assert!(result.is_err(), "a connection-level failure surfaces to the caller");

    let conversation = session.store().get(conversation_id).await.expect("conversation");
    assert_eq!(conversation.messages.len(), 1);
    assert!(
        conversation.messages[0].error.is_some(),
        "the placeholder message carries the failure"
    );
    assert!(!session.is_streaming(conversation_id).await);
}

#[tokio::test]
async fn test_hydrate_threads_pages_through_cursor() {
    #[derive(serde::Deserialize)]
    struct ListParams {
        cursor: Option<String>,
        limit: Option<u32>,
    }

    async fn list_threads(Query(params): Query<ListParams>) -> Json<Value> {
        assert_eq!(params.limit, Some(1));
        match params.cursor.as_deref() {
            None => Json(json!({
                "items": [thread_dto("t1", "First", "gpt-mini", 1)],
                "nextCursor": "c2",
            })),
            Some("c2") => Json(json!({
                "items": [thread_dto("t2", "Second", "gpt-mini", 1)],
                "nextCursor": null,
            })),
            Some(other) => panic!("unexpected cursor {other}"),
        }
    }

    let app = Router::new().route("/api/threads", get(list_threads));
    let addr = common::spawn_server(app).await;
    let session = make_session(addr).await;

    session.hydrate_threads(Some(1)).await.expect("hydrate");

    let snapshot = session.store().snapshot().await;
    let ids: Vec<&str> = snapshot.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["t1", "t2"]);
}
