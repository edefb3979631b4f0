// ABOUTME: Shared fixtures for integration tests
// ABOUTME: Ephemeral-port axum servers and SSE body builders
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use axum::Router;
use palaver::auth::CredentialStore;
use palaver::cache::{CacheStore, MemoryCache};
use palaver::config::ClientConfig;
use palaver::transport::AuthTransport;

/// Serve a router on an ephemeral local port
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

/// Client config pointing at a test server, with a short idle timeout
pub fn test_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(&format!("http://{addr}/api"))
        .expect("test config")
        .with_idle_timeout(std::time::Duration::from_millis(500))
}

/// Credential store seeded with the given pair
pub async fn seeded_credentials(
    cache: Arc<MemoryCache>,
    access: Option<&str>,
    refresh: Option<&str>,
) -> Arc<CredentialStore> {
    cache
        .set(
            palaver::cache::keys::AUTH,
            serde_json::json!({ "accessToken": access, "refreshToken": refresh }),
        )
        .await
        .expect("seed credentials");
    Arc::new(CredentialStore::load(cache).await)
}

/// Transport over a fresh memory cache with the given credential pair
pub async fn test_transport(
    addr: SocketAddr,
    access: Option<&str>,
    refresh: Option<&str>,
) -> Arc<AuthTransport> {
    let cache = Arc::new(MemoryCache::new());
    let credentials = seeded_credentials(cache, access, refresh).await;
    Arc::new(AuthTransport::new(&test_config(addr), credentials).expect("transport"))
}

/// An SSE response whose whole body is sent as one chunk
pub fn sse_response(body: impl Into<String>) -> Response {
    Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .body(Body::from(body.into()))
        .expect("sse response")
}

/// An SSE response streamed from pre-cut byte chunks
pub fn sse_response_chunked(chunks: Vec<Vec<u8>>) -> Response {
    let stream = futures_util::stream::iter(
        chunks
            .into_iter()
            .map(|chunk| Ok::<_, std::convert::Infallible>(bytes::Bytes::from(chunk))),
    );
    Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .expect("sse response")
}
