// ABOUTME: Authenticated HTTP transport with transparent bearer-token renewal
// ABOUTME: Single-flight refresh deduplication and at-most-once retry after a 401
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # Authenticated Transport
//!
//! [`AuthTransport`] issues every request the crate makes. It resolves
//! relative paths against the configured base URL, attaches the live access
//! token as a bearer authorization header (skipped for the renewal endpoint
//! itself), and handles authorization failures locally:
//!
//! 1. On a 401, if no refresh token is held, the credential pair is cleared
//!    and the failed response is returned as-is.
//! 2. Otherwise the renewal is acquired single-flight: a `tokio::sync::Mutex`
//!    guards the token exchange, and a waiter that acquires the lock after
//!    another caller already renewed (detected via the credential store's
//!    generation counter) reuses the fresh token instead of issuing a second
//!    exchange. Concurrent 401s therefore share exactly one refresh call.
//! 3. On renewal success the original request is retried exactly once; a
//!    per-request marker guarantees no second retry regardless of how many
//!    401s follow.
//! 4. On renewal failure the pair is cleared and the original failed
//!    response is returned.

use std::sync::Arc;

use reqwest::{header, Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::auth::CredentialStore;
use crate::config::ClientConfig;
use crate::errors::{ClientError, ClientResult};

/// Renewal endpoint, relative to the API base
const REFRESH_PATH: &str = "auth/refresh";

/// Renewal request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: String,
}

/// Renewal response body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
}

/// Authenticated HTTP transport shared by all collaborator adapters
pub struct AuthTransport {
    client: Client,
    api_base: Url,
    request_timeout: std::time::Duration,
    credentials: Arc<CredentialStore>,
    renewal: Mutex<()>,
}

impl AuthTransport {
    /// Create a transport from the client configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &ClientConfig, credentials: Arc<CredentialStore>) -> ClientResult<Self> {
        // No client-wide total timeout: streaming responses outlive any fixed
        // deadline. Non-streaming requests get the timeout per-request.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            request_timeout: config.request_timeout,
            credentials,
            renewal: Mutex::new(()),
        })
    }

    /// Credential store backing this transport
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Issue a JSON request, renewing credentials on a 401 as described in
    /// the module docs
    ///
    /// The response is returned whatever its status; callers decode success
    /// and map failure statuses themselves.
    ///
    /// # Errors
    ///
    /// Returns an error only for connection-level failures; HTTP error
    /// statuses are returned inside the `Response`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> ClientResult<Response> {
        self.execute(method, path, body, None, true).await
    }

    /// Issue a streaming request (`Accept: text/event-stream`, no overall
    /// request timeout) with the same authorization handling as
    /// [`request`](Self::request)
    ///
    /// # Errors
    ///
    /// Returns an error only for connection-level failures.
    pub async fn request_stream(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> ClientResult<Response> {
        self.execute(method, path, body, Some("text/event-stream"), false)
            .await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        accept: Option<&'static str>,
        bounded: bool,
    ) -> ClientResult<Response> {
        let url = self.resolve_url(path)?;
        let is_refresh = url.path().ends_with(REFRESH_PATH);
        let mut retried = false;

        loop {
            // The generation is read before sending so that, if this request
            // fails with a 401, we can tell whether the pair it was sent with
            // is still the current one when we reach the renewal lock.
            let generation = self.credentials.generation();

            let mut builder = self.client.request(method.clone(), url.clone());
            if bounded {
                builder = builder.timeout(self.request_timeout);
            }
            if let Some(accept) = accept {
                builder = builder.header(header::ACCEPT, accept);
            }
            if !is_refresh {
                if let Some(token) = self.credentials.access_token().await {
                    builder = builder.bearer_auth(token);
                }
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;

            if response.status() != StatusCode::UNAUTHORIZED || is_refresh {
                return Ok(response);
            }

            // The renewed token was rejected too; the pair is unusable and a
            // second retry would loop.
            if retried {
                if let Err(e) = self.credentials.clear().await {
                    warn!(error = %e, "failed to clear credentials after retried 401");
                }
                return Ok(response);
            }

            if self.credentials.refresh_token().await.is_none() {
                if let Err(e) = self.credentials.clear().await {
                    warn!(error = %e, "failed to clear credentials after 401");
                }
                return Ok(response);
            }

            if !self.renew(generation).await {
                return Ok(response);
            }
            retried = true;
        }
    }

    /// Renew the credential pair, deduplicating concurrent callers
    ///
    /// Returns `true` when a usable access token is held afterwards.
    async fn renew(&self, observed_generation: u64) -> bool {
        let _guard = self.renewal.lock().await;

        // Someone else renewed (or cleared) the pair while we waited for the
        // lock; reuse their outcome instead of burning the refresh token on a
        // duplicate exchange.
        if self.credentials.generation() != observed_generation {
            return self.credentials.access_token().await.is_some();
        }

        let Some(refresh_token) = self.credentials.refresh_token().await else {
            return false;
        };

        let Ok(url) = self.resolve_url(REFRESH_PATH) else {
            return false;
        };

        debug!("renewing access credentials");
        let outcome = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await;

        let tokens = match outcome {
            Ok(response) if response.status().is_success() => {
                match response.json::<RefreshResponse>().await {
                    Ok(tokens) => tokens,
                    Err(e) => {
                        warn!(error = %e, "credential renewal response malformed");
                        return self.fail_renewal().await;
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "credential renewal rejected");
                return self.fail_renewal().await;
            }
            Err(e) => {
                warn!(error = %e, "credential renewal request failed");
                return self.fail_renewal().await;
            }
        };

        if let Err(e) = self
            .credentials
            .set_tokens(tokens.access_token, tokens.refresh_token)
            .await
        {
            warn!(error = %e, "failed to persist renewed credentials");
        }
        true
    }

    async fn fail_renewal(&self) -> bool {
        if let Err(e) = self.credentials.clear().await {
            warn!(error = %e, "failed to clear credentials after renewal failure");
        }
        false
    }

    /// Resolve a path against the API base; absolute URLs pass through
    fn resolve_url(&self, path: &str) -> ClientResult<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path)
                .map_err(|e| ClientError::transport(format!("invalid URL {path:?}: {e}")));
        }

        self.api_base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::transport(format!("invalid request path {path:?}: {e}")))
    }
}
