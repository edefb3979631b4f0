// ABOUTME: Bearer credential pair state with durable persistence
// ABOUTME: Loaded once at startup, replaced atomically on renewal, cleared on unrecoverable failure
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # Credential Store
//!
//! Process-scoped holder of the `{access_token, refresh_token}` pair. Exactly
//! one live copy is authoritative; every request reads it at call time rather
//! than caching per-request. The store persists each change to the durable
//! cache under [`crate::cache::keys::AUTH`] so a restart resumes the session.
//!
//! A monotonically increasing generation counter accompanies the pair. The
//! transport uses it to detect that another caller already renewed the pair
//! while it was waiting on the renewal lock — the heart of single-flight
//! deduplication (see [`crate::transport`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::cache::{keys, CacheStore};
use crate::errors::ClientResult;

/// The bearer credential pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    /// Short-lived access token attached to requests as `Authorization: Bearer`
    pub access_token: Option<String>,
    /// Long-lived token exchanged for a fresh access token on expiry
    pub refresh_token: Option<String>,
}

impl CredentialPair {
    /// Whether an access token is present
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }
}

/// Process-scoped credential state with durable persistence
pub struct CredentialStore {
    cache: Arc<dyn CacheStore>,
    state: RwLock<CredentialPair>,
    generation: AtomicU64,
}

impl CredentialStore {
    /// Load the credential pair from the durable cache
    ///
    /// A missing or corrupt entry degrades to an empty (unauthenticated)
    /// pair without failing startup.
    pub async fn load(cache: Arc<dyn CacheStore>) -> Self {
        let pair = match cache.get(keys::AUTH).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(error = %e, "stored credential pair corrupt, starting unauthenticated");
                CredentialPair::default()
            }),
            Ok(None) => CredentialPair::default(),
            Err(e) => {
                warn!(error = %e, "credential cache read failed, starting unauthenticated");
                CredentialPair::default()
            }
        };

        Self {
            cache,
            state: RwLock::new(pair),
            generation: AtomicU64::new(0),
        }
    }

    /// Current access token, if any
    pub async fn access_token(&self) -> Option<String> {
        self.state.read().await.access_token.clone()
    }

    /// Current refresh token, if any
    pub async fn refresh_token(&self) -> Option<String> {
        self.state.read().await.refresh_token.clone()
    }

    /// Whether an access token is currently held
    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.is_authenticated()
    }

    /// Generation counter; bumped on every [`set_tokens`](Self::set_tokens)
    /// and [`clear`](Self::clear)
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Atomically replace the pair after a successful renewal
    ///
    /// When the server supplies no new refresh token the prior one is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the new pair to the cache fails; the
    /// in-memory pair is replaced regardless so requests keep working.
    pub async fn set_tokens(
        &self,
        access_token: String,
        refresh_token: Option<String>,
    ) -> ClientResult<()> {
        let next = {
            let mut state = self.state.write().await;
            state.access_token = Some(access_token);
            if let Some(refresh) = refresh_token {
                state.refresh_token = Some(refresh);
            }
            state.clone()
        };
        self.generation.fetch_add(1, Ordering::AcqRel);
        debug!("credential pair replaced");

        self.cache.set(keys::AUTH, serde_json::to_value(&next)?).await
    }

    /// Atomically clear the pair after an unrecoverable authorization failure
    ///
    /// The cleared pair is the signal for the embedding application to treat
    /// the session as unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns an error if removing the cache entry fails; the in-memory
    /// pair is cleared regardless.
    pub async fn clear(&self) -> ClientResult<()> {
        {
            let mut state = self.state.write().await;
            *state = CredentialPair::default();
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        debug!("credential pair cleared");

        self.cache.remove(keys::AUTH).await
    }
}
