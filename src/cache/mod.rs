// ABOUTME: Durable cache abstraction with pluggable backends
// ABOUTME: Key-value JSON persistence for the conversation list and credential pair
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # Durable Cache
//!
//! Small key-value persistence layer behind the [`CacheStore`] trait. The
//! conversation list and credential pair are read once at startup and
//! written back on every mutation; corrupt or missing entries degrade to
//! empty defaults without failing startup.
//!
//! Two backends ship with the crate:
//! - [`MemoryCache`] — process-local, used by tests and cache-less embedders
//! - [`FileCache`] — a single JSON document on disk under the platform data
//!   directory

mod file;
mod memory;

pub use file::FileCache;
pub use memory::MemoryCache;

use async_trait::async_trait;

use crate::errors::ClientResult;

/// Well-known cache keys
pub mod keys {
    /// Serialized conversation list
    pub const THREADS: &str = "threads:v1";
    /// Serialized credential pair
    pub const AUTH: &str = "auth:v1";
}

/// Pluggable key-value persistence backend
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a value; `Ok(None)` when the key is absent
    async fn get(&self, key: &str) -> ClientResult<Option<serde_json::Value>>;

    /// Write a value, replacing any previous entry
    async fn set(&self, key: &str, value: serde_json::Value) -> ClientResult<()>;

    /// Remove a key; absent keys are not an error
    async fn remove(&self, key: &str) -> ClientResult<()>;
}
