// ABOUTME: Runtime configuration for the chat client core
// ABOUTME: Environment-variable parsing with validated defaults for API base, timeouts, and cache location
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # Client Configuration
//!
//! Deployment-specific settings resolved once at startup. Everything has a
//! development-friendly default so `ClientConfig::from_env()` never fails on
//! a blank environment — only on values that are present but invalid.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::errors::{ClientError, ClientResult};

/// Environment variable for the API base URL
const API_BASE_ENV: &str = "PALAVER_API_BASE";

/// Environment variable for the stream idle threshold (seconds)
const IDLE_TIMEOUT_ENV: &str = "PALAVER_IDLE_TIMEOUT_SECS";

/// Environment variable overriding the durable cache file location
const CACHE_FILE_ENV: &str = "PALAVER_CACHE_FILE";

/// Default API base for local development
const DEFAULT_API_BASE: &str = "http://localhost:8080/api";

/// Default idle threshold between stream frames
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Connection timeout for API requests
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Overall timeout for non-streaming API requests
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Name of the cache file placed under the platform data directory
const CACHE_FILE_NAME: &str = "palaver-cache.json";

/// Client configuration resolved at startup
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL all relative request paths are resolved against.
    /// Normalized to a trailing slash so `Url::join` appends instead of
    /// replacing the final path segment.
    pub api_base: Url,
    /// Idle threshold for streaming sessions; the stream errors out with a
    /// timeout if no frame arrives within this window
    pub idle_timeout: Duration,
    /// TCP connect timeout for API requests
    pub connect_timeout: Duration,
    /// Overall request timeout for non-streaming requests
    pub request_timeout: Duration,
    /// Durable cache file; `None` disables file persistence (memory-only)
    pub cache_file: Option<PathBuf>,
}

impl ClientConfig {
    /// Build a configuration from an explicit base URL with default timeouts
    ///
    /// # Errors
    ///
    /// Returns an error if `api_base` is not a valid absolute URL.
    pub fn new(api_base: &str) -> ClientResult<Self> {
        Ok(Self {
            api_base: parse_base(api_base)?,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            cache_file: default_cache_file(),
        })
    }

    /// Create a configuration from environment variables
    ///
    /// Reads:
    /// - `PALAVER_API_BASE`: API base URL (default: localhost development server)
    /// - `PALAVER_IDLE_TIMEOUT_SECS`: stream idle threshold (default: 30)
    /// - `PALAVER_CACHE_FILE`: durable cache path (default: platform data dir)
    ///
    /// # Errors
    ///
    /// Returns an error if a provided value fails to parse.
    pub fn from_env() -> ClientResult<Self> {
        let base = env::var(API_BASE_ENV).unwrap_or_else(|_| DEFAULT_API_BASE.to_owned());

        let idle_timeout = match env::var(IDLE_TIMEOUT_ENV) {
            Ok(raw) => Duration::from_secs(raw.parse::<u64>().map_err(|_| {
                ClientError::config(format!("{IDLE_TIMEOUT_ENV} must be an integer, got {raw:?}"))
            })?),
            Err(_) => Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        };

        let cache_file = env::var(CACHE_FILE_ENV)
            .ok()
            .map(PathBuf::from)
            .or_else(default_cache_file);

        Ok(Self {
            api_base: parse_base(&base)?,
            idle_timeout,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            cache_file,
        })
    }

    /// Override the idle threshold (primarily for tests and embedders)
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Disable file persistence, keeping all cached state in memory
    #[must_use]
    pub fn without_cache_file(mut self) -> Self {
        self.cache_file = None;
        self
    }
}

/// Parse and normalize the base URL to a trailing slash
fn parse_base(raw: &str) -> ClientResult<Url> {
    let normalized = format!("{}/", raw.trim_end_matches('/'));
    Url::parse(&normalized)
        .map_err(|e| ClientError::config(format!("invalid API base {raw:?}: {e}")))
}

/// Default cache file under the platform data directory
fn default_cache_file() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("palaver").join(CACHE_FILE_NAME))
}
