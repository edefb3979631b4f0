// ABOUTME: Structured logging setup for the chat client core
// ABOUTME: Configures tracing-subscriber with env-filter overrides and a pretty or compact formatter
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # Logging
//!
//! One-shot `tracing` initialization for binaries and long-running embedders.
//! Library code only ever emits through the `tracing` macros; installing a
//! subscriber is the host's decision, so calling [`init_logging`] is optional
//! and tests simply skip it.

use std::env;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "info,palaver=debug";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directives (`RUST_LOG` syntax)
    pub filter: String,
    /// Use the compact single-line formatter instead of the pretty one
    pub compact: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_owned(),
            compact: false,
        }
    }
}

impl LoggingConfig {
    /// Create logging configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            filter: env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_owned()),
            compact: env::var("LOG_FORMAT").as_deref() == Ok("compact"),
        }
    }
}

/// Install the global tracing subscriber
///
/// Safe to call at most once per process; a second call is a no-op because
/// the global default is already set.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(&config.filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = fmt().with_env_filter(filter).with_target(true);

    let installed = if config.compact {
        builder.compact().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            "palaver client core logging initialized"
        );
    }
}
