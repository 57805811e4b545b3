// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use crate::push::ReconnectPolicy;

/// Configuration for a thumbwatch client session.
#[derive(Debug, Clone, clap::Args)]
pub struct ClientConfig {
    /// Base URL of the job API.
    #[arg(long, default_value = "http://127.0.0.1:8000", env = "THUMBWATCH_API_URL")]
    pub api_url: String,

    /// WebSocket URL of the event server. Derived from `--api-url` when unset.
    #[arg(long, env = "THUMBWATCH_WS_URL")]
    pub ws_url: Option<String>,

    /// Upper bound for each outbound request in milliseconds.
    #[arg(long, default_value_t = 15000, env = "THUMBWATCH_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Job status poll interval in milliseconds.
    #[arg(
        long,
        default_value_t = 2000,
        env = "THUMBWATCH_POLL_INTERVAL_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_interval_ms: u64,

    /// Consecutive poll failures before signalling degraded polling.
    #[arg(long, default_value_t = 5, env = "THUMBWATCH_MAX_POLL_FAILURES")]
    pub max_poll_failures: u32,

    /// Reconnect attempts before the push channel gives up.
    #[arg(long, default_value_t = 5, env = "THUMBWATCH_RECONNECT_ATTEMPTS")]
    pub reconnect_attempts: u32,

    /// First reconnect delay in milliseconds (doubles per attempt).
    #[arg(long, default_value_t = 500, env = "THUMBWATCH_RECONNECT_INITIAL_BACKOFF_MS")]
    pub reconnect_initial_backoff_ms: u64,

    /// Reconnect delay cap in milliseconds.
    #[arg(long, default_value_t = 10000, env = "THUMBWATCH_RECONNECT_MAX_BACKOFF_MS")]
    pub reconnect_max_backoff_ms: u64,

    /// How long finished or abandoned job records stay readable, in milliseconds.
    #[arg(long, default_value_t = 30000, env = "THUMBWATCH_RECORD_GRACE_MS")]
    pub record_grace_ms: u64,

    /// Record sweep interval in milliseconds.
    #[arg(
        long,
        default_value_t = 5000,
        env = "THUMBWATCH_SWEEP_INTERVAL_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub sweep_interval_ms: u64,

    /// Path of the persisted credential file.
    #[arg(long, env = "THUMBWATCH_CREDENTIAL_FILE")]
    pub credential_file: Option<PathBuf>,
}

impl ClientConfig {
    /// Config pointing at `api_url` with every other field at its default.
    pub fn with_api_url(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ws_url: None,
            request_timeout_ms: 15000,
            poll_interval_ms: 2000,
            max_poll_failures: 5,
            reconnect_attempts: 5,
            reconnect_initial_backoff_ms: 500,
            reconnect_max_backoff_ms: 10000,
            record_grace_ms: 30000,
            sweep_interval_ms: 5000,
            credential_file: None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn record_grace(&self) -> Duration {
        Duration::from_millis(self.record_grace_ms)
    }

    /// Never zero, so it is always a valid timer period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            initial_backoff: Duration::from_millis(self.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.reconnect_max_backoff_ms),
        }
    }

    /// Event server URL: explicit `--ws-url`, else `{api_url}/ws` with a ws scheme.
    pub fn ws_endpoint(&self) -> String {
        match &self.ws_url {
            Some(url) => url.clone(),
            None => format!("{}/ws", to_ws_scheme(self.api_url.trim_end_matches('/'))),
        }
    }
}

/// Convert `http(s)://` to `ws(s)://`. Other schemes pass through.
pub fn to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_owned()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
