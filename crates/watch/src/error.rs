// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors surfaced by the request gateway and the channels built on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Connection failure or timeout. Retried by pollers and reconnect loops.
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    /// Renewal failed, or the retry after renewal was still unauthorized.
    #[error("session expired")]
    SessionExpired,
    /// Renewal round trip failed. Never escapes the gateway.
    #[error("session renewal failed: {0}")]
    RenewalFailed(#[from] RenewalFailed),
    /// Non-success status passed through unmodified.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// Response body did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ClientError {
    /// Whether the next poll tick or reconnect attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::SessionExpired | Self::RenewalFailed(_) | Self::Decode(_) => false,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TransientNetwork(_) => ErrorCode::TransientNetwork,
            Self::SessionExpired | Self::RenewalFailed(_) => ErrorCode::SessionExpired,
            Self::Status { .. } => ErrorCode::Upstream,
            Self::Decode(_) => ErrorCode::Decode,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::TransientNetwork(e.to_string())
        }
    }
}

/// Outcome shared by every caller waiting on the same renewal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewalFailed {
    /// No refresh token to present.
    #[error("no refresh token available")]
    NoRefreshToken,
    /// The server refused the refresh token.
    #[error("refresh token rejected ({status})")]
    Rejected { status: u16 },
    /// The refresh round trip itself failed.
    #[error("refresh request failed: {0}")]
    Network(String),
    /// The renewal task ended without producing an outcome.
    #[error("renewal task aborted")]
    Aborted,
}

/// Machine-readable error codes carried as the `code` field of failure logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    TransientNetwork,
    SessionExpired,
    Upstream,
    Decode,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "TRANSIENT_NETWORK",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Upstream => "UPSTREAM",
            Self::Decode => "DECODE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
