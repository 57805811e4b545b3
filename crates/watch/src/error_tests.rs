// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn status(code: u16) -> ClientError {
    ClientError::Status { status: code, body: String::new() }
}

#[yare::parameterized(
    network = { ClientError::TransientNetwork("reset".into()), true },
    server_error = { status(500), true },
    bad_gateway = { status(502), true },
    request_timeout = { status(408), true },
    rate_limited = { status(429), true },
    not_found = { status(404), false },
    forbidden = { status(403), false },
    session_expired = { ClientError::SessionExpired, false },
    renewal_failed = { ClientError::RenewalFailed(RenewalFailed::NoRefreshToken), false },
    decode = { ClientError::Decode("eof".into()), false },
)]
fn is_transient(err: ClientError, expected: bool) {
    assert_eq!(err.is_transient(), expected);
}

#[yare::parameterized(
    network = { ClientError::TransientNetwork("x".into()), ErrorCode::TransientNetwork },
    expired = { ClientError::SessionExpired, ErrorCode::SessionExpired },
    renewal = { ClientError::RenewalFailed(RenewalFailed::Aborted), ErrorCode::SessionExpired },
    upstream = { status(500), ErrorCode::Upstream },
    decode = { ClientError::Decode("x".into()), ErrorCode::Decode },
)]
fn error_code(err: ClientError, expected: ErrorCode) {
    assert_eq!(err.code(), expected);
}

#[test]
fn status_display_keeps_body() {
    let err = ClientError::Status { status: 422, body: "prompt too long".into() };
    assert_eq!(err.to_string(), "HTTP 422: prompt too long");
}

#[test]
fn renewal_failure_converts_into_client_error() {
    let err: ClientError = RenewalFailed::Rejected { status: 401 }.into();
    assert!(matches!(err, ClientError::RenewalFailed(RenewalFailed::Rejected { status: 401 })));
    assert_eq!(err.code().as_str(), "SESSION_EXPIRED");
}
