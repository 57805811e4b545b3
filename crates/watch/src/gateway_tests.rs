// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::credential::Credential;
use crate::signal::SessionSignal;
use crate::test_support::{MockApi, MockApiConfig, RefreshBehavior};

struct Harness {
    gateway: Arc<RequestGateway>,
    store: Arc<CredentialStore>,
    renewal: Arc<RenewalCoordinator>,
    signals: Arc<SignalHub>,
}

fn harness(api: &MockApi, credential: Option<Credential>) -> anyhow::Result<Harness> {
    let http = http_client(Duration::from_secs(5))?;
    let store = Arc::new(CredentialStore::new());
    if let Some(c) = credential {
        store.set(c);
    }
    let renewal =
        Arc::new(RenewalCoordinator::new(http.clone(), api.base_url(), Arc::clone(&store)));
    let signals = Arc::new(SignalHub::new());
    let gateway = Arc::new(RequestGateway::new(
        http,
        api.base_url(),
        Arc::clone(&store),
        Arc::clone(&renewal),
        Arc::clone(&signals),
    ));
    Ok(Harness { gateway, store, renewal, signals })
}

#[tokio::test]
async fn valid_token_passes_through() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig::default()).await?;
    let h = harness(&api, Some(Credential::new("access-0", "refresh-0")))?;

    let resp = h.gateway.send(&ApiRequest::get("/api/protected")).await?;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.json::<serde_json::Value>()?["ok"], true);
    assert_eq!(api.refresh_calls(), 0);
    assert_eq!(api.seen_tokens(), vec![Some("access-0".to_owned())]);
    Ok(())
}

#[tokio::test]
async fn unauthorized_renews_and_retries_once() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig::default()).await?;
    let h = harness(&api, Some(Credential::new("expired", "refresh-0")))?;

    let resp = h.gateway.send(&ApiRequest::get("/api/protected")).await?;
    assert_eq!(resp.status, 200);
    assert_eq!(api.refresh_calls(), 1);
    assert_eq!(
        api.seen_tokens(),
        vec![Some("expired".to_owned()), Some("access-1".to_owned())]
    );
    assert_eq!(h.store.get(), Some(Credential::new("access-1", "refresh-1")));

    // Both attempts carry the same request id.
    let ids = api.request_ids();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], ids[1]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unauthorized_requests_share_one_renewal() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig {
        refresh_delay: Duration::from_millis(100),
        ..Default::default()
    })
    .await?;
    let h = harness(&api, Some(Credential::new("expired", "refresh-0")))?;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let gateway = Arc::clone(&h.gateway);
        tasks.push(tokio::spawn(async move {
            gateway.send(&ApiRequest::get("/api/protected")).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await??.status, 200);
    }

    assert_eq!(api.refresh_calls(), 1);
    assert_eq!(h.renewal.attempts(), 1);
    let retried: Vec<_> = api
        .seen_tokens()
        .into_iter()
        .filter(|t| t.as_deref() == Some("access-1"))
        .collect();
    assert_eq!(retried.len(), 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_renewal_expires_session_once() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig {
        refresh: RefreshBehavior::Reject,
        refresh_delay: Duration::from_millis(50),
        ..Default::default()
    })
    .await?;
    let h = harness(&api, Some(Credential::new("expired", "refresh-0")))?;
    let mut signals = h.signals.subscribe();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let gateway = Arc::clone(&h.gateway);
        tasks.push(tokio::spawn(async move {
            gateway.send(&ApiRequest::get("/api/protected")).await
        }));
    }
    for task in tasks {
        assert!(matches!(task.await?, Err(ClientError::SessionExpired)));
    }

    assert_eq!(api.refresh_calls(), 1);
    assert!(h.store.get().is_none());
    assert_eq!(signals.try_recv()?, SessionSignal::SignInRequired);
    assert!(signals.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn second_unauthorized_after_renewal_expires_session() -> anyhow::Result<()> {
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    // Refresh succeeds but the protected route never accepts anything.
    let app = Router::new()
        .route(
            "/api/auth/refresh",
            post(|| async { Json(serde_json::json!({"accessToken": "a2", "refreshToken": "r2"})) }),
        )
        .route("/api/protected", get(|| async { AxumStatus::UNAUTHORIZED }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await.ok() });

    let base = format!("http://{addr}");
    let http = http_client(Duration::from_secs(5))?;
    let store = Arc::new(CredentialStore::new());
    store.set(Credential::new("a1", "r1"));
    let renewal = Arc::new(RenewalCoordinator::new(http.clone(), base.clone(), Arc::clone(&store)));
    let signals = Arc::new(SignalHub::new());
    let mut rx = signals.subscribe();
    let gateway = RequestGateway::new(http, base, Arc::clone(&store), renewal, signals);

    let err = gateway.send(&ApiRequest::get("/api/protected")).await;
    assert!(matches!(err, Err(ClientError::SessionExpired)));
    assert!(store.get().is_none());
    assert_eq!(rx.try_recv()?, SessionSignal::SignInRequired);
    Ok(())
}

#[tokio::test]
async fn server_error_is_returned_untouched() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig::default()).await?;
    let h = harness(&api, Some(Credential::new("access-0", "refresh-0")))?;

    let err = h.gateway.send(&ApiRequest::get("/api/broken")).await;
    match err {
        Err(ClientError::Status { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => anyhow::bail!("expected status error, got {other:?}"),
    }
    assert_eq!(api.refresh_calls(), 0);
    assert!(h.store.is_signed_in());
    Ok(())
}

#[tokio::test]
async fn signed_out_request_has_no_bearer() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig::default()).await?;
    let h = harness(&api, None)?;

    let resp = h.gateway.send(&ApiRequest::get("/api/open")).await?;
    assert_eq!(resp.status, 200);
    assert_eq!(api.seen_tokens(), vec![None]);
    Ok(())
}

#[tokio::test]
async fn unreachable_server_is_transient() -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let http = http_client(Duration::from_secs(2))?;
    let store = Arc::new(CredentialStore::new());
    let base = format!("http://{addr}");
    let renewal = Arc::new(RenewalCoordinator::new(http.clone(), base.clone(), Arc::clone(&store)));
    let gateway = RequestGateway::new(http, base, store, renewal, Arc::new(SignalHub::new()));

    let err = gateway.send(&ApiRequest::get("/api/protected")).await;
    match err {
        Err(e) => assert!(e.is_transient(), "{e}"),
        Ok(resp) => anyhow::bail!("unexpected response {}", resp.status),
    }
    Ok(())
}
