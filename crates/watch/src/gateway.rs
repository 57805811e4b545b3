// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound request gateway with bearer auth and retry-after-renewal.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::credential::renewal::RenewalCoordinator;
use crate::credential::CredentialStore;
use crate::error::ClientError;
use crate::signal::SignalHub;

/// A replayable API request.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: Method::GET, path: path.into(), body: None }
    }

    pub fn post(path: impl Into<String>, body: &impl Serialize) -> Result<Self, ClientError> {
        let body = serde_json::to_value(body).map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(Self { method: Method::POST, path: path.into(), body: Some(body) })
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_str(&self.body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

/// Sends API requests with the current access token, renewing once on 401.
pub struct RequestGateway {
    http: Client,
    base_url: String,
    store: Arc<CredentialStore>,
    renewal: Arc<RenewalCoordinator>,
    signals: Arc<SignalHub>,
}

impl RequestGateway {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        store: Arc<CredentialStore>,
        renewal: Arc<RenewalCoordinator>,
        signals: Arc<SignalHub>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { http, base_url, store, renewal, signals }
    }

    /// Send `request`.
    ///
    /// A 401 triggers (or joins) a renewal and one retry with the renewed
    /// credential. A failed renewal or a second 401 ends the session with
    /// [`ClientError::SessionExpired`]. Other non-2xx statuses come back as
    /// [`ClientError::Status`] untouched.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let token = self.store.access_token();

        let first = self.execute(request, token.as_deref(), &request_id).await?;
        if first.status != StatusCode::UNAUTHORIZED.as_u16() {
            return into_result(first);
        }

        tracing::debug!(
            request_id = %request_id,
            path = %request.path,
            "unauthorized, renewing session"
        );
        let credential = match self.renewal.renew_after_rejection(token.as_deref()).await {
            Ok(c) => c,
            Err(e) => {
                let err = ClientError::from(e);
                tracing::debug!(
                    request_id = %request_id,
                    code = %err.code(),
                    err = %err,
                    "renewal failed"
                );
                self.expire_session();
                return Err(ClientError::SessionExpired);
            }
        };

        let retry = self.execute(request, Some(&credential.access_token), &request_id).await?;
        if retry.status == StatusCode::UNAUTHORIZED.as_u16() {
            tracing::debug!(
                request_id = %request_id,
                path = %request.path,
                code = %ClientError::SessionExpired.code(),
                "still unauthorized after renewal"
            );
            self.expire_session();
            return Err(ClientError::SessionExpired);
        }
        into_result(retry)
    }

    async fn execute(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
        request_id: &str,
    ) -> Result<ApiResponse, ClientError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder =
            self.http.request(request.method.clone(), url).header("x-request-id", request_id);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            let err = ClientError::TransientNetwork(e.to_string());
            tracing::debug!(
                request_id = %request_id,
                path = %request.path,
                code = %err.code(),
                err = %e,
                "request failed"
            );
            err
        })?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| ClientError::TransientNetwork(e.to_string()))?;
        Ok(ApiResponse { status, body })
    }

    /// Clear credentials and tell the UI to sign in again (once).
    fn expire_session(&self) {
        self.store.clear();
        self.signals.sign_in_required();
    }
}

/// Build the HTTP client shared by the gateway and the session endpoints.
///
/// reqwest is built without a bundled TLS provider, so the ring provider is
/// installed process-wide first (a no-op if one is already set).
pub fn http_client(timeout: Duration) -> Result<Client, ClientError> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ClientError::TransientNetwork(format!("build http client: {e}")))
}

fn into_result(resp: ApiResponse) -> Result<ApiResponse, ClientError> {
    if (200..300).contains(&resp.status) {
        Ok(resp)
    } else {
        Err(ClientError::Status { status: resp.status, body: resp.body })
    }
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
