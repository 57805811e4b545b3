// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote job API: paths, bodies, and typed calls.
//!
//! Job calls go through the [`RequestGateway`] so they pick up bearer auth
//! and renewal. Session calls (`refresh_session`, `sign_in`) use a bare
//! client because they are what the gateway falls back on.

use serde::{Deserialize, Serialize};

use crate::credential::Credential;
use crate::error::{ClientError, RenewalFailed};
use crate::events::{clamp_percent, JobId, ProgressEvent, ProgressStatus};
use crate::gateway::{ApiRequest, RequestGateway};

pub const JOBS_PATH: &str = "/api/jobs";
pub const REFRESH_PATH: &str = "/api/auth/refresh";
pub const LOGIN_PATH: &str = "/api/auth/login";

pub fn job_status_path(job_id: &str) -> String {
    format!("{JOBS_PATH}/{job_id}/status")
}

#[derive(Debug, Serialize)]
struct CreateJobRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: JobId,
}

/// Body of `GET /api/jobs/{id}/status`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: ProgressStatus,
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub seq: Option<u64>,
}

impl JobStatusResponse {
    pub fn into_progress(self, received_at: u64) -> ProgressEvent {
        let percent = match self.status {
            ProgressStatus::Completed => 100,
            _ => clamp_percent(self.percent),
        };
        let message = match self.status {
            ProgressStatus::Failed => self.error.or(self.message),
            _ => self.message,
        };
        ProgressEvent {
            job_id: self.job_id,
            status: self.status,
            percent,
            message,
            result_url: self.result_url,
            timestamp: self.timestamp.unwrap_or(received_at),
            seq: self.seq,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Token pair returned by refresh and login.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// `POST /api/jobs`: start a generation job.
pub async fn create_job(gateway: &RequestGateway, prompt: &str) -> Result<JobId, ClientError> {
    let request = ApiRequest::post(JOBS_PATH, &CreateJobRequest { prompt })?;
    let resp: CreateJobResponse = gateway.send(&request).await?.json()?;
    tracing::info!(job_id = %resp.job_id, "job created");
    Ok(resp.job_id)
}

/// `GET /api/jobs/{id}/status`: fetch one status snapshot.
pub async fn get_job_status(
    gateway: &RequestGateway,
    job_id: &str,
) -> Result<ProgressEvent, ClientError> {
    let request = ApiRequest::get(job_status_path(job_id));
    let resp: JobStatusResponse = gateway.send(&request).await?.json()?;
    if resp.job_id != job_id {
        return Err(ClientError::Decode(format!(
            "status for {} returned for job {job_id}",
            resp.job_id
        )));
    }
    Ok(resp.into_progress(crate::events::epoch_ms()))
}

/// `POST /api/auth/refresh`: exchange a refresh token for a new pair.
pub async fn refresh_session(
    http: &reqwest::Client,
    base_url: &str,
    refresh_token: &str,
) -> Result<TokenResponse, RenewalFailed> {
    let resp = http
        .post(format!("{}{REFRESH_PATH}", base_url.trim_end_matches('/')))
        .json(&RefreshRequest { refresh_token })
        .send()
        .await
        .map_err(|e| RenewalFailed::Network(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), body = %body, "refresh rejected");
        return Err(RenewalFailed::Rejected { status: status.as_u16() });
    }

    resp.json().await.map_err(|e| RenewalFailed::Network(format!("parse response: {e}")))
}

/// `POST /api/auth/login`: initial sign-in with email and password.
pub async fn sign_in(
    http: &reqwest::Client,
    base_url: &str,
    email: &str,
    password: &str,
) -> Result<Credential, ClientError> {
    let resp = http
        .post(format!("{}{LOGIN_PATH}", base_url.trim_end_matches('/')))
        .json(&LoginRequest { email, password })
        .send()
        .await?;

    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(ClientError::Status { status: status.as_u16(), body });
    }

    let token: TokenResponse =
        serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))?;
    let refresh_token = token
        .refresh_token
        .ok_or_else(|| ClientError::Decode("login response has no refreshToken".into()))?;
    Ok(Credential { access_token: token.access_token, refresh_token })
}
