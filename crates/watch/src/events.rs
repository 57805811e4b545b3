// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Progress event types and event-server wire parsing.
//!
//! Both channels normalize what they receive into [`ProgressEvent`]. The push
//! channel's inbound messages are a tagged union ([`ChannelEvent`]) keyed on
//! the `event` field; anything that does not match is dropped by the caller.

use serde::{Deserialize, Serialize};

/// Server-issued job identifier.
pub type JobId = String;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    #[serde(alias = "pending")]
    Queued,
    #[serde(alias = "running")]
    Processing,
    Completed,
    Failed,
}

impl ProgressStatus {
    /// `completed` and `failed` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub status: ProgressStatus,
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    /// Epoch millis; server-supplied when available, else receipt time.
    pub timestamp: u64,
    /// Server sequence number, when the server provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl ProgressEvent {
    pub fn new(
        job_id: impl Into<JobId>,
        status: ProgressStatus,
        percent: u8,
        timestamp: u64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            percent: percent.min(100),
            message: None,
            result_url: None,
            timestamp,
            seq: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_result_url(mut self, url: impl Into<String>) -> Self {
        self.result_url = Some(url.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `self` is strictly newer than `other`.
    ///
    /// Sequence numbers win when both carry one; otherwise timestamps decide.
    pub fn is_newer_than(&self, other: &ProgressEvent) -> bool {
        match (self.seq, other.seq) {
            (Some(a), Some(b)) => a > b,
            _ => self.timestamp > other.timestamp,
        }
    }

    /// Same observable content, ignoring ordering fields.
    pub fn same_content(&self, other: &ProgressEvent) -> bool {
        self.status == other.status
            && self.percent == other.percent
            && self.message == other.message
            && self.result_url == other.result_url
    }
}

/// Which channel delivered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Push,
    Poll,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll => "poll",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event tagged with the channel that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source: Source,
    pub event: ProgressEvent,
}

// -- Event server wire format ------------------------------------------------

/// Inbound event-server messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event")]
pub enum ChannelEvent {
    #[serde(rename = "job:started")]
    Started(WirePayload),
    #[serde(rename = "job:progress")]
    Progress(WirePayload),
    #[serde(rename = "job:completed")]
    Completed(WirePayload),
    #[serde(rename = "job:failed")]
    Failed(WirePayload),
    #[serde(rename = "job:queue")]
    QueueUpdate(WirePayload),
}

/// Fields shared by every job event on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePayload {
    pub job_id: JobId,
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub position: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub seq: Option<u64>,
}

impl ChannelEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Started(p)
            | Self::Progress(p)
            | Self::Completed(p)
            | Self::Failed(p)
            | Self::QueueUpdate(p) => &p.job_id,
        }
    }

    /// Map to a [`ProgressEvent`], stamping `received_at` when the server sent
    /// no timestamp.
    pub fn into_progress(self, received_at: u64) -> ProgressEvent {
        let (status, p) = match self {
            Self::Started(p) | Self::Progress(p) => (ProgressStatus::Processing, p),
            Self::Completed(p) => (ProgressStatus::Completed, p),
            Self::Failed(p) => (ProgressStatus::Failed, p),
            Self::QueueUpdate(p) => (ProgressStatus::Queued, p),
        };
        let percent = match status {
            ProgressStatus::Completed => 100,
            _ => clamp_percent(p.percent),
        };
        let message = match status {
            ProgressStatus::Failed => p.error.or(p.message),
            ProgressStatus::Queued => {
                p.message.or_else(|| p.position.map(|n| format!("queue position {n}")))
            }
            _ => p.message,
        };
        ProgressEvent {
            job_id: p.job_id,
            status,
            percent,
            message,
            result_url: p.result_url,
            timestamp: p.timestamp.unwrap_or(received_at),
            seq: p.seq,
        }
    }
}

/// Parse one text frame from the event server.
pub fn parse_channel_message(text: &str) -> Result<ChannelEvent, serde_json::Error> {
    serde_json::from_str(text)
}

/// Control messages sent to the event server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    Unsubscribe {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
}

/// Round and clamp a wire percentage into 0..=100.
pub fn clamp_percent(percent: Option<f64>) -> u8 {
    match percent {
        Some(p) if p.is_finite() => p.round().clamp(0.0, 100.0) as u8,
        _ => 0,
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
