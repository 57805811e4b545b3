// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

// ── parse_channel_message ─────────────────────────────────────────────

#[test]
fn progress_message_maps_to_processing() -> anyhow::Result<()> {
    let text = r#"{"event":"job:progress","jobId":"g1","percent":40,"message":"rendering","timestamp":1000}"#;
    let event = parse_channel_message(text)?.into_progress(5);
    assert_eq!(event.job_id, "g1");
    assert_eq!(event.status, ProgressStatus::Processing);
    assert_eq!(event.percent, 40);
    assert_eq!(event.message.as_deref(), Some("rendering"));
    assert_eq!(event.timestamp, 1000);
    Ok(())
}

#[test]
fn started_defaults_to_zero_percent() -> anyhow::Result<()> {
    let event = parse_channel_message(r#"{"event":"job:started","jobId":"g1"}"#)?.into_progress(7);
    assert_eq!(event.status, ProgressStatus::Processing);
    assert_eq!(event.percent, 0);
    assert_eq!(event.timestamp, 7, "missing timestamp is stamped with receipt time");
    Ok(())
}

#[test]
fn completed_forces_full_percent_and_keeps_result() -> anyhow::Result<()> {
    let text = r#"{"event":"job:completed","jobId":"g1","percent":97,"resultUrl":"https://cdn/x.png","seq":9}"#;
    let event = parse_channel_message(text)?.into_progress(1);
    assert_eq!(event.status, ProgressStatus::Completed);
    assert_eq!(event.percent, 100);
    assert_eq!(event.result_url.as_deref(), Some("https://cdn/x.png"));
    assert_eq!(event.seq, Some(9));
    Ok(())
}

#[test]
fn failed_prefers_error_text() -> anyhow::Result<()> {
    let text = r#"{"event":"job:failed","jobId":"g1","error":"nsfw prompt","message":"failed"}"#;
    let event = parse_channel_message(text)?.into_progress(1);
    assert_eq!(event.status, ProgressStatus::Failed);
    assert_eq!(event.message.as_deref(), Some("nsfw prompt"));
    Ok(())
}

#[test]
fn queue_update_describes_position() -> anyhow::Result<()> {
    let text = r#"{"event":"job:queue","jobId":"g1","position":3}"#;
    let event = parse_channel_message(text)?.into_progress(1);
    assert_eq!(event.status, ProgressStatus::Queued);
    assert_eq!(event.message.as_deref(), Some("queue position 3"));
    Ok(())
}

#[yare::parameterized(
    unknown_event = { r#"{"event":"server:hello"}"# },
    missing_job_id = { r#"{"event":"job:progress","percent":10}"# },
    no_tag = { r#"{"jobId":"g1","percent":10}"# },
    not_json = { "ping" },
    wrong_type = { r#"{"event":"job:progress","jobId":42}"# },
)]
fn unrecognized_shapes_are_errors(text: &str) {
    assert!(parse_channel_message(text).is_err());
}

// ── clamp_percent ─────────────────────────────────────────────────────

#[yare::parameterized(
    none = { None, 0 },
    rounds_down = { Some(40.4), 40 },
    rounds_up = { Some(40.5), 41 },
    negative = { Some(-3.0), 0 },
    overflow = { Some(250.0), 100 },
    nan = { Some(f64::NAN), 0 },
)]
fn clamp_percent_bounds(input: Option<f64>, expected: u8) {
    assert_eq!(clamp_percent(input), expected);
}

// ── ordering ──────────────────────────────────────────────────────────

#[test]
fn sequence_numbers_override_timestamps() {
    let older_clock = ProgressEvent::new("g1", ProgressStatus::Processing, 50, 100).with_seq(5);
    let newer_clock = ProgressEvent::new("g1", ProgressStatus::Processing, 40, 200).with_seq(4);
    assert!(older_clock.is_newer_than(&newer_clock));
    assert!(!newer_clock.is_newer_than(&older_clock));
}

#[test]
fn timestamps_decide_without_sequence() {
    let a = ProgressEvent::new("g1", ProgressStatus::Processing, 40, 100);
    let b = ProgressEvent::new("g1", ProgressStatus::Processing, 30, 100).with_seq(1);
    assert!(!a.is_newer_than(&b), "equal timestamps are not newer");
    assert!(!b.is_newer_than(&a));
}

#[yare::parameterized(
    queued = { ProgressStatus::Queued, false },
    processing = { ProgressStatus::Processing, false },
    completed = { ProgressStatus::Completed, true },
    failed = { ProgressStatus::Failed, true },
)]
fn terminal_statuses(status: ProgressStatus, expected: bool) {
    assert_eq!(status.is_terminal(), expected);
}

#[test]
fn status_aliases_deserialize() -> anyhow::Result<()> {
    let pending: ProgressStatus = serde_json::from_str(r#""pending""#)?;
    let running: ProgressStatus = serde_json::from_str(r#""running""#)?;
    assert_eq!(pending, ProgressStatus::Queued);
    assert_eq!(running, ProgressStatus::Processing);
    Ok(())
}

#[test]
fn client_messages_serialize_with_event_tag() -> anyhow::Result<()> {
    let sub = serde_json::to_value(ClientMessage::Subscribe { job_id: "g1".into() })?;
    assert_eq!(sub, serde_json::json!({"event": "subscribe", "jobId": "g1"}));
    let unsub = serde_json::to_value(ClientMessage::Unsubscribe { job_id: "g1".into() })?;
    assert_eq!(unsub, serde_json::json!({"event": "unsubscribe", "jobId": "g1"}));
    Ok(())
}
