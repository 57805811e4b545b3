// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;
use crate::credential::renewal::RenewalCoordinator;
use crate::credential::{Credential, CredentialStore};
use crate::events::ProgressStatus;
use crate::gateway::http_client;
use crate::test_support::{wait_for, MockApi, MockApiConfig, RefreshBehavior};

const WAIT: Duration = Duration::from_secs(5);
const FAST: Duration = Duration::from_millis(20);

#[yare::parameterized(
    queued = { ProgressStatus::Queued, false },
    processing = { ProgressStatus::Processing, false },
    completed = { ProgressStatus::Completed, true },
    failed = { ProgressStatus::Failed, true },
)]
fn stop_predicate(status: ProgressStatus, expected: bool) {
    assert_eq!(should_stop(&ProgressEvent::new("j", status, 0, 1)), expected);
}

struct Fixture {
    poller: PollFallback,
    feed: mpsc::UnboundedReceiver<Delivery>,
    signals: Arc<SignalHub>,
}

fn fixture(api: &MockApi, token: &str, max_failures: u32) -> anyhow::Result<Fixture> {
    let http = http_client(Duration::from_secs(5))?;
    let store = Arc::new(CredentialStore::new());
    store.set(Credential::new(token, "refresh-0"));
    let renewal =
        Arc::new(RenewalCoordinator::new(http.clone(), api.base_url(), Arc::clone(&store)));
    let signals = Arc::new(SignalHub::new());
    let gateway = Arc::new(RequestGateway::new(
        http,
        api.base_url(),
        store,
        renewal,
        Arc::clone(&signals),
    ));
    let (tx, feed) = mpsc::unbounded_channel();
    let poller = PollFallback::new(gateway, tx, Arc::clone(&signals), FAST, max_failures);
    Ok(Fixture { poller, feed, signals })
}

fn status(state: &str, percent: u8) -> (u16, serde_json::Value) {
    (200, json!({"jobId": "g1", "status": state, "percent": percent}))
}

async fn next_delivery(feed: &mut mpsc::UnboundedReceiver<Delivery>) -> anyhow::Result<Delivery> {
    tokio::time::timeout(WAIT, feed.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("feed closed"))
}

#[tokio::test]
async fn polls_until_terminal_then_stops() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig {
        statuses: vec![
            status("processing", 20),
            status("processing", 60),
            status("completed", 100),
        ],
        ..Default::default()
    })
    .await?;
    let mut f = fixture(&api, "access-0", 5)?;

    assert!(f.poller.start("g1", FAST));

    let mut seen = Vec::new();
    for _ in 0..3 {
        let d = next_delivery(&mut f.feed).await?;
        assert_eq!(d.source, Source::Poll);
        seen.push((d.event.status, d.event.percent));
    }
    assert_eq!(
        seen,
        vec![
            (ProgressStatus::Processing, 20),
            (ProgressStatus::Processing, 60),
            (ProgressStatus::Completed, 100),
        ]
    );

    assert!(wait_for(WAIT, || !f.poller.is_polling("g1")).await);
    tokio::time::sleep(FAST * 5).await;
    assert_eq!(api.status_calls(), 3);
    assert!(f.feed.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn start_is_idempotent() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig {
        statuses: vec![status("processing", 10)],
        ..Default::default()
    })
    .await?;
    let f = fixture(&api, "access-0", 5)?;

    assert!(f.poller.start("g1", Duration::from_secs(60)));
    assert!(!f.poller.start("g1", Duration::from_secs(60)));
    assert_eq!(f.poller.active(), 1);

    assert!(wait_for(WAIT, || api.status_calls() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(api.status_calls(), 1);
    f.poller.stop_all();
    assert_eq!(f.poller.active(), 0);
    Ok(())
}

#[tokio::test]
async fn stop_ends_polling_early() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig {
        statuses: vec![status("processing", 10)],
        ..Default::default()
    })
    .await?;
    let mut f = fixture(&api, "access-0", 5)?;

    f.poller.start("g1", FAST);
    next_delivery(&mut f.feed).await?;
    assert!(f.poller.stop("g1"));
    assert!(!f.poller.stop("g1"));

    // Allow an in-flight request to land, then the count must hold.
    tokio::time::sleep(FAST * 3).await;
    let calls = api.status_calls();
    tokio::time::sleep(FAST * 5).await;
    assert_eq!(api.status_calls(), calls);
    Ok(())
}

#[tokio::test]
async fn failure_streak_degrades_once_then_recovers() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig {
        statuses: vec![
            (500, json!({"error": "down"})),
            (503, json!({"error": "down"})),
            (500, json!({"error": "down"})),
            status("processing", 50),
            status("completed", 100),
        ],
        ..Default::default()
    })
    .await?;
    let mut f = fixture(&api, "access-0", 2)?;
    let mut signals = f.signals.subscribe();

    f.poller.start("g1", FAST);
    assert_eq!(next_delivery(&mut f.feed).await?.event.percent, 50);
    assert_eq!(next_delivery(&mut f.feed).await?.event.status, ProgressStatus::Completed);

    assert_eq!(
        signals.try_recv()?,
        SessionSignal::PollingDegraded { job_id: "g1".to_owned(), consecutive_failures: 2 }
    );
    assert_eq!(signals.try_recv()?, SessionSignal::PollingRecovered { job_id: "g1".to_owned() });
    assert!(signals.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn rejected_request_degrades_without_waiting_for_streak() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig {
        statuses: vec![(404, json!({"error": "no such job"})), status("completed", 100)],
        ..Default::default()
    })
    .await?;
    let mut f = fixture(&api, "access-0", 5)?;
    let mut signals = f.signals.subscribe();

    f.poller.start("g1", FAST);
    assert_eq!(next_delivery(&mut f.feed).await?.event.status, ProgressStatus::Completed);

    assert_eq!(
        signals.try_recv()?,
        SessionSignal::PollingDegraded { job_id: "g1".to_owned(), consecutive_failures: 1 }
    );
    assert_eq!(signals.try_recv()?, SessionSignal::PollingRecovered { job_id: "g1".to_owned() });
    Ok(())
}

#[tokio::test]
async fn zero_interval_is_raised_to_minimum() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig {
        statuses: vec![status("processing", 10), status("completed", 100)],
        ..Default::default()
    })
    .await?;
    let mut f = fixture(&api, "access-0", 5)?;

    assert!(f.poller.start("g1", Duration::ZERO));
    assert_eq!(next_delivery(&mut f.feed).await?.event.percent, 10);
    assert_eq!(next_delivery(&mut f.feed).await?.event.status, ProgressStatus::Completed);
    assert!(wait_for(WAIT, || !f.poller.is_polling("g1")).await);
    assert_eq!(api.status_calls(), 2);

    // The finished loop left no entry behind.
    assert!(f.poller.start("g1", Duration::ZERO));
    f.poller.stop_all();
    Ok(())
}

#[tokio::test]
async fn expired_session_ends_polling() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig {
        refresh: RefreshBehavior::Reject,
        ..Default::default()
    })
    .await?;
    let f = fixture(&api, "stale", 5)?;

    f.poller.start("g1", FAST);
    assert!(wait_for(WAIT, || !f.poller.is_polling("g1")).await);
    assert_eq!(api.status_calls(), 0);
    assert_eq!(api.refresh_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn attach_and_release_through_channel_trait() -> anyhow::Result<()> {
    let api = MockApi::start(MockApiConfig {
        statuses: vec![status("processing", 10)],
        ..Default::default()
    })
    .await?;
    let f = fixture(&api, "access-0", 5)?;

    let channel: &dyn JobChannel = &f.poller;
    channel.attach("g1");
    assert!(f.poller.is_polling("g1"));
    channel.release("g1");
    assert!(!f.poller.is_polling("g1"));
    Ok(())
}
