// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Poll fallback: per-job status polling through the request gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api;
use crate::error::ClientError;
use crate::events::{Delivery, JobId, ProgressEvent, Source};
use crate::gateway::RequestGateway;
use crate::registry::JobChannel;
use crate::signal::{SessionSignal, SignalHub};

/// Whether polling should stop after observing `event`.
pub fn should_stop(event: &ProgressEvent) -> bool {
    event.status.is_terminal()
}

/// Shortest cadence a loop will run at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

type Loops = Mutex<HashMap<JobId, (u64, CancellationToken)>>;

/// Runs one polling loop per job id.
pub struct PollFallback {
    gateway: Arc<RequestGateway>,
    feed: mpsc::UnboundedSender<Delivery>,
    signals: Arc<SignalHub>,
    interval: Duration,
    max_failures: u32,
    loops: Arc<Loops>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl PollFallback {
    /// `interval` is the cadence used when attached through the registry.
    pub fn new(
        gateway: Arc<RequestGateway>,
        feed: mpsc::UnboundedSender<Delivery>,
        signals: Arc<SignalHub>,
        interval: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            gateway,
            feed,
            signals,
            interval,
            max_failures: max_failures.max(1),
            loops: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start polling `job_id` every `interval`, first request immediately.
    /// Returns false if a loop for that id is already running.
    ///
    /// Intervals below [`MIN_INTERVAL`] are raised to it.
    pub fn start(&self, job_id: &str, interval: Duration) -> bool {
        let interval = interval.max(MIN_INTERVAL);
        let mut loops = self.loops.lock();
        if loops.contains_key(job_id) {
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.shutdown.child_token();
        loops.insert(job_id.to_owned(), (generation, cancel.clone()));

        tracing::debug!(job_id, interval_ms = interval.as_millis() as u64, "polling started");
        let poll = PollLoop {
            job_id: job_id.to_owned(),
            generation,
            interval,
            max_failures: self.max_failures,
            gateway: Arc::clone(&self.gateway),
            feed: self.feed.clone(),
            signals: Arc::clone(&self.signals),
            loops: Arc::clone(&self.loops),
            cancel,
        };
        tokio::spawn(poll.run());
        true
    }

    /// Stop polling `job_id`. Returns whether a loop was running.
    pub fn stop(&self, job_id: &str) -> bool {
        match self.loops.lock().remove(job_id) {
            Some((_, cancel)) => {
                cancel.cancel();
                tracing::debug!(job_id, "polling stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every loop.
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.loops.lock().drain().collect();
        for (_, (_, cancel)) in drained {
            cancel.cancel();
        }
    }

    pub fn is_polling(&self, job_id: &str) -> bool {
        self.loops.lock().contains_key(job_id)
    }

    /// Number of running loops.
    pub fn active(&self) -> usize {
        self.loops.lock().len()
    }
}

impl JobChannel for PollFallback {
    fn attach(&self, job_id: &str) {
        self.start(job_id, self.interval);
    }

    fn release(&self, job_id: &str) {
        self.stop(job_id);
    }
}

impl Drop for PollFallback {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct PollLoop {
    job_id: JobId,
    generation: u64,
    interval: Duration,
    max_failures: u32,
    gateway: Arc<RequestGateway>,
    feed: mpsc::UnboundedSender<Delivery>,
    signals: Arc<SignalHub>,
    loops: Arc<Loops>,
    cancel: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        let job_id = self.job_id.as_str();
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failures = 0u32;
        let mut degraded = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            match api::get_job_status(&self.gateway, job_id).await {
                Ok(event) => {
                    failures = 0;
                    if degraded {
                        degraded = false;
                        tracing::info!(job_id, "polling recovered");
                        self.signals
                            .emit(SessionSignal::PollingRecovered { job_id: self.job_id.clone() });
                    }
                    let stop = should_stop(&event);
                    let _ = self.feed.send(Delivery { source: Source::Poll, event });
                    if stop {
                        tracing::debug!(job_id, "terminal status, polling done");
                        break;
                    }
                }
                Err(ClientError::SessionExpired) => {
                    tracing::debug!(job_id, "session expired, polling ended");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    let transient = e.is_transient();
                    let code = e.code();
                    if transient {
                        tracing::debug!(job_id, failures, %code, err = %e, "status poll failed");
                    } else {
                        tracing::warn!(job_id, failures, %code, err = %e, "status poll rejected");
                    }
                    // A non-transient failure will not clear by itself.
                    if (failures >= self.max_failures || !transient) && !degraded {
                        degraded = true;
                        tracing::warn!(job_id, failures, "polling degraded");
                        self.signals.emit(SessionSignal::PollingDegraded {
                            job_id: self.job_id.clone(),
                            consecutive_failures: failures,
                        });
                    }
                }
            }
        }

        let mut loops = self.loops.lock();
        if loops.get(job_id).map(|(g, _)| *g) == Some(self.generation) {
            loops.remove(job_id);
        }
    }
}

#[cfg(test)]
#[path = "poll_tests.rs"]
mod tests;
