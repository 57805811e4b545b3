// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job progress registry: the single merged view of every tracked job.
//!
//! Both channels feed [`JobRegistry::ingest`]. Accepted updates are sent to
//! observers while the registry lock is held, so every observer sees them in
//! acceptance order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::events::{epoch_ms, Delivery, JobId, ProgressEvent, Source};

/// A progress source the registry can attach to and release from a job.
pub trait JobChannel: Send + Sync {
    fn attach(&self, job_id: &str);
    fn release(&self, job_id: &str);
}

/// Which channels a tracker wants for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackOptions {
    pub push: bool,
    pub poll: bool,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self { push: true, poll: true }
    }
}

/// Proof of one `track` call; hand it back to `untrack`.
#[derive(Debug, PartialEq, Eq)]
pub struct JobHandle {
    job_id: JobId,
    id: u64,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Unique per `track` call.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// What happened to an ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Replaced the latest event; observers notified.
    Accepted,
    /// Filled metadata into the terminal event; observers notified.
    Merged,
    /// Not newer than the latest event.
    Stale,
    /// Newer, but nothing observable changed.
    Duplicate,
    /// Would leave a terminal state; dropped.
    Anomaly,
    /// No record for the job id.
    Untracked,
}

/// Decide how `incoming` merges against the `current` latest event.
pub fn merge(current: Option<&ProgressEvent>, incoming: &ProgressEvent) -> MergeOutcome {
    let Some(current) = current else {
        return MergeOutcome::Accepted;
    };
    if current.is_terminal() {
        if incoming.status != current.status {
            return MergeOutcome::Anomaly;
        }
        return if adds_metadata(current, incoming) {
            MergeOutcome::Merged
        } else {
            MergeOutcome::Duplicate
        };
    }
    // A terminal status ends the job whichever clock stamped it.
    if incoming.is_terminal() {
        return MergeOutcome::Accepted;
    }
    if !incoming.is_newer_than(current) {
        return MergeOutcome::Stale;
    }
    if incoming.same_content(current) {
        return MergeOutcome::Duplicate;
    }
    MergeOutcome::Accepted
}

fn adds_metadata(current: &ProgressEvent, incoming: &ProgressEvent) -> bool {
    (current.result_url.is_none() && incoming.result_url.is_some())
        || (current.message.is_none() && incoming.message.is_some())
}

struct JobRecord {
    latest: Option<ProgressEvent>,
    subscribers: u32,
    sources: HashSet<Source>,
    /// Epoch ms after which `sweep` may evict the record.
    expires_at: Option<u64>,
}

impl JobRecord {
    fn is_terminal(&self) -> bool {
        self.latest.as_ref().is_some_and(ProgressEvent::is_terminal)
    }
}

#[derive(Default)]
struct Inner {
    records: HashMap<JobId, JobRecord>,
    observers: Vec<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Inner {
    fn notify(&mut self, event: &ProgressEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Merged per-job progress state.
pub struct JobRegistry {
    inner: Mutex<Inner>,
    push: Option<Arc<dyn JobChannel>>,
    poll: Option<Arc<dyn JobChannel>>,
    grace: Duration,
    next_handle: AtomicU64,
}

impl JobRegistry {
    /// A missing channel is treated as opted out for every job.
    pub fn new(
        push: Option<Arc<dyn JobChannel>>,
        poll: Option<Arc<dyn JobChannel>>,
        grace: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            push,
            poll,
            grace,
            next_handle: AtomicU64::new(0),
        }
    }

    /// Start (or join) tracking `job_id`.
    ///
    /// Requested channels that are not already active for the job are
    /// attached. Finished jobs get no new channels.
    pub fn track(&self, job_id: &str, options: TrackOptions) -> JobHandle {
        let mut inner = self.inner.lock();
        let record = inner.records.entry(job_id.to_owned()).or_insert_with(|| JobRecord {
            latest: None,
            subscribers: 0,
            sources: HashSet::new(),
            expires_at: None,
        });
        record.subscribers += 1;

        if !record.is_terminal() {
            record.expires_at = None;
            if options.push {
                self.attach(record, job_id, Source::Push);
            }
            if options.poll {
                self.attach(record, job_id, Source::Poll);
            }
        }
        tracing::debug!(job_id, subscribers = record.subscribers, "job tracked");

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        JobHandle { job_id: job_id.to_owned(), id }
    }

    /// Drop one tracker. The last one releases the channels and starts the
    /// grace period.
    pub fn untrack(&self, handle: JobHandle) {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get_mut(&handle.job_id) else {
            return;
        };
        record.subscribers = record.subscribers.saturating_sub(1);
        if record.subscribers == 0 {
            self.release_all(record, &handle.job_id);
            record.expires_at.get_or_insert(epoch_ms() + self.grace_ms());
            tracing::debug!(job_id = %handle.job_id, "job untracked");
        }
    }

    /// Latest accepted event for `job_id`.
    pub fn current(&self, job_id: &str) -> Option<ProgressEvent> {
        self.inner.lock().records.get(job_id).and_then(|r| r.latest.clone())
    }

    /// Receive every accepted update from now on.
    pub fn observe(&self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().observers.push(tx);
        rx
    }

    /// Merge one delivery into the record for its job.
    pub fn ingest(&self, delivery: Delivery) -> MergeOutcome {
        let Delivery { source, event } = delivery;
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get_mut(&event.job_id) else {
            tracing::debug!(job_id = %event.job_id, %source, "event for untracked job dropped");
            return MergeOutcome::Untracked;
        };

        let outcome = merge(record.latest.as_ref(), &event);
        let notified = match outcome {
            MergeOutcome::Accepted => {
                if event.is_terminal() {
                    // Push stays subscribed for late metadata until the
                    // record is swept or its last tracker leaves.
                    self.release(record, &event.job_id, Source::Poll);
                    record.expires_at = Some(epoch_ms() + self.grace_ms());
                    tracing::info!(
                        job_id = %event.job_id,
                        status = %event.status,
                        %source,
                        "job finished"
                    );
                }
                record.latest = Some(event.clone());
                Some(event)
            }
            MergeOutcome::Merged => {
                let mut latest = record.latest.take().unwrap_or_else(|| event.clone());
                if latest.result_url.is_none() {
                    latest.result_url = event.result_url;
                }
                if latest.message.is_none() {
                    latest.message = event.message;
                }
                record.latest = Some(latest.clone());
                Some(latest)
            }
            MergeOutcome::Anomaly => {
                let current = record.latest.as_ref().map(|e| e.status);
                tracing::warn!(
                    job_id = %event.job_id,
                    %source,
                    current = ?current,
                    incoming = %event.status,
                    "dropping event that leaves terminal state"
                );
                None
            }
            MergeOutcome::Stale | MergeOutcome::Duplicate | MergeOutcome::Untracked => {
                tracing::trace!(job_id = %event.job_id, %source, ?outcome, "event not applied");
                None
            }
        };

        if let Some(ref event) = notified {
            inner.notify(event);
        }
        outcome
    }

    /// Evict records whose grace period ended before `now_ms`.
    /// Returns the number evicted.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.records.len();
        inner.records.retain(|job_id, record| {
            let keep = !matches!(record.expires_at, Some(at) if at <= now_ms);
            if !keep {
                self.release_all(record, job_id);
                tracing::debug!(job_id = %job_id, "job record evicted");
            }
            keep
        });
        before - inner.records.len()
    }

    /// Attach polling to every live, unfinished job that lacks it.
    /// Returns the number of jobs switched over.
    pub fn fall_back_to_polling(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut switched = 0;
        for (job_id, record) in inner.records.iter_mut() {
            if record.subscribers == 0
                || record.is_terminal()
                || record.sources.contains(&Source::Poll)
            {
                continue;
            }
            if self.attach(record, job_id, Source::Poll) {
                switched += 1;
            }
        }
        if switched > 0 {
            tracing::info!(jobs = switched, "falling back to polling");
        }
        switched
    }

    /// Release every channel and forget every record.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let records = std::mem::take(&mut inner.records);
        for (job_id, mut record) in records {
            self.release_all(&mut record, &job_id);
        }
    }

    pub fn subscriber_count(&self, job_id: &str) -> u32 {
        self.inner.lock().records.get(job_id).map_or(0, |r| r.subscribers)
    }

    /// Channels currently attached for `job_id`.
    pub fn sources(&self, job_id: &str) -> HashSet<Source> {
        self.inner.lock().records.get(job_id).map(|r| r.sources.clone()).unwrap_or_default()
    }

    pub fn is_tracked(&self, job_id: &str) -> bool {
        self.inner.lock().records.contains_key(job_id)
    }

    fn channel(&self, source: Source) -> Option<&Arc<dyn JobChannel>> {
        match source {
            Source::Push => self.push.as_ref(),
            Source::Poll => self.poll.as_ref(),
        }
    }

    fn attach(&self, record: &mut JobRecord, job_id: &str, source: Source) -> bool {
        if record.sources.contains(&source) {
            return false;
        }
        let Some(channel) = self.channel(source) else {
            return false;
        };
        channel.attach(job_id);
        record.sources.insert(source);
        true
    }

    fn release(&self, record: &mut JobRecord, job_id: &str, source: Source) {
        if !record.sources.remove(&source) {
            return;
        }
        if let Some(channel) = self.channel(source) {
            channel.release(job_id);
        }
    }

    fn release_all(&self, record: &mut JobRecord, job_id: &str) {
        for source in record.sources.drain() {
            if let Some(channel) = self.channel(source) {
                channel.release(job_id);
            }
        }
    }

    fn grace_ms(&self) -> u64 {
        self.grace.as_millis() as u64
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
