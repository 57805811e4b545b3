// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One signed-in session: the store, gateway, channels and registry wired
//! together, plus the background tasks that connect them.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::api;
use crate::config::ClientConfig;
use crate::credential::renewal::RenewalCoordinator;
use crate::credential::{Credential, CredentialStore};
use crate::error::ClientError;
use crate::events::{epoch_ms, Delivery, JobId, ProgressEvent};
use crate::gateway::{http_client, RequestGateway};
use crate::poll::PollFallback;
use crate::push::{ConnectionState, PushChannel};
use crate::registry::{JobChannel, JobHandle, JobRegistry, TrackOptions};
use crate::signal::{SessionSignal, SignalHub};

pub struct Session {
    config: ClientConfig,
    http: reqwest::Client,
    store: Arc<CredentialStore>,
    gateway: Arc<RequestGateway>,
    signals: Arc<SignalHub>,
    push: Arc<PushChannel>,
    poll: Arc<PollFallback>,
    registry: Arc<JobRegistry>,
    shutdown: CancellationToken,
}

impl Session {
    /// Build the session and spawn its background tasks. Must be called
    /// inside a Tokio runtime.
    ///
    /// A credential already in the store (from the credential file)
    /// connects the push channel right away.
    pub fn start(config: ClientConfig) -> Result<Self, ClientError> {
        let http = http_client(config.request_timeout())?;
        let store = Arc::new(match config.credential_file {
            Some(ref path) => CredentialStore::persisted(path.clone()),
            None => CredentialStore::new(),
        });
        let signals = Arc::new(SignalHub::new());
        let renewal = Arc::new(RenewalCoordinator::new(
            http.clone(),
            config.api_url.clone(),
            Arc::clone(&store),
        ));
        let gateway = Arc::new(RequestGateway::new(
            http.clone(),
            config.api_url.clone(),
            Arc::clone(&store),
            renewal,
            Arc::clone(&signals),
        ));

        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let push = Arc::new(PushChannel::new(
            &config.ws_endpoint(),
            config.reconnect_policy(),
            config.request_timeout(),
            feed_tx.clone(),
            Arc::clone(&signals),
        ));
        let poll = Arc::new(PollFallback::new(
            Arc::clone(&gateway),
            feed_tx,
            Arc::clone(&signals),
            config.poll_interval(),
            config.max_poll_failures,
        ));
        let registry = Arc::new(JobRegistry::new(
            Some(Arc::clone(&push) as Arc<dyn JobChannel>),
            Some(Arc::clone(&poll) as Arc<dyn JobChannel>),
            config.record_grace(),
        ));

        let shutdown = CancellationToken::new();
        spawn_delivery_pump(Arc::clone(&registry), feed_rx, shutdown.clone());
        spawn_record_sweeper(Arc::clone(&registry), &config, shutdown.clone());
        spawn_signal_listener(
            Arc::clone(&registry),
            Arc::clone(&push),
            Arc::clone(&poll),
            signals.subscribe(),
            shutdown.clone(),
        );

        if let Some(credential) = store.get() {
            push.connect(&credential);
        }

        Ok(Self { config, http, store, gateway, signals, push, poll, registry, shutdown })
    }

    /// Adopt `credential` as the session credential.
    pub fn sign_in(&self, credential: Credential) {
        self.store.set(credential.clone());
        self.signals.session_started();
        self.push.connect(&credential);
        tracing::info!("signed in");
    }

    /// Sign in with email and password.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        let credential = api::sign_in(&self.http, &self.config.api_url, email, password).await?;
        self.sign_in(credential);
        Ok(())
    }

    pub fn is_signed_in(&self) -> bool {
        self.store.is_signed_in()
    }

    /// Start a generation job and return its id.
    pub async fn create_job(&self, prompt: &str) -> Result<JobId, ClientError> {
        api::create_job(&self.gateway, prompt).await
    }

    /// Fetch one status snapshot directly, bypassing the registry.
    pub async fn job_status(&self, job_id: &str) -> Result<ProgressEvent, ClientError> {
        api::get_job_status(&self.gateway, job_id).await
    }

    /// Track `job_id`. Push tracking (re)connects the channel with the
    /// current credential if needed.
    pub fn track(&self, job_id: &str, options: TrackOptions) -> JobHandle {
        if options.push {
            if let Some(credential) = self.store.get() {
                self.push.connect(&credential);
            }
        }
        self.registry.track(job_id, options)
    }

    pub fn untrack(&self, handle: JobHandle) {
        self.registry.untrack(handle);
    }

    pub fn current(&self, job_id: &str) -> Option<ProgressEvent> {
        self.registry.current(job_id)
    }

    pub fn observe(&self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        self.registry.observe()
    }

    pub fn signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn push_state(&self) -> watch::Receiver<ConnectionState> {
        self.push.watch_state()
    }

    /// Stop every channel and background task. Credentials are kept.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.registry.clear();
        self.poll.stop_all();
        self.push.disconnect();
    }

    /// Tear the session down and forget the credential.
    pub fn sign_out(&self) {
        self.close();
        self.store.clear();
        tracing::info!("signed out");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Feed channel deliveries into the registry in arrival order.
fn spawn_delivery_pump(
    registry: Arc<JobRegistry>,
    mut feed: mpsc::UnboundedReceiver<Delivery>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = feed.recv() => {
                    let Some(delivery) = delivery else { break };
                    registry.ingest(delivery);
                }
            }
        }
    });
}

/// Periodically evict records past their grace period.
fn spawn_record_sweeper(
    registry: Arc<JobRegistry>,
    config: &ClientConfig,
    shutdown: CancellationToken,
) {
    let interval = config.sweep_interval();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let evicted = registry.sweep(epoch_ms());
            if evicted > 0 {
                tracing::debug!(evicted, "swept job records");
            }
        }
    });
}

/// React to session signals: poll when push is lost, stop the channels
/// when the session expires.
fn spawn_signal_listener(
    registry: Arc<JobRegistry>,
    push: Arc<PushChannel>,
    poll: Arc<PollFallback>,
    mut signals: broadcast::Receiver<SessionSignal>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = signals.recv() => signal,
            };
            match signal {
                Ok(SessionSignal::ConnectivityLost { .. }) => {
                    registry.fall_back_to_polling();
                }
                Ok(SessionSignal::SignInRequired) => {
                    push.disconnect();
                    poll.stop_all();
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // A missed ConnectivityLost would strand push-only jobs.
                    tracing::debug!(skipped = n, "signal listener lagged");
                    if push.state() == ConnectionState::Failed {
                        registry.fall_back_to_polling();
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
