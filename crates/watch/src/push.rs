// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Push channel: one WebSocket to the event server, shared by every tracked
//! job. Subscriptions are re-sent on every open. Reconnects with bounded
//! exponential backoff and reports the outcome as session signals.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::config::to_ws_scheme;
use crate::credential::Credential;
use crate::events::{epoch_ms, parse_channel_message, ClientMessage, Delivery, JobId, Source};
use crate::registry::JobChannel;
use crate::signal::{SessionSignal, SignalHub};

/// Reconnect budget after a transport loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `initial * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_backoff.saturating_mul(1u32 << exp).min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to make reconnect attempt `attempt`.
    Reconnecting { attempt: u32 },
    /// Gave up: attempts exhausted or credential rejected.
    Failed,
}

impl ConnectionState {
    /// Whether a connection task is alive for this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInput {
    Connect,
    Opened,
    ConnectFailed,
    /// Server refused the credential at upgrade (401/403).
    Rejected,
    Dropped,
    Disconnect,
}

/// Connection state transition table. Inputs that make no sense for the
/// current state leave it unchanged.
pub fn transition(
    state: ConnectionState,
    input: ConnectionInput,
    policy: &ReconnectPolicy,
) -> ConnectionState {
    use ConnectionInput as In;
    use ConnectionState as St;

    let retry = |attempt: u32| {
        if attempt > policy.max_attempts {
            St::Failed
        } else {
            St::Reconnecting { attempt }
        }
    };

    match (state, input) {
        (_, In::Disconnect) => St::Disconnected,
        (St::Disconnected | St::Failed, In::Connect) => St::Connecting,
        (St::Connecting | St::Reconnecting { .. }, In::Opened) => St::Connected,
        (St::Connecting | St::Reconnecting { .. } | St::Connected, In::Rejected) => St::Failed,
        (St::Connecting, In::ConnectFailed) | (St::Connected, In::Dropped) => retry(1),
        (St::Reconnecting { attempt }, In::ConnectFailed) => retry(attempt + 1),
        (s, _) => s,
    }
}

/// Connection bookkeeping; `epoch` identifies the live connection task.
struct Link {
    epoch: u64,
    credential: Option<Credential>,
    cancel: Option<CancellationToken>,
    commands: Option<mpsc::UnboundedSender<ClientMessage>>,
}

struct Shared {
    ws_url: String,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    feed: mpsc::UnboundedSender<Delivery>,
    signals: Arc<SignalHub>,
    subscriptions: Mutex<HashSet<JobId>>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
}

/// Push channel client.
pub struct PushChannel {
    shared: Arc<Shared>,
}

impl PushChannel {
    pub fn new(
        ws_url: &str,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
        feed: mpsc::UnboundedSender<Delivery>,
        signals: Arc<SignalHub>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                ws_url: to_ws_scheme(ws_url),
                policy,
                connect_timeout,
                feed,
                signals,
                subscriptions: Mutex::new(HashSet::new()),
                state,
                link: Mutex::new(Link { epoch: 0, credential: None, cancel: None, commands: None }),
            }),
        }
    }

    /// Open the connection with `credential`.
    ///
    /// No-op while a connection for the same credential is alive; a
    /// different credential replaces it.
    pub fn connect(&self, credential: &Credential) {
        let mut link = self.shared.link.lock();
        let current = *self.shared.state.borrow();
        if current.is_active() && link.credential.as_ref() == Some(credential) {
            return;
        }
        if let Some(cancel) = link.cancel.take() {
            cancel.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        link.epoch += 1;
        link.credential = Some(credential.clone());
        link.cancel = Some(cancel.clone());
        link.commands = Some(tx);

        let policy = &self.shared.policy;
        let next = transition(
            transition(current, ConnectionInput::Disconnect, policy),
            ConnectionInput::Connect,
            policy,
        );
        self.shared.state.send_replace(next);

        tokio::spawn(run_connection(
            Arc::clone(&self.shared),
            link.epoch,
            credential.access_token.clone(),
            cancel,
            rx,
        ));
    }

    /// Close the connection. Subscriptions are kept for the next connect.
    pub fn disconnect(&self) {
        let mut link = self.shared.link.lock();
        if let Some(cancel) = link.cancel.take() {
            cancel.cancel();
        }
        link.epoch += 1;
        link.credential = None;
        link.commands = None;
        let current = *self.shared.state.borrow();
        if current != ConnectionState::Disconnected {
            tracing::info!("push channel disconnected");
        }
        self.shared.state.send_replace(transition(
            current,
            ConnectionInput::Disconnect,
            &self.shared.policy,
        ));
    }

    pub fn subscribe(&self, job_id: &str) {
        if self.shared.subscriptions.lock().insert(job_id.to_owned()) {
            self.shared.send_command(ClientMessage::Subscribe { job_id: job_id.to_owned() });
        }
    }

    pub fn unsubscribe(&self, job_id: &str) {
        if self.shared.subscriptions.lock().remove(job_id) {
            self.shared.send_command(ClientMessage::Unsubscribe { job_id: job_id.to_owned() });
        }
    }

    pub fn is_subscribed(&self, job_id: &str) -> bool {
        self.shared.subscriptions.lock().contains(job_id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

impl JobChannel for PushChannel {
    fn attach(&self, job_id: &str) {
        self.subscribe(job_id);
    }

    fn release(&self, job_id: &str) {
        self.unsubscribe(job_id);
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        if let Some(cancel) = self.shared.link.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

impl Shared {
    /// Apply `input` if `epoch` is still the live connection.
    /// Returns `(previous, next)` states, or `None` if superseded.
    fn apply(
        &self,
        epoch: u64,
        input: ConnectionInput,
    ) -> Option<(ConnectionState, ConnectionState)> {
        let link = self.link.lock();
        if link.epoch != epoch {
            return None;
        }
        let prev = *self.state.borrow();
        let next = transition(prev, input, &self.policy);
        if next != prev {
            tracing::debug!(?prev, ?next, ?input, "push channel state");
        }
        self.state.send_replace(next);
        Some((prev, next))
    }

    fn send_command(&self, msg: ClientMessage) {
        if let Some(ref tx) = self.link.lock().commands {
            // Receiver gone means the task is shutting down; the next
            // connection re-sends from the subscription set.
            let _ = tx.send(msg);
        }
    }

    /// Forward one inbound frame to the feed if it is a known event for a
    /// subscribed job.
    fn deliver(&self, text: &str) {
        let event = match parse_channel_message(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(err = %e, "dropping unrecognized push message");
                return;
            }
        };
        if !self.subscriptions.lock().contains(event.job_id()) {
            tracing::debug!(job_id = %event.job_id(), "dropping event for unsubscribed job");
            return;
        }
        let event = event.into_progress(epoch_ms());
        let _ = self.feed.send(Delivery { source: Source::Push, event });
    }
}

enum SessionEnd {
    Cancelled,
    Dropped(String),
}

async fn run_connection(
    shared: Arc<Shared>,
    epoch: u64,
    token: String,
    cancel: CancellationToken,
    mut commands: mpsc::UnboundedReceiver<ClientMessage>,
) {
    let url = match with_token(&shared.ws_url, &token) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(err = %e, "invalid event server url");
            if shared.apply(epoch, ConnectionInput::Rejected).is_some() {
                let reason = format!("invalid event server url: {e}");
                shared.signals.emit(SessionSignal::ConnectivityLost { reason });
            }
            return;
        }
    };
    let mut reason = String::new();

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(
                shared.connect_timeout,
                tokio_tungstenite::connect_async(&url),
            ) => r,
        };

        let input = match attempt {
            Ok(Ok((ws_stream, _))) => {
                let Some((prev, _)) = shared.apply(epoch, ConnectionInput::Opened) else {
                    break;
                };
                tracing::info!("push channel connected");
                if matches!(prev, ConnectionState::Reconnecting { .. }) {
                    shared.signals.emit(SessionSignal::ConnectivityRestored);
                }

                let (mut write, mut read) = ws_stream.split();
                // Queued commands are superseded by the subscription set.
                while commands.try_recv().is_ok() {}
                let subscribed: Vec<JobId> = shared.subscriptions.lock().iter().cloned().collect();

                let end = 'session: {
                    for job_id in subscribed {
                        if let Err(e) =
                            send_control(&mut write, &ClientMessage::Subscribe { job_id }).await
                        {
                            break 'session SessionEnd::Dropped(e);
                        }
                    }
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                let _ = write.send(Message::Close(None)).await;
                                break 'session SessionEnd::Cancelled;
                            }
                            cmd = commands.recv() => {
                                let Some(msg) = cmd else {
                                    break 'session SessionEnd::Cancelled;
                                };
                                if let Err(e) = send_control(&mut write, &msg).await {
                                    break 'session SessionEnd::Dropped(e);
                                }
                            }
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => shared.deliver(text.as_str()),
                                    Some(Ok(Message::Close(_))) | None => {
                                        let reason = "closed by server".to_owned();
                                        break 'session SessionEnd::Dropped(reason);
                                    }
                                    Some(Err(e)) => {
                                        break 'session SessionEnd::Dropped(e.to_string());
                                    }
                                    Some(Ok(_)) => {} // ping/pong/binary ignored
                                }
                            }
                        }
                    }
                };

                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Dropped(e) => {
                        tracing::info!(err = %e, "push channel dropped");
                        reason = e;
                        ConnectionInput::Dropped
                    }
                }
            }
            Ok(Err(tungstenite::Error::Http(resp)))
                if matches!(resp.status().as_u16(), 401 | 403) =>
            {
                let status = resp.status().as_u16();
                tracing::warn!(status, "push channel credential rejected");
                reason = format!("credential rejected ({status})");
                ConnectionInput::Rejected
            }
            Ok(Err(e)) => {
                tracing::debug!(err = %e, "push channel connect failed");
                reason = e.to_string();
                ConnectionInput::ConnectFailed
            }
            Err(_) => {
                tracing::debug!("push channel connect timed out");
                reason = "connect timed out".to_owned();
                ConnectionInput::ConnectFailed
            }
        };

        let Some((_, next)) = shared.apply(epoch, input) else {
            break;
        };
        match next {
            ConnectionState::Failed => {
                tracing::warn!(reason = %reason, "push channel failed, falling back to polling");
                shared.signals.emit(SessionSignal::ConnectivityLost { reason });
                break;
            }
            ConnectionState::Reconnecting { attempt } => {
                let delay = shared.policy.delay(attempt);
                let delay_ms = delay.as_millis() as u64;
                tracing::debug!(attempt, delay_ms, "push channel reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            _ => break,
        }
    }
}

async fn send_control<S>(write: &mut S, msg: &ClientMessage) -> Result<(), String>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    write.send(Message::Text(json.into())).await.map_err(|e| e.to_string())
}

/// Append the access token as a percent-encoded `token` query parameter.
fn with_token(ws_url: &str, token: &str) -> Result<String, String> {
    let mut url = reqwest::Url::parse(ws_url).map_err(|e| e.to_string())?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.into())
}

#[cfg(test)]
#[path = "push_tests.rs"]
mod tests;
