// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight session renewal.
//!
//! The first caller spawns the refresh round trip and parks a shared handle
//! to it (the renewal ticket). Callers arriving while it is in flight await
//! the same handle. The spawned task writes the store before resolving, so
//! no waiter can observe completion ahead of the new credential.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::api;
use crate::credential::{Credential, CredentialStore};
use crate::error::RenewalFailed;

type RenewalTicket = Shared<BoxFuture<'static, Result<Credential, RenewalFailed>>>;
type Slot = Arc<Mutex<Option<(u64, RenewalTicket)>>>;

/// Coordinates credential renewal so that at most one refresh is in flight.
pub struct RenewalCoordinator {
    http: reqwest::Client,
    base_url: String,
    store: Arc<CredentialStore>,
    /// `(generation, ticket)` of the in-flight renewal, if any.
    in_flight: Slot,
    generation: AtomicU64,
    attempts: AtomicU64,
}

impl RenewalCoordinator {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            store,
            in_flight: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
        }
    }

    /// Renew the session, joining an in-flight renewal if there is one.
    pub async fn renew(&self) -> Result<Credential, RenewalFailed> {
        let ticket = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some((_, ticket)) => ticket.clone(),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let ticket = self.spawn_renewal(generation);
                    *slot = Some((generation, ticket.clone()));
                    ticket
                }
            }
        };
        ticket.await
    }

    /// Renew after the server rejected `rejected_token`.
    ///
    /// If the store already holds a different token and no renewal is
    /// running, someone else renewed in the meantime and that credential is
    /// returned without another round trip.
    pub async fn renew_after_rejection(
        &self,
        rejected_token: Option<&str>,
    ) -> Result<Credential, RenewalFailed> {
        if let Some(current) = self.store.get() {
            let superseded = rejected_token != Some(current.access_token.as_str());
            if superseded && self.in_flight.lock().is_none() {
                tracing::debug!("credential already renewed, reusing");
                return Ok(current);
            }
        }
        self.renew().await
    }

    /// Whether a renewal is currently in flight.
    pub fn is_renewing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Number of refresh round trips started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn spawn_renewal(&self, generation: u64) -> RenewalTicket {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let store = Arc::clone(&self.store);
        let slot = Arc::clone(&self.in_flight);

        let task = tokio::spawn(async move {
            let outcome = refresh(&http, &base_url, &store).await;
            match &outcome {
                Ok(credential) => {
                    store.set(credential.clone());
                    tracing::info!(generation, "session renewed");
                }
                Err(e) => {
                    store.clear();
                    tracing::warn!(generation, err = %e, "session renewal failed");
                }
            }
            // Retire the ticket before waiters wake so later rejections start fresh.
            retire(&slot, generation);
            outcome
        });

        ticket(task, Arc::clone(&self.in_flight), generation)
    }
}

/// Wrap the renewal task in a shareable ticket. A task that panicked or was
/// cancelled never retired its slot, so the ticket does it.
fn ticket(
    task: JoinHandle<Result<Credential, RenewalFailed>>,
    slot: Slot,
    generation: u64,
) -> RenewalTicket {
    async move {
        let outcome = task.await.unwrap_or(Err(RenewalFailed::Aborted));
        retire(&slot, generation);
        outcome
    }
    .boxed()
    .shared()
}

/// Clear `slot` if it still holds the ticket of `generation`.
fn retire(slot: &Slot, generation: u64) {
    let mut slot = slot.lock();
    if slot.as_ref().map(|(g, _)| *g) == Some(generation) {
        *slot = None;
    }
}

async fn refresh(
    http: &reqwest::Client,
    base_url: &str,
    store: &CredentialStore,
) -> Result<Credential, RenewalFailed> {
    let current = store.get().ok_or(RenewalFailed::NoRefreshToken)?;
    if current.refresh_token.is_empty() {
        return Err(RenewalFailed::NoRefreshToken);
    }
    let token = api::refresh_session(http, base_url, &current.refresh_token).await?;
    Ok(Credential {
        access_token: token.access_token,
        refresh_token: token.refresh_token.unwrap_or(current.refresh_token),
    })
}

#[cfg(test)]
#[path = "renewal_tests.rs"]
mod tests;
