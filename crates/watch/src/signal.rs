// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! UI-facing session signals.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::events::JobId;

/// Signals for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SessionSignal {
    /// The session is gone; redirect to sign-in.
    SignInRequired,
    /// The push channel gave up; progress now depends on polling.
    ConnectivityLost { reason: String },
    /// The push channel reconnected after a drop.
    ConnectivityRestored,
    /// Polling for a job keeps failing but continues.
    PollingDegraded { job_id: JobId, consecutive_failures: u32 },
    /// Polling for a job succeeded again after being degraded.
    PollingRecovered { job_id: JobId },
}

/// Broadcast hub for [`SessionSignal`]s.
///
/// `SignInRequired` is latched: however many requests fail at once, it is
/// sent once per signed-in session.
pub struct SignalHub {
    tx: broadcast::Sender<SessionSignal>,
    signed_out: AtomicBool,
}

impl SignalHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx, signed_out: AtomicBool::new(false) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.tx.subscribe()
    }

    pub fn emit(&self, signal: SessionSignal) {
        // No receivers is fine.
        let _ = self.tx.send(signal);
    }

    /// Emit `SignInRequired` unless already emitted for this session.
    /// Returns whether this call emitted it.
    pub fn sign_in_required(&self) -> bool {
        if self.signed_out.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::info!("session expired, sign-in required");
        self.emit(SessionSignal::SignInRequired);
        true
    }

    /// Re-arm the sign-out latch after a fresh sign-in.
    pub fn session_started(&self) {
        self.signed_out.store(false, Ordering::Release);
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}
