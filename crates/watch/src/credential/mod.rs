// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session credentials: the store and the single-flight renewal coordinator.
//!
//! The store is plain storage. The coordinator is the only writer while a
//! renewal is in flight; sign-in is the only other writer and never races
//! with renewal because renewal only starts after a credential exists.

pub mod persist;
pub mod renewal;

use std::fmt;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Access/refresh token pair. Expiry is validated by the server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self { access_token: access_token.into(), refresh_token: refresh_token.into() }
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Holds the current credential, optionally mirrored to a JSON file.
pub struct CredentialStore {
    current: RwLock<Option<Credential>>,
    path: Option<PathBuf>,
}

impl CredentialStore {
    /// In-memory store.
    pub fn new() -> Self {
        Self { current: RwLock::new(None), path: None }
    }

    /// Store backed by `path`, seeded from it if the file exists.
    pub fn persisted(path: PathBuf) -> Self {
        let current = match persist::load(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "failed to load credential file");
                None
            }
        };
        Self { current: RwLock::new(current), path: Some(path) }
    }

    pub fn get(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current.read().as_ref().map(|c| c.access_token.clone())
    }

    /// Replace the credential.
    pub fn set(&self, credential: Credential) {
        let mut current = self.current.write();
        if let Some(ref path) = self.path {
            if let Err(e) = persist::save(path, &credential) {
                tracing::warn!(path = %path.display(), err = %e, "failed to persist credential");
            }
        }
        *current = Some(credential);
    }

    /// Drop the credential. Returns what was stored.
    pub fn clear(&self) -> Option<Credential> {
        let mut current = self.current.write();
        if let Some(ref path) = self.path {
            if let Err(e) = persist::remove(path) {
                tracing::warn!(
                    path = %path.display(),
                    err = %e,
                    "failed to remove credential file"
                );
            }
        }
        current.take()
    }

    pub fn is_signed_in(&self) -> bool {
        self.current.read().is_some()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "credential_tests.rs"]
mod tests;
