// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thumbwatch: job progress tracking over push and poll, with single-flight
//! session renewal.

pub mod api;
pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod gateway;
pub mod poll;
pub mod push;
pub mod registry;
pub mod session;
pub mod signal;
pub mod test_support;

pub use config::ClientConfig;
pub use credential::Credential;
pub use error::ClientError;
pub use events::{JobId, ProgressEvent, ProgressStatus};
pub use registry::TrackOptions;
pub use session::Session;
pub use signal::SessionSignal;
