// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live migration support: the error taxonomy and the bounded status poll.
//!
//! The transfer itself is not cancellable from here, and status queries are
//! cheap, so the orchestrator simply polls `query-migrate` at a fixed
//! cadence until the remote reports a terminal state or the configured
//! deadline lapses. Timing out forces the same cleanup as a failure so the
//! destination process is never leaked.

use std::time::Duration;

use qmp_client::QmpError;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::monitor::ControlChannel;

/// The one transport the orchestrator knows how to drive.
pub const MIGRATION_PROTOCOL: &str = "tcp";

/// Fixed cadence of the status poll.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("unsupported migration protocol {0:?} (only \"tcp\" is supported)")]
    UnsupportedProtocol(String),

    #[error("the source VM is not powered on")]
    SourceNotRunning,

    #[error("the remote reported the migration as failed")]
    Failed,

    #[error("migration did not reach a terminal state within {0:?}")]
    TimedOut(Duration),

    #[error("control channel error during migration: {0}")]
    Channel(#[from] QmpError),

    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

/// Polls the source's migration status until `completed` (Ok), `failed`,
/// or the deadline.
pub(crate) fn poll_until_terminal(
    channel: &dyn ControlChannel,
    timeout: Duration,
) -> Result<(), MigrateError> {
    let watch = || -> Result<(), backoff::Error<MigrateError>> {
        let status = channel
            .send_command("query-migrate", Map::new())
            .map_err(|e| backoff::Error::Permanent(MigrateError::Channel(e)))?;
        match status.get("status").and_then(Value::as_str) {
            Some("completed") => Ok(()),
            Some("failed") => Err(backoff::Error::Permanent(MigrateError::Failed)),
            _ => Err(backoff::Error::transient(MigrateError::TimedOut(timeout))),
        }
    };

    let policy = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(POLL_INTERVAL)
        .with_randomization_factor(0.0)
        .with_multiplier(1.0)
        .with_max_interval(POLL_INTERVAL)
        .with_max_elapsed_time(Some(timeout))
        .build();
    backoff::retry(policy, watch).map_err(|e| match e {
        backoff::Error::Permanent(err) => err,
        backoff::Error::Transient { err, .. } => err,
    })
}
