// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary to the emulator's control protocol.
//!
//! The framework does not implement the wire format; it drives an
//! object-safe [`ControlChannel`] and ships an implementation of it for
//! [`qmp_client::QmpClient`]. Wire argument keys are hyphenated while
//! callers write underscored Rust identifiers, so [`wire_args`] translates
//! at the boundary.

use qmp_client::{Event, QmpClient, QmpError};
use serde_json::{Map, Value};

pub trait ControlChannel: Send + Sync {
    /// Issues a command and blocks for its response.
    fn send_command(&self, name: &str, args: Map<String, Value>) -> Result<Value, QmpError>;

    /// Returns the next asynchronous event, blocking for one if `wait` is
    /// set.
    fn pull_event(&self, wait: bool) -> Result<Option<Event>, QmpError>;

    /// A snapshot of every event received so far and not yet cleared.
    fn pending_events(&self) -> Result<Vec<Event>, QmpError>;

    fn clear_events(&self);
}

impl ControlChannel for QmpClient {
    fn send_command(&self, name: &str, args: Map<String, Value>) -> Result<Value, QmpError> {
        self.execute(name, args)
    }

    fn pull_event(&self, wait: bool) -> Result<Option<Event>, QmpError> {
        QmpClient::pull_event(self, wait)
    }

    fn pending_events(&self) -> Result<Vec<Event>, QmpError> {
        QmpClient::pending_events(self)
    }

    fn clear_events(&self) {
        QmpClient::clear_events(self)
    }
}

/// Translates underscored argument keys to their hyphenated wire form.
pub(crate) fn wire_args(args: &[(&str, Value)]) -> Map<String, Value> {
    args.iter().map(|(key, value)| (key.replace('_', "-"), value.clone())).collect()
}
