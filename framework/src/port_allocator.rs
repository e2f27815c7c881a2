// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small allocator for selecting TCP port numbers.
//!
//! One allocator instance is shared (via `Arc`) by every VM and device model
//! in a harness, so ports handed to a migration destination can never
//! collide with ports the source already claimed.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortAllocatorError {
    #[error("port {0} is reserved or in use")]
    PortInUse(u16),

    #[error("no free port between {0} and {1}")]
    PortExhausted(u16, u16),
}

/// Tracks the TCP ports claimed for this run.
///
/// Reservations are internal bookkeeping only: the allocator never binds the
/// ports it hands out, it merely promises not to hand the same port out
/// twice until [`PortAllocator::release_port`] is called. Whether a port is
/// free on the host is checked with a probe bind at allocation time, which
/// leaves an unavoidable window in which an unrelated process can grab the
/// port before the emulator binds it. That race is inherited from the
/// probe-then-use design and is not papered over here.
pub struct PortAllocator {
    reserved: Mutex<BTreeSet<u16>>,
    ceiling: u16,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_ceiling(u16::MAX)
    }

    /// An allocator whose upward scans stop at `ceiling` (inclusive) with
    /// [`PortAllocatorError::PortExhausted`].
    pub fn with_ceiling(ceiling: u16) -> Self {
        Self { reserved: Mutex::new(BTreeSet::new()), ceiling }
    }

    /// Scans upward from `start`, skipping ports already reserved by this
    /// allocator or busy on the host, and reserves the first eligible port.
    pub fn find_free_port(&self, start: u16) -> Result<u16, PortAllocatorError> {
        let mut reserved = self.reserved.lock().unwrap();
        let mut port = start;
        loop {
            if !reserved.contains(&port) && host_port_is_free(port) {
                reserved.insert(port);
                return Ok(port);
            }
            if port >= self.ceiling {
                return Err(PortAllocatorError::PortExhausted(start, self.ceiling));
            }
            port += 1;
        }
    }

    /// Reserves a specific port, failing if it is already reserved or busy
    /// on the host.
    pub fn register_port(&self, port: u16) -> Result<(), PortAllocatorError> {
        let mut reserved = self.reserved.lock().unwrap();
        if reserved.contains(&port) || !host_port_is_free(port) {
            return Err(PortAllocatorError::PortInUse(port));
        }
        reserved.insert(port);
        Ok(())
    }

    /// Removes a port from the reserved set, making it eligible for reuse.
    /// A no-op if the port was not reserved.
    pub fn release_port(&self, port: u16) {
        self.reserved.lock().unwrap().remove(&port);
    }

    #[cfg(test)]
    pub(crate) fn reserved_count(&self) -> usize {
        self.reserved.lock().unwrap().len()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn host_port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
