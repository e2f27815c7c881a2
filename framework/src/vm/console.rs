// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The guest serial console.
//!
//! The emulator exposes the guest's serial port as a listening Unix socket
//! (`server,nowait` chardev). The console connects to it, mirrors
//! everything the guest writes into a per-VM log file from a background
//! reader thread, and lets callers inject input bytes.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use camino::Utf8Path;
use tracing::{debug, warn};

/// The emulator may still be setting its chardevs up when we attach; retry
/// the connect briefly rather than racing it.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct SerialConsole {
    stream: UnixStream,
    reader: Option<JoinHandle<()>>,
}

impl SerialConsole {
    pub(crate) fn connect(socket: &Utf8Path, log_path: &Utf8Path) -> Result<Self> {
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let stream = loop {
            match UnixStream::connect(socket) {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e)
                            .with_context(|| format!("connecting to serial socket {socket}"));
                    }
                    std::thread::sleep(CONNECT_POLL_INTERVAL);
                }
            }
        };

        let mut log = std::fs::File::create(log_path)
            .with_context(|| format!("creating serial console log {log_path}"))?;
        let mut read_half =
            stream.try_clone().context("cloning serial stream for the reader")?;
        let reader = std::thread::Builder::new()
            .name("serial-console".to_string())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match read_half.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Err(e) = log.write_all(&buf[..n]) {
                                warn!(error = %e, "serial console log write failed");
                                break;
                            }
                        }
                    }
                }
                debug!("serial console reader finished");
            })
            .context("spawning serial console reader")?;

        Ok(Self { stream, reader: Some(reader) })
    }

    /// Sends bytes to the guest's serial port.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).context("writing to serial socket")
    }

    /// Shuts the socket down and waits for the reader to flush out.
    pub(crate) fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for SerialConsole {
    fn drop(&mut self) {
        self.close();
    }
}
