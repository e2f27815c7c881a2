// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small synchronous client for QEMU's QMP control socket.
//!
//! QMP frames are JSON objects, one per line. The emulator pushes a greeting
//! when the connection is established, after which the client must negotiate
//! capabilities before any other command is accepted. Responses to commands
//! are interleaved with asynchronous event frames; this client queues events
//! internally so that a command exchange always observes its own response.
//!
//! The usual arrangement for a test fixture is server mode: the fixture
//! binds the socket with [`QmpListener::bind`] *before* launching the
//! emulator (whose `-mon` chardev is configured to connect outward), then
//! calls [`QmpListener::accept`] once the process is up.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, trace};

/// How long to sleep between accept attempts while waiting for the emulator
/// to connect.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Read timeout used when draining frames without blocking.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum QmpError {
    /// The socket itself failed. For background consumers this usually just
    /// means the emulator has gone away.
    #[error("control socket I/O error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("malformed control protocol frame: {0}")]
    Protocol(String),

    #[error("command {command} failed: {class}: {desc}")]
    CommandFailed { command: String, class: String, desc: String },
}

impl QmpError {
    /// True if this error indicates the transport is gone rather than a
    /// protocol-level complaint from a live peer.
    pub fn is_transport(&self) -> bool {
        matches!(self, QmpError::Transport(_))
    }
}

/// An asynchronous event frame pushed by the emulator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Value,
}

fn as_event(frame: &Value) -> Option<Event> {
    frame.get("event")?;
    serde_json::from_value(frame.clone()).ok()
}

#[derive(Debug)]
struct Inner {
    stream: UnixStream,
    reader: BufReader<UnixStream>,

    /// Partially received frame text. `read_frame` may give up mid-line on a
    /// read timeout; the bytes received so far are kept here so the next
    /// read resumes where this one stopped.
    partial: String,

    events: VecDeque<Event>,
}

impl Inner {
    fn new(stream: UnixStream) -> Result<Self, QmpError> {
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader, partial: String::new(), events: VecDeque::new() })
    }

    fn write_frame(&mut self, frame: &Value) -> Result<(), QmpError> {
        let mut line = frame.to_string();
        trace!(%line, "-> qmp");
        line.push('\n');
        self.stream.write_all(line.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads one frame. With `timeout == None` this blocks until a full
    /// frame arrives or the peer hangs up; otherwise it returns `Ok(None)`
    /// if no complete frame arrived within the timeout.
    fn read_frame(&mut self, timeout: Option<Duration>) -> Result<Option<Value>, QmpError> {
        self.stream.set_read_timeout(timeout)?;
        match self.reader.read_line(&mut self.partial) {
            Ok(0) => Err(QmpError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control socket closed by peer",
            ))),
            Ok(_) => {
                let line = std::mem::take(&mut self.partial);
                let line = line.trim();
                trace!(%line, "<- qmp");
                let frame = serde_json::from_str(line)
                    .map_err(|e| QmpError::Protocol(format!("{e} in frame {line:?}")))?;
                Ok(Some(frame))
            }
            Err(e)
                if timeout.is_some()
                    && matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_frame_blocking(&mut self) -> Result<Value, QmpError> {
        // read_frame only reports None on timeout, which cannot happen here.
        Ok(self.read_frame(None)?.unwrap_or(Value::Null))
    }

    /// Pulls frames off the socket until it would block, queueing events.
    fn drain_events(&mut self) -> Result<(), QmpError> {
        while let Some(frame) = self.read_frame(Some(DRAIN_POLL_INTERVAL))? {
            match as_event(&frame) {
                Some(event) => self.events.push_back(event),
                None => {
                    return Err(QmpError::Protocol(format!(
                        "unsolicited non-event frame {frame}"
                    )))
                }
            }
        }
        Ok(())
    }
}

/// A server-mode endpoint for the emulator's control socket. Bind it before
/// launching the emulator so the connection it makes on startup is not
/// refused.
pub struct QmpListener {
    listener: UnixListener,
}

impl QmpListener {
    pub fn bind(path: &Path) -> Result<Self, QmpError> {
        let listener = UnixListener::bind(path)?;
        debug!(path = %path.display(), "listening for control connection");
        Ok(Self { listener })
    }

    /// Waits up to `timeout` for the emulator to connect, then performs the
    /// greeting and capability negotiation.
    pub fn accept(self, timeout: Duration) -> Result<QmpClient, QmpError> {
        self.listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match self.listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(QmpError::Transport(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("no control connection within {timeout:?}"),
                        )));
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_nonblocking(false)?;
        QmpClient::negotiate(stream)
    }
}

/// A connected, capability-negotiated control channel.
///
/// All methods take `&self`; an internal lock serializes command exchanges,
/// so the client may be shared between the thread driving VM lifecycle
/// transitions and background samplers.
#[derive(Debug)]
pub struct QmpClient {
    inner: Mutex<Inner>,
}

impl QmpClient {
    /// Client-mode connection to a socket the emulator is listening on.
    pub fn connect(path: &Path) -> Result<Self, QmpError> {
        let stream = UnixStream::connect(path)?;
        Self::negotiate(stream)
    }

    fn negotiate(stream: UnixStream) -> Result<Self, QmpError> {
        let mut inner = Inner::new(stream)?;
        let greeting = inner.read_frame_blocking()?;
        if greeting.get("QMP").is_none() {
            return Err(QmpError::Protocol(format!("unexpected greeting {greeting}")));
        }
        let mut request = Map::new();
        request.insert("execute".to_string(), Value::String("qmp_capabilities".to_string()));
        inner.write_frame(&Value::Object(request))?;
        loop {
            let frame = inner.read_frame_blocking()?;
            if let Some(event) = as_event(&frame) {
                inner.events.push_back(event);
            } else if frame.get("return").is_some() {
                break;
            } else {
                return Err(QmpError::Protocol(format!(
                    "capability negotiation rejected: {frame}"
                )));
            }
        }
        debug!("control channel negotiated");
        Ok(Self { inner: Mutex::new(inner) })
    }

    /// Executes `name` with the given (already hyphenated) arguments and
    /// blocks until its response arrives. Event frames received while
    /// waiting are queued for [`Self::pull_event`].
    pub fn execute(&self, name: &str, args: Map<String, Value>) -> Result<Value, QmpError> {
        let mut inner = self.inner.lock().unwrap();
        let mut request = Map::new();
        request.insert("execute".to_string(), Value::String(name.to_string()));
        if !args.is_empty() {
            request.insert("arguments".to_string(), Value::Object(args));
        }
        inner.write_frame(&Value::Object(request))?;
        loop {
            let frame = inner.read_frame_blocking()?;
            if let Some(event) = as_event(&frame) {
                inner.events.push_back(event);
                continue;
            }
            if let Some(ret) = frame.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = frame.get("error") {
                let field = |key| {
                    err.get(key).and_then(Value::as_str).unwrap_or("<unset>").to_string()
                };
                return Err(QmpError::CommandFailed {
                    command: name.to_string(),
                    class: field("class"),
                    desc: field("desc"),
                });
            }
            return Err(QmpError::Protocol(format!("unexpected response frame {frame}")));
        }
    }

    /// Returns the next queued event, if any. With `wait` set, blocks until
    /// an event arrives or the transport fails.
    pub fn pull_event(&self, wait: bool) -> Result<Option<Event>, QmpError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(event) = inner.events.pop_front() {
                return Ok(Some(event));
            }
            if wait {
                let frame = inner.read_frame_blocking()?;
                match as_event(&frame) {
                    Some(event) => return Ok(Some(event)),
                    None => {
                        return Err(QmpError::Protocol(format!(
                            "unsolicited non-event frame {frame}"
                        )))
                    }
                }
            } else {
                inner.drain_events()?;
                return Ok(inner.events.pop_front());
            }
        }
    }

    /// Drains the socket and returns a snapshot of every pending event
    /// without consuming the queue.
    pub fn pending_events(&self) -> Result<Vec<Event>, QmpError> {
        let mut inner = self.inner.lock().unwrap();
        inner.drain_events()?;
        Ok(inner.events.iter().cloned().collect())
    }

    pub fn clear_events(&self) {
        self.inner.lock().unwrap().events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;

    /// A scripted emulator endpoint: performs the greeting exchange, then
    /// answers each incoming execute frame with the next scripted response
    /// line (several lines may be sent per request, e.g. an event before the
    /// return frame).
    fn fake_emulator(path: std::path::PathBuf, scripted: Vec<Vec<String>>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let stream = loop {
                match UnixStream::connect(&path) {
                    Ok(s) => break s,
                    Err(_) => std::thread::sleep(Duration::from_millis(5)),
                }
            };
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            writeln!(writer, r#"{{"QMP": {{"version": {{}}, "capabilities": []}}}}"#).unwrap();

            // Capability negotiation.
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert!(line.contains("qmp_capabilities"));
            writeln!(writer, r#"{{"return": {{}}}}"#).unwrap();

            for responses in scripted {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                for response in responses {
                    writeln!(writer, "{response}").unwrap();
                }
            }
        })
    }

    fn accept_scripted(
        scripted: Vec<Vec<String>>,
    ) -> (QmpClient, std::thread::JoinHandle<()>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mon.sock");
        let listener = QmpListener::bind(&path).unwrap();
        let emulator = fake_emulator(path, scripted);
        let client = listener.accept(Duration::from_secs(5)).unwrap();
        (client, emulator, dir)
    }

    #[test]
    fn execute_returns_payload() {
        let (client, emulator, _dir) = accept_scripted(vec![vec![
            r#"{"return": {"status": "running"}}"#.to_string(),
        ]]);
        let ret = client.execute("query-status", Map::new()).unwrap();
        assert_eq!(ret["status"], "running");
        drop(client);
        emulator.join().unwrap();
    }

    #[test]
    fn events_interleaved_with_response_are_queued() {
        let (client, emulator, _dir) = accept_scripted(vec![vec![
            r#"{"event": "STOP", "data": {}, "timestamp": {"seconds": 1}}"#.to_string(),
            r#"{"return": {}}"#.to_string(),
        ]]);
        client.execute("stop", Map::new()).unwrap();
        let event = client.pull_event(false).unwrap().unwrap();
        assert_eq!(event.event, "STOP");
        assert_eq!(client.pull_event(false).unwrap(), None);
        drop(client);
        emulator.join().unwrap();
    }

    #[test]
    fn command_error_is_reported() {
        let (client, emulator, _dir) = accept_scripted(vec![vec![
            r#"{"error": {"class": "CommandNotFound", "desc": "nope"}}"#.to_string(),
        ]]);
        let err = client.execute("bogus", Map::new()).unwrap_err();
        match err {
            QmpError::CommandFailed { command, class, .. } => {
                assert_eq!(command, "bogus");
                assert_eq!(class, "CommandNotFound");
            }
            other => panic!("unexpected error {other:?}"),
        }
        drop(client);
        emulator.join().unwrap();
    }

    #[test]
    fn pending_events_snapshot_and_clear() {
        let (client, emulator, _dir) = accept_scripted(vec![vec![
            r#"{"event": "RESET", "data": {}, "timestamp": {}}"#.to_string(),
            r#"{"event": "RESUME", "data": {}, "timestamp": {}}"#.to_string(),
            r#"{"return": {}}"#.to_string(),
        ]]);
        client.execute("cont", Map::new()).unwrap();
        let events = client.pending_events().unwrap();
        assert_eq!(
            events.iter().map(|e| e.event.as_str()).collect::<Vec<_>>(),
            vec!["RESET", "RESUME"]
        );
        // The snapshot does not consume.
        assert_eq!(client.pending_events().unwrap().len(), 2);
        client.clear_events();
        assert_eq!(client.pull_event(false).unwrap(), None);
        drop(client);
        emulator.join().unwrap();
    }

    #[test]
    fn transport_loss_surfaces_as_transport_error() {
        let (client, emulator, _dir) = accept_scripted(vec![]);
        emulator.join().unwrap();
        let err = client.execute("query-status", Map::new()).unwrap_err();
        assert!(err.is_transport(), "expected transport error, got {err:?}");
    }

    #[test]
    fn accept_times_out_without_a_peer() {
        let dir = tempfile::tempdir().unwrap();
        let listener = QmpListener::bind(&dir.path().join("mon.sock")).unwrap();
        let err = listener.accept(Duration::from_millis(50)).unwrap_err();
        assert!(err.is_transport());
    }
}
