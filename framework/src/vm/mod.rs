// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routines for starting emulator instances, commanding them over the
//! control channel, and migrating guests between them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use qmp_client::{Event, QmpListener};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::cmdline;
use crate::devices::{DeviceKind, DeviceModel};
use crate::log_config::OutputMode;
use crate::monitor::{self, ControlChannel};
use crate::params::Params;
use crate::path;
use crate::port_allocator::PortAllocator;

mod console;
mod migrate;
mod process;
mod screendump;

pub use console::SerialConsole;
pub use migrate::{MigrateError, MIGRATION_PROTOCOL};
pub use process::EmulatorProcess;
pub use screendump::VideoEncoder;

use screendump::{SamplerConfig, ScreendumpSampler, StopReason};

/// How long to wait for a freshly spawned emulator to connect back to the
/// control socket.
const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum VmStateError {
    #[error("VM is already powered on")]
    AlreadyRunning,

    #[error("operation requires a powered-on VM")]
    NotRunning,
}

/// Everything that only exists while the emulator process runs.
struct Runtime {
    process: EmulatorProcess,
    channel: Arc<dyn ControlChannel>,
    console: SerialConsole,
    serial_socket: Utf8PathBuf,
}

/// Removes a transient socket path when dropped, no matter which way the
/// surrounding sequence exited.
struct PathGuard {
    path: Utf8PathBuf,
    armed: bool,
}

impl PathGuard {
    fn new(path: Utf8PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn ephemeral_socket_path(tag: &str) -> Utf8PathBuf {
    let dir = Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
    let mut nonce = Uuid::new_v4().simple().to_string();
    nonce.truncate(8);
    dir.join(format!("godwit-{nonce}-{tag}.sock"))
}

/// One emulator instance.
///
/// A `Vm` is constructed powered off. `power_on` launches and supervises
/// the emulator process; `power_off` is idempotent and releases every
/// session-bound resource. Dropping a running `Vm` shuts it down
/// best-effort, so a panicking test never leaks an emulator.
pub struct Vm {
    id: Uuid,
    params: Params,
    devices: DeviceModel,
    logdir: Utf8PathBuf,
    output_mode: OutputMode,
    video_encoder: Option<Arc<dyn VideoEncoder>>,
    runtime: Option<Runtime>,
    sampler: Option<ScreendumpSampler>,
    span: tracing::Span,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("logdir", &self.logdir)
            .field("output_mode", &self.output_mode)
            .field("running", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// Builds a powered-off VM whose device model holds only the resolved
    /// emulator binary. Devices are added through [`Vm::devices_mut`].
    pub fn new(
        params: Params,
        logdir: &Utf8Path,
        output_mode: OutputMode,
        ports: Arc<PortAllocator>,
    ) -> Result<Self> {
        let binary = path::qemu_binary(&params).context("resolving emulator binary")?;
        let devices = DeviceModel::new(binary, params.clone(), ports);
        Ok(Self::assemble(Uuid::new_v4(), params, devices, logdir.to_path_buf(), output_mode, None))
    }

    fn assemble(
        id: Uuid,
        params: Params,
        devices: DeviceModel,
        logdir: Utf8PathBuf,
        output_mode: OutputMode,
        video_encoder: Option<Arc<dyn VideoEncoder>>,
    ) -> Self {
        let short = short_of(&id);
        let span = info_span!(parent: None, "VM", vm = %short, %id);
        Self {
            id,
            params,
            devices,
            logdir,
            output_mode,
            video_encoder,
            runtime: None,
            sampler: None,
            span,
        }
    }

    /// The identifier used for log correlation. A migration successor keeps
    /// its predecessor's identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn short_id(&self) -> String {
        short_of(&self.id)
    }

    pub fn devices(&self) -> &DeviceModel {
        &self.devices
    }

    /// The device model may only be reshaped while the VM is powered off;
    /// `render()` and mutation must not race an in-flight `power_on` or
    /// `migrate`, and the model is owned by the thread driving those
    /// transitions.
    pub fn devices_mut(&mut self) -> &mut DeviceModel {
        &mut self.devices
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.runtime.as_ref().map(|r| r.process.pid())
    }

    /// Installs the collaborator that turns screendump captures into a
    /// video when sampling ends.
    pub fn set_video_encoder(&mut self, encoder: Arc<dyn VideoEncoder>) {
        self.video_encoder = Some(encoder);
    }

    /// Launches the emulator.
    ///
    /// The step ordering is load-bearing: the control socket must be
    /// listening before the process spawns (the emulator connects outward
    /// to it during startup, and a refused connect wedges the handshake),
    /// and the transient control-socket path is removed once the
    /// connection is accepted or the attempt abandoned.
    pub fn power_on(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            return Err(VmStateError::AlreadyRunning.into());
        }
        let span = self.span.clone();
        let _guard = span.enter();

        let monitor_socket = ephemeral_socket_path("mon");
        let serial_socket = ephemeral_socket_path("serial");

        // Fresh session sockets; stale devices from an earlier run are
        // replaced rather than accumulated.
        if self.devices.has(DeviceKind::Monitor) {
            self.devices.remove(DeviceKind::Monitor)?;
        }
        self.devices.add_monitor(&monitor_socket);
        if self.devices.has(DeviceKind::Serial) {
            self.devices.remove(DeviceKind::Serial)?;
        }
        self.devices.add_serial(&serial_socket);

        let listener = QmpListener::bind(monitor_socket.as_std_path())
            .with_context(|| format!("binding control socket {monitor_socket}"))?;
        let monitor_guard = PathGuard::new(monitor_socket);
        let serial_guard = PathGuard::new(serial_socket.clone());

        let cmdline = cmdline::compose(&self.devices, self.params.qemu_template.as_deref())
            .context("composing emulator command line")?;
        let (stdout, stderr) = self
            .output_mode
            .stdio_handles(&self.logdir, &format!("{}.emulator", self.short_id()))?;
        let process = EmulatorProcess::spawn(&cmdline, stdout, stderr)?;

        let channel = listener
            .accept(CONTROL_CONNECT_TIMEOUT)
            .context("accepting the emulator's control connection")?;
        let channel: Arc<dyn ControlChannel> = Arc::new(channel);
        drop(monitor_guard);

        let console_log = self.logdir.join(format!("serial-console-{}.log", self.short_id()));
        let console = SerialConsole::connect(&serial_socket, &console_log)?;

        info!(pid = process.pid(), "powered on");
        serial_guard.disarm();
        self.runtime = Some(Runtime {
            process,
            channel: Arc::clone(&channel),
            console,
            serial_socket,
        });

        if self.params.take_screendumps {
            self.start_sampler(channel)?;
        }
        Ok(())
    }

    /// Shuts the emulator down. A no-op on a VM that is not running, so it
    /// is always safe to call again.
    pub fn power_off(&mut self, graceful: bool) -> Result<()> {
        let span = self.span.clone();
        let _guard = span.enter();
        let Some(mut runtime) = self.runtime.take() else {
            return Ok(());
        };

        // The sampler is joined before any shutdown command goes out, so no
        // capture can race the channel closing underneath it.
        self.stop_sampler(StopReason::PowerOff);

        if graceful {
            match runtime.channel.send_command("quit", Map::new()) {
                Ok(_) => {
                    runtime.process.wait()?;
                }
                Err(e) => {
                    warn!(error = %e, "graceful shutdown failed, killing emulator");
                    runtime.process.kill()?;
                }
            }
        } else {
            runtime.process.kill()?;
        }

        runtime.console.close();
        if let Err(e) = std::fs::remove_file(&runtime.serial_socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, socket = %runtime.serial_socket, "failed to remove serial socket");
            }
        }
        info!("shut down");
        Ok(())
    }

    fn start_sampler(&mut self, channel: Arc<dyn ControlChannel>) -> Result<()> {
        let sampler = ScreendumpSampler::start(SamplerConfig {
            channel,
            output_dir: self.logdir.join("screendumps").join(self.short_id()),
            interval: self.params.screendump_interval,
            encoder: if self.params.record_videos { self.video_encoder.clone() } else { None },
            jpeg_quality: self.params.video_jpeg_quality,
            video_output: self.logdir.join(format!("{}.webm", self.short_id())),
        })?;
        self.sampler = Some(sampler);
        Ok(())
    }

    fn stop_sampler(&mut self, reason: StopReason) {
        if let Some(sampler) = self.sampler.take() {
            sampler.stop(reason);
        }
    }

    fn channel(&self) -> Result<&Arc<dyn ControlChannel>, VmStateError> {
        self.runtime.as_ref().map(|r| &r.channel).ok_or(VmStateError::NotRunning)
    }

    /// Issues a control-protocol command. Argument keys may use underscores
    /// and are translated to their hyphenated wire form.
    pub fn qmp(&self, cmd: &str, args: &[(&str, Value)]) -> Result<Value> {
        self.qmp_with_verbosity(cmd, args, true)
    }

    pub fn qmp_with_verbosity(
        &self,
        cmd: &str,
        args: &[(&str, Value)],
        verbose: bool,
    ) -> Result<Value> {
        let channel = self.channel()?;
        let args = monitor::wire_args(args);
        let _guard = self.span.enter();
        if verbose {
            info!(%cmd, ?args, "-> control");
        }
        let response = channel.send_command(cmd, args)?;
        if verbose {
            info!(%cmd, %response, "<- control");
        }
        Ok(response)
    }

    /// The next asynchronous event, if any; blocks for one when `wait` is
    /// set.
    pub fn qmp_event(&self, wait: bool) -> Result<Option<Event>> {
        Ok(self.channel()?.pull_event(wait)?)
    }

    /// Every event received so far; the pending queue is cleared.
    pub fn qmp_events(&self) -> Result<Vec<Event>> {
        let channel = self.channel()?;
        let events = channel.pending_events()?;
        channel.clear_events();
        Ok(events)
    }

    /// Runs a `qemu-io` command against a named drive through the
    /// human-monitor passthrough.
    pub fn qemu_io(&self, drive: &str, cmd: &str) -> Result<Value> {
        self.qmp(
            "human-monitor-command",
            &[("command_line", Value::String(format!("qemu-io {drive} \"{cmd}\"")))],
        )
    }

    /// Suspends I/O on a drive by installing a breakpoint. With no event,
    /// both reads and writes are paused.
    pub fn pause_drive(&self, drive: &str, event: Option<&str>) -> Result<()> {
        match event {
            None => {
                self.pause_drive(drive, Some("read_aio"))?;
                self.pause_drive(drive, Some("write_aio"))
            }
            Some(event) => {
                self.qemu_io(drive, &format!("break {event} bp_{drive}")).map(drop)
            }
        }
    }

    pub fn resume_drive(&self, drive: &str) -> Result<()> {
        self.qemu_io(drive, &format!("remove_break bp_{drive}")).map(drop)
    }

    /// Clones this VM into a new powered-off instance: same parameters,
    /// device model cloned per the successor rules (no session-bound
    /// devices, fresh ports). With `fresh_identity` the clone gets its own
    /// identifier; otherwise it inherits this VM's, which is what a
    /// migration destination wants.
    pub fn clone_vm(&self, fresh_identity: bool) -> Result<Vm> {
        let devices = self.devices.clone_for_successor(None)?;
        let id = if fresh_identity { Uuid::new_v4() } else { self.id };
        Ok(Self::assemble(
            id,
            self.params.clone(),
            devices,
            self.logdir.clone(),
            self.output_mode,
            self.video_encoder.clone(),
        ))
    }

    /// Migrates the guest to a fresh instance of the destination emulator
    /// binary and returns that instance as the new authoritative VM (under
    /// this VM's identity); the caller replaces its handle with the
    /// returned value. On any failure the destination is discarded and
    /// `self` remains authoritative.
    ///
    /// On success the retired source has already been powered off.
    pub fn migrate(&mut self, protocol: &str) -> Result<Vm, MigrateError> {
        if protocol != MIGRATION_PROTOCOL {
            return Err(MigrateError::UnsupportedProtocol(protocol.to_string()));
        }
        let Some(runtime) = &self.runtime else {
            return Err(MigrateError::SourceNotRunning);
        };
        let channel = Arc::clone(&runtime.channel);
        let span = self.span.clone();
        let _guard = span.enter();

        let dst_binary = path::qemu_dst_binary(&self.params)
            .map_err(|e| MigrateError::Setup(e.into()))?;
        let mut devices = self
            .devices
            .clone_for_successor(Some(&dst_binary))
            .map_err(|e| MigrateError::Setup(e.into()))?;
        let inbound_port =
            devices.add_incoming(MIGRATION_PROTOCOL).map_err(|e| MigrateError::Setup(e.into()))?;
        let mut destination = Vm::assemble(
            self.id,
            self.params.clone(),
            devices,
            self.logdir.clone(),
            self.output_mode,
            self.video_encoder.clone(),
        );

        // The capture stream pauses here and resumes on the destination;
        // this join completes before the destination starts.
        self.stop_sampler(StopReason::Migration);

        info!(inbound_port, "starting migration destination");
        if let Err(e) = destination.power_on() {
            return Err(MigrateError::Setup(e.context("powering on migration destination")));
        }

        let uri = format!("{MIGRATION_PROTOCOL}:localhost:{inbound_port}");
        info!(%uri, "requesting migration");
        let mut args = Map::new();
        args.insert("uri".to_string(), Value::String(uri));
        if let Err(e) = channel.send_command("migrate", args) {
            discard(&mut destination);
            return Err(MigrateError::Channel(e));
        }

        match migrate::poll_until_terminal(channel.as_ref(), self.params.migrate_timeout) {
            Ok(()) => {
                info!("migration completed, retiring the source instance");
                if let Err(e) = self.power_off(true) {
                    warn!(error = ?e, "failed to retire the migration source cleanly");
                }
                Ok(destination)
            }
            Err(e) => {
                warn!(error = %e, "migration did not complete, source remains authoritative");
                discard(&mut destination);
                Err(e)
            }
        }
    }
}

fn discard(destination: &mut Vm) {
    if let Err(e) = destination.power_off(false) {
        warn!(error = ?e, "failed to discard migration destination");
    }
}

fn short_of(id: &Uuid) -> String {
    let mut s = id.simple().to_string();
    s.truncate(8);
    s
}

impl Drop for Vm {
    fn drop(&mut self) {
        if self.runtime.is_none() {
            return;
        }
        if let Err(e) = self.power_off(true) {
            warn!(vm = %self.short_id(), error = ?e, "failed to shut down VM on drop");
        }
    }
}
