// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic capture of the guest's display.
//!
//! While a VM runs, the sampler issues a `screendump` command on a fixed
//! interval, writing numbered PPM files into the VM's capture directory.
//! The sequence picks up after the highest index already on disk, so a
//! restarted (or migrated) instance extends the capture stream instead of
//! overwriting it.
//!
//! Stopping is a rendezvous: `stop()` raises the termination signal and
//! then joins the worker, so by the time it returns no further capture
//! command can be issued. The worker also exits on its own when the control
//! channel's transport fails, which simply means the emulator has gone
//! away.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::monitor::ControlChannel;

/// The external collaborator that turns a directory of captures into a
/// video. Invoked best-effort; failures are logged and never propagate.
pub trait VideoEncoder: Send + Sync {
    fn encode(
        &self,
        input_dir: &Utf8Path,
        output: &Utf8Path,
        jpeg_quality: u8,
    ) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// The VM is shutting down; encode a video if one was requested.
    PowerOff,

    /// The VM is migrating. The capture stream continues logically on the
    /// destination instance, so no video is encoded here.
    Migration,
}

pub(crate) struct SamplerConfig {
    pub channel: Arc<dyn ControlChannel>,
    pub output_dir: Utf8PathBuf,
    pub interval: Duration,
    pub encoder: Option<Arc<dyn VideoEncoder>>,
    pub jpeg_quality: u8,
    pub video_output: Utf8PathBuf,
}

pub(crate) struct ScreendumpSampler {
    stop_tx: Sender<StopReason>,
    worker: Option<JoinHandle<()>>,
}

impl ScreendumpSampler {
    pub(crate) fn start(config: SamplerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)
            .with_context(|| format!("creating screendump directory {}", config.output_dir))?;
        let (stop_tx, stop_rx) = bounded(1);
        let worker = std::thread::Builder::new()
            .name("screendump-sampler".to_string())
            .spawn(move || sampler_loop(config, stop_rx))
            .context("spawning screendump sampler")?;
        Ok(Self { stop_tx, worker: Some(worker) })
    }

    /// Signals termination and blocks until the worker has observed it and
    /// exited its current wait.
    pub(crate) fn stop(mut self, reason: StopReason) {
        // A send failure means the worker already exited on its own.
        let _ = self.stop_tx.send(reason);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("screendump sampler worker panicked");
            }
        }
    }
}

impl Drop for ScreendumpSampler {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.stop_tx.send(StopReason::PowerOff);
            let _ = worker.join();
        }
    }
}

fn sampler_loop(config: SamplerConfig, stop_rx: Receiver<StopReason>) {
    let mut index = next_capture_index(&config.output_dir);
    debug!(dir = %config.output_dir, index, "screendump sampler running");
    let reason = loop {
        match stop_rx.recv_timeout(config.interval) {
            Ok(reason) => break reason,
            Err(RecvTimeoutError::Disconnected) => break StopReason::PowerOff,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let file = config.output_dir.join(format!("{index:04}.ppm"));
        let mut args = Map::new();
        args.insert("filename".to_string(), Value::String(file.to_string()));
        match config.channel.send_command("screendump", args) {
            Ok(_) => match validate_ppm(&file) {
                Ok(()) => index += 1,
                // The capture is considered not produced; the same index
                // is reused on the next tick.
                Err(e) => warn!(%file, error = %e, "discarding malformed screendump"),
            },
            Err(e) if e.is_transport() => {
                debug!(error = %e, "control channel closed, screendump sampler exiting");
                break StopReason::PowerOff;
            }
            Err(e) => warn!(error = %e, "screendump command failed"),
        }
    };

    if reason == StopReason::Migration {
        return;
    }
    if let Some(encoder) = &config.encoder {
        info!(dir = %config.output_dir, output = %config.video_output, "encoding capture video");
        if let Err(e) =
            encoder.encode(&config.output_dir, &config.video_output, config.jpeg_quality)
        {
            warn!(error = ?e, "video encoding failed");
        }
    }
}

/// The index the capture sequence should continue from: one past the
/// highest `NNNN.ppm` already present.
pub(crate) fn next_capture_index(dir: &Utf8Path) -> u32 {
    let mut highest = 0;
    if let Ok(entries) = dir.read_dir_utf8() {
        for entry in entries.flatten() {
            if let Some(stem) = entry.file_name().strip_suffix(".ppm") {
                if let Ok(n) = stem.parse::<u32>() {
                    highest = highest.max(n);
                }
            }
        }
    }
    highest + 1
}

/// Checks that a capture is a well-formed binary PPM: `P6` magic, sane
/// dimensions, and a raster large enough for them.
pub(crate) fn validate_ppm(path: &Utf8Path) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading screendump {path}"))?;

    // Header fields are whitespace-delimited; '#' comments run to end of
    // line.
    let mut fields: Vec<&str> = Vec::new();
    let mut i = 0;
    while fields.len() < 4 && i < data.len() {
        match data[i] {
            b'#' => while i < data.len() && data[i] != b'\n' {
                i += 1;
            },
            c if c.is_ascii_whitespace() => i += 1,
            _ => {
                let start = i;
                while i < data.len() && !data[i].is_ascii_whitespace() && data[i] != b'#' {
                    i += 1;
                }
                fields.push(std::str::from_utf8(&data[start..i]).unwrap_or(""));
            }
        }
    }

    anyhow::ensure!(fields.len() == 4, "truncated header");
    anyhow::ensure!(fields[0] == "P6", "bad magic {:?}", fields[0]);
    let width: usize = fields[1].parse().context("parsing width")?;
    let height: usize = fields[2].parse().context("parsing height")?;
    let maxval: usize = fields[3].parse().context("parsing maxval")?;
    anyhow::ensure!(width > 0 && height > 0, "degenerate dimensions {width}x{height}");
    anyhow::ensure!(maxval > 0 && maxval < 65536, "maxval {maxval} out of range");

    // A single whitespace byte separates the header from the raster.
    let bytes_per_sample = if maxval > 255 { 2 } else { 1 };
    let raster = width * height * 3 * bytes_per_sample;
    anyhow::ensure!(
        data.len().saturating_sub(i + 1) >= raster,
        "raster holds {} of {} expected bytes",
        data.len().saturating_sub(i + 1),
        raster
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmp_client::{Event, QmpError};
    use std::sync::Mutex;

    fn write_ppm(path: &Utf8Path, width: usize, height: usize) {
        let mut data = format!("P6\n{width} {height}\n255\n").into_bytes();
        data.extend(std::iter::repeat(0u8).take(width * height * 3));
        std::fs::write(path, data).unwrap();
    }

    enum Behavior {
        CaptureValid,
        CaptureGarbage,
        FailCommand,
        DropTransport,
    }

    struct MockChannel {
        behavior: Behavior,
        requested: Mutex<Vec<String>>,
    }

    impl MockChannel {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self { behavior, requested: Mutex::new(Vec::new()) })
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    impl ControlChannel for MockChannel {
        fn send_command(&self, name: &str, args: Map<String, Value>) -> Result<Value, QmpError> {
            assert_eq!(name, "screendump");
            let filename = args["filename"].as_str().unwrap().to_string();
            self.requested.lock().unwrap().push(filename.clone());
            match self.behavior {
                Behavior::CaptureValid => {
                    write_ppm(Utf8Path::new(&filename), 4, 3);
                    Ok(Value::Object(Map::new()))
                }
                Behavior::CaptureGarbage => {
                    std::fs::write(&filename, b"not an image").unwrap();
                    Ok(Value::Object(Map::new()))
                }
                Behavior::FailCommand => Err(QmpError::CommandFailed {
                    command: name.to_string(),
                    class: "GenericError".to_string(),
                    desc: "display unavailable".to_string(),
                }),
                Behavior::DropTransport => Err(QmpError::Transport(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "emulator went away",
                ))),
            }
        }

        fn pull_event(&self, _wait: bool) -> Result<Option<Event>, QmpError> {
            Ok(None)
        }

        fn pending_events(&self) -> Result<Vec<Event>, QmpError> {
            Ok(Vec::new())
        }

        fn clear_events(&self) {}
    }

    #[derive(Default)]
    struct MockEncoder {
        invocations: Mutex<Vec<(Utf8PathBuf, Utf8PathBuf, u8)>>,
    }

    impl VideoEncoder for MockEncoder {
        fn encode(
            &self,
            input_dir: &Utf8Path,
            output: &Utf8Path,
            jpeg_quality: u8,
        ) -> Result<()> {
            self.invocations.lock().unwrap().push((
                input_dir.to_path_buf(),
                output.to_path_buf(),
                jpeg_quality,
            ));
            Ok(())
        }
    }

    fn capture_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn config(
        channel: Arc<dyn ControlChannel>,
        dir: &Utf8Path,
        encoder: Option<Arc<dyn VideoEncoder>>,
    ) -> SamplerConfig {
        SamplerConfig {
            channel,
            output_dir: dir.to_path_buf(),
            interval: Duration::from_millis(10),
            encoder,
            jpeg_quality: 95,
            video_output: dir.join("capture.webm"),
        }
    }

    #[test]
    fn sequence_resumes_after_existing_captures() {
        let (_guard, dir) = capture_dir();
        assert_eq!(next_capture_index(&dir), 1);
        write_ppm(&dir.join("0001.ppm"), 2, 2);
        write_ppm(&dir.join("0003.ppm"), 2, 2);
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();
        assert_eq!(next_capture_index(&dir), 4);
    }

    #[test]
    fn ppm_validation() {
        let (_guard, dir) = capture_dir();
        let good = dir.join("good.ppm");
        write_ppm(&good, 4, 3);
        validate_ppm(&good).unwrap();

        let garbage = dir.join("garbage.ppm");
        std::fs::write(&garbage, b"not an image").unwrap();
        assert!(validate_ppm(&garbage).is_err());

        let truncated = dir.join("truncated.ppm");
        std::fs::write(&truncated, b"P6\n100 100\n255\nshort").unwrap();
        assert!(validate_ppm(&truncated).is_err());
    }

    #[test]
    fn captures_are_numbered_and_stop_is_a_rendezvous() {
        let (_guard, dir) = capture_dir();
        let channel = MockChannel::new(Behavior::CaptureValid);
        let sampler = ScreendumpSampler::start(config(channel.clone(), &dir, None)).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        sampler.stop(StopReason::PowerOff);

        let requested = channel.requested();
        assert!(!requested.is_empty());
        assert_eq!(requested[0], dir.join("0001.ppm").as_str());
        assert!(dir.join("0001.ppm").is_file());

        // The stop already joined the worker: no further capture may be
        // issued afterwards.
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(channel.requested(), requested);
    }

    #[test]
    fn malformed_captures_do_not_advance_the_sequence() {
        let (_guard, dir) = capture_dir();
        let channel = MockChannel::new(Behavior::CaptureGarbage);
        let sampler = ScreendumpSampler::start(config(channel.clone(), &dir, None)).unwrap();
        std::thread::sleep(Duration::from_millis(45));
        sampler.stop(StopReason::PowerOff);

        let requested = channel.requested();
        assert!(requested.len() >= 2);
        assert!(requested.iter().all(|f| *f == requested[0]));
    }

    #[test]
    fn command_failures_are_not_fatal() {
        let (_guard, dir) = capture_dir();
        let channel = MockChannel::new(Behavior::FailCommand);
        let sampler = ScreendumpSampler::start(config(channel.clone(), &dir, None)).unwrap();
        std::thread::sleep(Duration::from_millis(45));
        sampler.stop(StopReason::PowerOff);
        assert!(channel.requested().len() >= 2);
    }

    #[test]
    fn transport_loss_ends_the_loop() {
        let (_guard, dir) = capture_dir();
        let channel = MockChannel::new(Behavior::DropTransport);
        let sampler = ScreendumpSampler::start(config(channel.clone(), &dir, None)).unwrap();
        std::thread::sleep(Duration::from_millis(45));
        // The worker exited on its own after the first command.
        assert_eq!(channel.requested().len(), 1);
        sampler.stop(StopReason::PowerOff);
    }

    #[test]
    fn power_off_stop_requests_video_encoding() {
        let (_guard, dir) = capture_dir();
        let channel = MockChannel::new(Behavior::CaptureValid);
        let encoder = Arc::new(MockEncoder::default());
        let sampler = ScreendumpSampler::start(config(
            channel,
            &dir,
            Some(encoder.clone() as Arc<dyn VideoEncoder>),
        ))
        .unwrap();
        std::thread::sleep(Duration::from_millis(25));
        sampler.stop(StopReason::PowerOff);

        let invocations = encoder.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].0, dir);
        assert_eq!(invocations[0].2, 95);
    }

    #[test]
    fn migration_stop_skips_video_encoding() {
        let (_guard, dir) = capture_dir();
        let channel = MockChannel::new(Behavior::CaptureValid);
        let encoder = Arc::new(MockEncoder::default());
        let sampler = ScreendumpSampler::start(config(
            channel,
            &dir,
            Some(encoder.clone() as Arc<dyn VideoEncoder>),
        ))
        .unwrap();
        std::thread::sleep(Duration::from_millis(25));
        sampler.stop(StopReason::Migration);
        assert!(encoder.invocations.lock().unwrap().is_empty());
    }
}
