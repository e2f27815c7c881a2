// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervision of the emulator child process.

use std::process::{Child, Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// A launched emulator process.
///
/// The command line is split on whitespace, which matches the fragments the
/// device model produces; paths containing spaces are not supported, as in
/// the emulator's own option grammar.
pub struct EmulatorProcess {
    child: Child,
}

impl EmulatorProcess {
    pub(crate) fn spawn(cmdline: &str, stdout: Stdio, stderr: Stdio) -> Result<Self> {
        let mut words = cmdline.split_whitespace();
        let program = words.next().context("refusing to launch an empty command line")?;
        info!(%cmdline, "launching emulator");
        let child = Command::new(program)
            .args(words)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .with_context(|| format!("spawning emulator process {program}"))?;
        info!(pid = child.id(), "launched emulator");
        Ok(Self { child })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Blocks until the process exits.
    pub(crate) fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().context("waiting for emulator to exit")
    }

    /// Forcibly terminates the process and reaps it.
    pub(crate) fn kill(&mut self) -> Result<()> {
        // kill on an already-exited child reports InvalidInput; that is the
        // outcome we wanted.
        match self.child.kill() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e).context("killing emulator"),
        }
        self.child.wait().context("reaping killed emulator")?;
        Ok(())
    }
}

impl Drop for EmulatorProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            let pid = self.pid();
            warn!(pid, "killing emulator that was dropped while running");
            if let Err(e) = self.kill() {
                warn!(pid, error = ?e, "failed to kill dropped emulator");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_kill_reap() {
        let mut process =
            EmulatorProcess::spawn("sleep 30", Stdio::null(), Stdio::null()).unwrap();
        assert!(process.is_alive());
        process.kill().unwrap();
        assert!(!process.is_alive());
    }

    #[test]
    fn wait_observes_natural_exit() {
        let mut process =
            EmulatorProcess::spawn("true", Stdio::null(), Stdio::null()).unwrap();
        assert!(process.wait().unwrap().success());
    }

    #[test]
    fn empty_command_line_is_rejected() {
        assert!(EmulatorProcess::spawn("  ", Stdio::null(), Stdio::null()).is_err());
    }
}
