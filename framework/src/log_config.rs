// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Where the emulator child process's stdout/stderr should be directed.

use std::process::Stdio;
use std::str::FromStr;

use anyhow::Context;
use camino::Utf8Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Write to `<prefix>.stdout.log` / `<prefix>.stderr.log` in the VM's
    /// log directory.
    File,

    /// Inherit the harness's own stdout/stderr.
    Stdio,

    /// Discard.
    Null,
}

impl FromStr for OutputMode {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(OutputMode::File),
            "stdio" => Ok(OutputMode::Stdio),
            "null" => Ok(OutputMode::Null),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                s.to_string(),
            )),
        }
    }
}

impl OutputMode {
    /// Returns the stdout/stderr handles to pass to a child process under
    /// this discipline.
    pub(crate) fn stdio_handles(
        &self,
        directory: &Utf8Path,
        file_prefix: &str,
    ) -> anyhow::Result<(Stdio, Stdio)> {
        match self {
            OutputMode::File => {
                let stdout_path = directory.join(format!("{file_prefix}.stdout.log"));
                let stderr_path = directory.join(format!("{file_prefix}.stderr.log"));
                info!(%stdout_path, %stderr_path, "opening emulator log files");
                let stdout = create_file(&stdout_path)?.into();
                let stderr = create_file(&stderr_path)?.into();
                Ok((stdout, stderr))
            }
            OutputMode::Stdio => Ok((Stdio::inherit(), Stdio::inherit())),
            OutputMode::Null => Ok((Stdio::null(), Stdio::null())),
        }
    }
}

fn create_file(path: &Utf8Path) -> anyhow::Result<std::fs::File> {
    std::fs::File::create(path).with_context(|| format!("failed to create file {path}"))
}
