// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The read-only parameter set the lifecycle manager consumes.
//!
//! Ownership of defaults resolution (CLI flags, configuration trees) lies
//! with the caller; the framework only ever reads these values.

use std::time::Duration;

use camino::Utf8PathBuf;

/// Credentials the external remote-login collaborator should use for the
/// guest. Carried here so a cloned VM keeps them; never interpreted by the
/// framework itself.
#[derive(Clone, Debug)]
pub struct GuestCredentials {
    pub user: String,
    pub password: String,
}

impl Default for GuestCredentials {
    fn default() -> Self {
        Self { user: "root".to_string(), password: "123456".to_string() }
    }
}

#[derive(Clone, Debug)]
pub struct Params {
    /// Path to the emulator binary. When unset, `$QEMU` and then a `$PATH`
    /// search over the well-known candidate names decide.
    pub qemu_bin: Option<Utf8PathBuf>,

    /// Binary for the destination instance of a migration. Falls back to
    /// `$QEMU_DST` and then the same search as `qemu_bin`.
    pub qemu_dst_bin: Option<Utf8PathBuf>,

    /// The guest image backing the default drive device.
    pub guest_image_path: Option<Utf8PathBuf>,

    pub guest: GuestCredentials,

    /// Whether to run the screendump sampler while the VM is powered on.
    pub take_screendumps: bool,

    /// Interval between screendump captures.
    pub screendump_interval: Duration,

    /// Deadline for a live migration to reach a terminal state.
    pub migrate_timeout: Duration,

    /// Optional command-line template; see `cmdline::CommandTemplate`.
    pub qemu_template: Option<String>,

    /// Whether sampler teardown should request video encoding of the
    /// captured screendumps. Implies nothing unless screendumps are taken.
    pub record_videos: bool,

    /// JPEG quality handed to the video-encoding collaborator.
    pub video_jpeg_quality: u8,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            qemu_bin: None,
            qemu_dst_bin: None,
            guest_image_path: None,
            guest: GuestCredentials::default(),
            take_screendumps: false,
            screendump_interval: Duration::from_millis(500),
            migrate_timeout: Duration::from_secs(60),
            qemu_template: None,
            record_videos: false,
            video_jpeg_quality: 95,
        }
    }
}
