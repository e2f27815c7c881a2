// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The godwit framework: interfaces for launching, commanding, observing,
//! and migrating emulator-backed test VMs.
//!
//! A [`Harness`] owns the state shared by every VM in a run, most
//! importantly the one [`PortAllocator`] all port-bearing devices draw
//! from; migration deliberately allocates two VMs' ports from that common
//! space so they can never collide.

pub mod cmdline;
pub mod devices;
pub mod log_config;
pub mod monitor;
pub mod params;
pub mod path;
pub mod port_allocator;
pub mod vm;

pub use log_config::OutputMode;
pub use params::Params;
pub use port_allocator::PortAllocator;
pub use vm::{Vm, VideoEncoder};

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

pub struct Harness {
    params: Params,
    logdir: Utf8PathBuf,
    output_mode: OutputMode,
    ports: Arc<PortAllocator>,
    video_encoder: Option<Arc<dyn VideoEncoder>>,
}

impl Harness {
    pub fn new(params: Params, logdir: &Utf8Path, output_mode: OutputMode) -> Result<Self> {
        std::fs::create_dir_all(logdir)
            .with_context(|| format!("creating log directory {logdir}"))?;
        info!(%logdir, "setting up harness");
        Ok(Self {
            params,
            logdir: logdir.to_path_buf(),
            output_mode,
            ports: Arc::new(PortAllocator::new()),
            video_encoder: None,
        })
    }

    /// The port space shared by every VM this harness creates.
    pub fn port_allocator(&self) -> Arc<PortAllocator> {
        Arc::clone(&self.ports)
    }

    pub fn set_video_encoder(&mut self, encoder: Arc<dyn VideoEncoder>) {
        self.video_encoder = Some(encoder);
    }

    /// A powered-off VM holding only the resolved binary device; callers
    /// shape the rest of the model themselves.
    pub fn deviceless_vm(&self) -> Result<Vm> {
        let mut vm = Vm::new(
            self.params.clone(),
            &self.logdir,
            self.output_mode,
            Arc::clone(&self.ports),
        )?;
        if let Some(encoder) = &self.video_encoder {
            vm.set_video_encoder(Arc::clone(encoder));
        }
        Ok(vm)
    }

    /// The standard fixture machine: no default devices, a std VGA card
    /// with a VNC server to sample from, the guest-image drive, and a
    /// user-mode NIC with an SSH host-forward.
    pub fn new_vm(&self) -> Result<Vm> {
        let mut vm = self.deviceless_vm()?;
        let devices = vm.devices_mut();
        devices.add_nodefaults();
        devices.add_vga("std");
        devices.add_vnc(None)?;
        devices.add_drive(None)?;
        devices.add_net()?;
        Ok(vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (tempfile::TempDir, Harness) {
        let dir = tempfile::tempdir().unwrap();
        let logdir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let binary = logdir.join("qemu-kvm");
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        let params = Params {
            qemu_bin: Some(binary),
            guest_image_path: Some(logdir.join("guest.qcow2")),
            ..Params::default()
        };
        let harness = Harness::new(params, &logdir, OutputMode::Null).unwrap();
        (dir, harness)
    }

    #[test]
    fn new_vm_carries_the_standard_device_set() {
        let (_dir, harness) = harness();
        let vm = harness.new_vm().unwrap();
        let rendered = vm.devices().render();
        assert!(rendered.contains("-nodefaults"));
        assert!(rendered.contains("-vga std"));
        assert!(rendered.contains("-vnc :"));
        assert!(rendered.contains("guest.qcow2"));
        assert!(rendered.contains("hostfwd=tcp::"));
    }

    #[test]
    fn vms_share_one_port_space() {
        let (_dir, harness) = harness();
        let a = harness.new_vm().unwrap();
        let b = harness.new_vm().unwrap();
        assert_ne!(a.devices().vnc_port(), b.devices().vnc_port());
        assert_ne!(a.devices().redir_port(), b.devices().redir_port());
    }
}
