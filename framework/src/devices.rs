// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The declarative device model an emulator command line is composed from.
//!
//! Every device renders to a self-contained fragment of the command line;
//! the model preserves insertion order because some fragments (the binary
//! path above all) are positional by convention. Fragment syntax follows
//! the emulator's flag grammar exactly: flag names and comma-separated
//! `key=value` option lists are the wire contract with the unmodified
//! external binary.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::params::Params;
use crate::port_allocator::{PortAllocator, PortAllocatorError};

/// VNC display ports are scanned upward from here.
pub const VNC_PORT_BASE: u16 = 5900;

/// Guest SSH host-forward ports are scanned upward from here.
pub const REDIR_PORT_BASE: u16 = 5000;

/// Inbound migration listeners are scanned upward from here.
pub const MIGRATION_PORT_BASE: u16 = 4444;

const MONITOR_CHARDEV_ID: &str = "mon";
const SERIAL_CHARDEV_ID: &str = "godwit_serial";
const DRIVE_DEVICE_ID: &str = "godwit_image";
const DRIVE_ID: &str = "device_godwit_image";
const NIC_DEVICE_ID: &str = "godwit_nic";
const NIC_ID: &str = "device_godwit_nic";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown device kind {0:?}")]
    UnknownDeviceKind(String),

    #[error("no {0} device in the model")]
    NotFound(DeviceKind),

    #[error("a {0} device cannot be built from defaults")]
    NeedsAttributes(DeviceKind),

    #[error("device identifier {0:?} is already used by this model")]
    DuplicateId(String),

    #[error("the binary-path device cannot be removed")]
    BinaryRequired,

    #[error("no drive file given and no guest image path configured")]
    NoGuestImage,

    #[error("unterminated substitution key at byte {0} of the command template")]
    MalformedTemplate(usize),

    #[error(transparent)]
    Ports(#[from] PortAllocatorError),
}

/// The closed set of device kinds the model understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Binary,
    NoDefaults,
    Display,
    Vga,
    Vnc,
    Monitor,
    Serial,
    Drive,
    Net,
    Fd,
    Incoming,
    Raw,
}

impl DeviceKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Binary => "binary",
            DeviceKind::NoDefaults => "nodefaults",
            DeviceKind::Display => "display",
            DeviceKind::Vga => "vga",
            DeviceKind::Vnc => "vnc",
            DeviceKind::Monitor => "monitor",
            DeviceKind::Serial => "serial",
            DeviceKind::Drive => "drive",
            DeviceKind::Net => "net",
            DeviceKind::Fd => "fd",
            DeviceKind::Incoming => "incoming",
            DeviceKind::Raw => "raw",
        }
    }

    /// Session-bound devices hold a resource (socket path, descriptor,
    /// listener port) that must be unique per running instance, so cloning
    /// a model for a new instance drops them.
    pub fn session_bound(&self) -> bool {
        matches!(
            self,
            DeviceKind::Monitor | DeviceKind::Serial | DeviceKind::Fd | DeviceKind::Incoming
        )
    }

    const ALL: &'static [DeviceKind] = &[
        DeviceKind::Binary,
        DeviceKind::NoDefaults,
        DeviceKind::Display,
        DeviceKind::Vga,
        DeviceKind::Vnc,
        DeviceKind::Monitor,
        DeviceKind::Serial,
        DeviceKind::Drive,
        DeviceKind::Net,
        DeviceKind::Fd,
        DeviceKind::Incoming,
        DeviceKind::Raw,
    ];
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceKind {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceKind::ALL
            .iter()
            .find(|k| k.name() == s)
            .copied()
            .ok_or_else(|| DeviceError::UnknownDeviceKind(s.to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum Device {
    Binary {
        path: Utf8PathBuf,
    },
    NoDefaults,
    Display {
        value: String,
    },
    Vga {
        value: String,
    },
    Vnc {
        port: u16,
    },
    Monitor {
        socket: Utf8PathBuf,
    },
    Serial {
        socket: Utf8PathBuf,
        chardev_id: String,
    },
    Drive {
        file: Utf8PathBuf,
        device_type: String,
        device_id: String,
        drive_id: String,
    },
    Net {
        netdev_type: String,
        device_type: String,
        device_id: String,
        nic_id: String,
        redir_port: u16,
    },
    Fd {
        fd: i32,
        set: u32,
        opaque: String,
        opts: Option<String>,
    },
    Incoming {
        protocol: String,
        port: u16,
    },
    Raw {
        args: String,
    },
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Binary { .. } => DeviceKind::Binary,
            Device::NoDefaults => DeviceKind::NoDefaults,
            Device::Display { .. } => DeviceKind::Display,
            Device::Vga { .. } => DeviceKind::Vga,
            Device::Vnc { .. } => DeviceKind::Vnc,
            Device::Monitor { .. } => DeviceKind::Monitor,
            Device::Serial { .. } => DeviceKind::Serial,
            Device::Drive { .. } => DeviceKind::Drive,
            Device::Net { .. } => DeviceKind::Net,
            Device::Fd { .. } => DeviceKind::Fd,
            Device::Incoming { .. } => DeviceKind::Incoming,
            Device::Raw { .. } => DeviceKind::Raw,
        }
    }

    /// The allocated TCP port this device occupies, if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            Device::Vnc { port } => Some(*port),
            Device::Net { redir_port, .. } => Some(*redir_port),
            Device::Incoming { port, .. } => Some(*port),
            _ => None,
        }
    }

    /// Renders this device's command-line fragment.
    pub fn render(&self) -> String {
        match self {
            Device::Binary { path } => path.to_string(),
            Device::NoDefaults => "-nodefaults".to_string(),
            Device::Display { value } => format!("-display {value}"),
            Device::Vga { value } => format!("-vga {value}"),
            Device::Vnc { port } => format!("-vnc :{port}"),
            Device::Monitor { socket } => format!(
                "-chardev socket,id={MONITOR_CHARDEV_ID},path={socket} \
                 -mon chardev={MONITOR_CHARDEV_ID},mode=control"
            ),
            Device::Serial { socket, chardev_id } => format!(
                "-chardev socket,id={chardev_id},path={socket},server,nowait \
                 -device isa-serial,chardev={chardev_id}"
            ),
            Device::Drive { file, device_type, device_id, drive_id } => format!(
                "-drive id={drive_id},if=none,file={file} \
                 -device {device_type},id={device_id},drive={drive_id}"
            ),
            Device::Net { netdev_type, device_type, device_id, nic_id, redir_port } => format!(
                "-device {device_type},id={device_id},netdev={nic_id} \
                 -netdev {netdev_type},id={nic_id},hostfwd=tcp::{redir_port}-:22"
            ),
            Device::Fd { fd, set, opaque, opts } => {
                let mut options = format!("fd={fd},set={set},opaque={opaque}");
                if let Some(opts) = opts {
                    options.push(',');
                    options.push_str(opts);
                }
                format!("-add-fd {options}")
            }
            Device::Incoming { protocol, port } => format!("-incoming {protocol}:0:{port}"),
            Device::Raw { args } => args.clone(),
        }
    }
}

/// An ordered list of devices, always led by exactly one binary-path
/// device.
///
/// The model allocates ports through the harness-wide [`PortAllocator`] and
/// releases every port it allocated when dropped (or when the owning device
/// is removed), so discarded models never pin ports.
pub struct DeviceModel {
    devices: Vec<Device>,
    params: Params,
    ports: Arc<PortAllocator>,
    allocated: Vec<u16>,
}

impl DeviceModel {
    pub fn new(binary: Utf8PathBuf, params: Params, ports: Arc<PortAllocator>) -> Self {
        Self {
            devices: vec![Device::Binary { path: binary }],
            params,
            ports,
            allocated: Vec::new(),
        }
    }

    fn allocate(&mut self, start: u16) -> Result<u16, PortAllocatorError> {
        let port = self.ports.find_free_port(start)?;
        self.allocated.push(port);
        Ok(port)
    }

    fn claim(&mut self, port: u16) -> Result<(), PortAllocatorError> {
        self.ports.register_port(port)?;
        self.allocated.push(port);
        Ok(())
    }

    fn check_ids<'a>(&self, new_ids: impl IntoIterator<Item = &'a str>) -> Result<(), DeviceError> {
        let mut existing = Vec::new();
        for device in &self.devices {
            match device {
                Device::Drive { device_id, drive_id, .. } => {
                    existing.push(device_id.as_str());
                    existing.push(drive_id.as_str());
                }
                Device::Net { device_id, nic_id, .. } => {
                    existing.push(device_id.as_str());
                    existing.push(nic_id.as_str());
                }
                _ => {}
            }
        }
        for id in new_ids {
            if existing.contains(&id) {
                return Err(DeviceError::DuplicateId(id.to_string()));
            }
        }
        Ok(())
    }

    /// Builds the variant named `kind` from its default attributes and
    /// appends it. Kinds whose attributes are inherently per-session
    /// (sockets, descriptors, listeners) cannot be defaulted.
    pub fn add_by_name(&mut self, kind: &str) -> Result<(), DeviceError> {
        match kind.parse::<DeviceKind>()? {
            DeviceKind::NoDefaults => self.add_nodefaults(),
            DeviceKind::Display => self.add_display("none"),
            DeviceKind::Vga => self.add_vga("none"),
            DeviceKind::Vnc => {
                self.add_vnc(None)?;
            }
            DeviceKind::Drive => self.add_drive(None)?,
            DeviceKind::Net => {
                self.add_net()?;
            }
            other => return Err(DeviceError::NeedsAttributes(other)),
        }
        Ok(())
    }

    pub fn add_nodefaults(&mut self) {
        self.devices.push(Device::NoDefaults);
    }

    pub fn add_display(&mut self, value: &str) {
        self.devices.push(Device::Display { value: value.to_string() });
    }

    pub fn add_vga(&mut self, value: &str) {
        self.devices.push(Device::Vga { value: value.to_string() });
    }

    /// Adds a VNC server. With no explicit port, one is allocated starting
    /// at [`VNC_PORT_BASE`]; an explicit port is registered with the
    /// allocator so no other model can claim it.
    pub fn add_vnc(&mut self, port: Option<u16>) -> Result<u16, DeviceError> {
        let port = match port {
            Some(port) => {
                self.claim(port)?;
                port
            }
            None => self.allocate(VNC_PORT_BASE)?,
        };
        self.devices.push(Device::Vnc { port });
        Ok(port)
    }

    pub(crate) fn add_monitor(&mut self, socket: &Utf8Path) {
        self.devices.push(Device::Monitor { socket: socket.to_path_buf() });
    }

    pub(crate) fn add_serial(&mut self, socket: &Utf8Path) {
        self.devices.push(Device::Serial {
            socket: socket.to_path_buf(),
            chardev_id: SERIAL_CHARDEV_ID.to_string(),
        });
    }

    /// Adds the guest drive. With no explicit file the configured guest
    /// image backs it.
    pub fn add_drive(&mut self, file: Option<&Utf8Path>) -> Result<(), DeviceError> {
        self.add_drive_with(file, "virtio-blk-pci", DRIVE_DEVICE_ID, DRIVE_ID)
    }

    pub fn add_drive_with(
        &mut self,
        file: Option<&Utf8Path>,
        device_type: &str,
        device_id: &str,
        drive_id: &str,
    ) -> Result<(), DeviceError> {
        let file = match file {
            Some(file) => file.to_path_buf(),
            None => self.params.guest_image_path.clone().ok_or(DeviceError::NoGuestImage)?,
        };
        self.check_ids([device_id, drive_id])?;
        self.devices.push(Device::Drive {
            file,
            device_type: device_type.to_string(),
            device_id: device_id.to_string(),
            drive_id: drive_id.to_string(),
        });
        Ok(())
    }

    /// Adds a user-mode NIC with an SSH host-forward on a freshly allocated
    /// port, which is returned.
    pub fn add_net(&mut self) -> Result<u16, DeviceError> {
        self.add_net_with("user", "virtio-net-pci", NIC_DEVICE_ID, NIC_ID)
    }

    pub fn add_net_with(
        &mut self,
        netdev_type: &str,
        device_type: &str,
        device_id: &str,
        nic_id: &str,
    ) -> Result<u16, DeviceError> {
        self.check_ids([device_id, nic_id])?;
        let redir_port = self.allocate(REDIR_PORT_BASE)?;
        self.devices.push(Device::Net {
            netdev_type: netdev_type.to_string(),
            device_type: device_type.to_string(),
            device_id: device_id.to_string(),
            nic_id: nic_id.to_string(),
            redir_port,
        });
        Ok(redir_port)
    }

    pub fn add_fd(&mut self, fd: i32, set: u32, opaque: &str, opts: Option<&str>) {
        self.devices.push(Device::Fd {
            fd,
            set,
            opaque: opaque.to_string(),
            opts: opts.map(str::to_string),
        });
    }

    /// Adds an inbound migration listener on a freshly allocated port,
    /// which is returned.
    pub fn add_incoming(&mut self, protocol: &str) -> Result<u16, DeviceError> {
        let port = self.allocate(MIGRATION_PORT_BASE)?;
        self.devices.push(Device::Incoming { protocol: protocol.to_string(), port });
        Ok(port)
    }

    /// Appends a literal command-line fragment.
    pub fn add_raw(&mut self, args: &str) {
        self.devices.push(Device::Raw { args: args.to_string() });
    }

    pub fn has(&self, kind: DeviceKind) -> bool {
        self.devices.iter().any(|d| d.kind() == kind)
    }

    /// Removes the first device of `kind`, releasing any port it held.
    pub fn remove(&mut self, kind: DeviceKind) -> Result<(), DeviceError> {
        if kind == DeviceKind::Binary {
            return Err(DeviceError::BinaryRequired);
        }
        let index = self
            .devices
            .iter()
            .position(|d| d.kind() == kind)
            .ok_or(DeviceError::NotFound(kind))?;
        let device = self.devices.remove(index);
        if let Some(port) = device.port() {
            if let Some(i) = self.allocated.iter().position(|p| *p == port) {
                self.allocated.swap_remove(i);
                self.ports.release_port(port);
            }
        }
        Ok(())
    }

    /// The port of the first SSH host-forward, if a net device is present.
    pub fn redir_port(&self) -> Option<u16> {
        self.devices.iter().find_map(|d| match d {
            Device::Net { redir_port, .. } => Some(*redir_port),
            _ => None,
        })
    }

    /// The port of the first VNC server, if one is present.
    pub fn vnc_port(&self) -> Option<u16> {
        self.devices.iter().find_map(|d| match d {
            Device::Vnc { port } => Some(*port),
            _ => None,
        })
    }

    pub(crate) fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Concatenates every device's fragment, order preserved.
    pub fn render(&self) -> String {
        self.devices.iter().map(Device::render).collect::<Vec<_>>().join(" ")
    }

    /// Like [`Self::render`] but without the leading binary device.
    pub(crate) fn render_without_binary(&self) -> String {
        self.devices
            .iter()
            .filter(|d| d.kind() != DeviceKind::Binary)
            .map(Device::render)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Produces a model for a fresh instance of this machine: session-bound
    /// devices are dropped (a new instance needs its own sockets and
    /// descriptors) and port-bearing devices are re-resolved against the
    /// shared allocator so the two instances can run side by side. The
    /// binary-path device may be swapped, which migration uses to hand a
    /// guest over to a different emulator build.
    pub fn clone_for_successor(
        &self,
        binary: Option<&Utf8Path>,
    ) -> Result<DeviceModel, DeviceError> {
        let mut clone = DeviceModel {
            devices: Vec::new(),
            params: self.params.clone(),
            ports: Arc::clone(&self.ports),
            allocated: Vec::new(),
        };
        for device in &self.devices {
            let device = match device {
                Device::Binary { path } => Device::Binary {
                    path: binary.map(Utf8Path::to_path_buf).unwrap_or_else(|| path.clone()),
                },
                d if d.kind().session_bound() => continue,
                Device::Vnc { .. } => Device::Vnc { port: clone.allocate(VNC_PORT_BASE)? },
                Device::Net { netdev_type, device_type, device_id, nic_id, .. } => Device::Net {
                    netdev_type: netdev_type.clone(),
                    device_type: device_type.clone(),
                    device_id: device_id.clone(),
                    nic_id: nic_id.clone(),
                    redir_port: clone.allocate(REDIR_PORT_BASE)?,
                },
                other => other.clone(),
            };
            clone.devices.push(device);
        }
        Ok(clone)
    }
}

impl Drop for DeviceModel {
    fn drop(&mut self) {
        for port in self.allocated.drain(..) {
            self.ports.release_port(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> DeviceModel {
        let params = Params {
            guest_image_path: Some(Utf8PathBuf::from("/images/guest.qcow2")),
            ..Params::default()
        };
        DeviceModel::new(Utf8PathBuf::from("/usr/bin/qemu-kvm"), params, Arc::new(PortAllocator::new()))
    }

    #[test]
    fn render_leads_with_the_binary() {
        let mut model = model();
        model.add_nodefaults();
        model.add_vga("std");
        assert_eq!(model.render(), "/usr/bin/qemu-kvm -nodefaults -vga std");
    }

    #[test]
    fn fragments_preserve_the_emulator_flag_grammar() {
        let mut model = model();
        model.add_drive(None).unwrap();
        let port = model.add_net().unwrap();
        model.add_fd(7, 1, "stash", None);
        assert_eq!(
            model.render(),
            format!(
                "/usr/bin/qemu-kvm \
                 -drive id=device_godwit_image,if=none,file=/images/guest.qcow2 \
                 -device virtio-blk-pci,id=godwit_image,drive=device_godwit_image \
                 -device virtio-net-pci,id=godwit_nic,netdev=device_godwit_nic \
                 -netdev user,id=device_godwit_nic,hostfwd=tcp::{port}-:22 \
                 -add-fd fd=7,set=1,opaque=stash"
            )
        );
    }

    #[test]
    fn add_then_remove_restores_the_render() {
        let mut model = model();
        model.add_nodefaults();
        let before = model.render();
        model.add_vnc(None).unwrap();
        model.remove(DeviceKind::Vnc).unwrap();
        assert_eq!(model.render(), before);
    }

    #[test]
    fn remove_releases_the_devices_port() {
        let ports = Arc::new(PortAllocator::new());
        let mut model = DeviceModel::new(
            Utf8PathBuf::from("/usr/bin/qemu-kvm"),
            Params::default(),
            Arc::clone(&ports),
        );
        let port = model.add_vnc(None).unwrap();
        model.remove(DeviceKind::Vnc).unwrap();
        // Released, so a fresh scan can claim the same port again.
        assert_eq!(ports.find_free_port(port).unwrap(), port);
    }

    #[test]
    fn remove_takes_the_first_match_only() {
        let mut model = model();
        model.add_display("none");
        model.add_display("gtk");
        model.remove(DeviceKind::Display).unwrap();
        assert_eq!(model.render(), "/usr/bin/qemu-kvm -display gtk");
    }

    #[test]
    fn remove_of_absent_kind_fails() {
        let mut model = model();
        assert!(matches!(
            model.remove(DeviceKind::Vnc),
            Err(DeviceError::NotFound(DeviceKind::Vnc))
        ));
    }

    #[test]
    fn the_binary_cannot_be_removed() {
        let mut model = model();
        assert!(matches!(model.remove(DeviceKind::Binary), Err(DeviceError::BinaryRequired)));
    }

    #[test]
    fn add_by_name_rejects_unknown_kinds() {
        let mut model = model();
        assert!(matches!(
            model.add_by_name("frobnicator"),
            Err(DeviceError::UnknownDeviceKind(k)) if k == "frobnicator"
        ));
    }

    #[test]
    fn add_by_name_rejects_session_bound_kinds() {
        let mut model = model();
        assert!(matches!(
            model.add_by_name("monitor"),
            Err(DeviceError::NeedsAttributes(DeviceKind::Monitor))
        ));
    }

    #[test]
    fn add_by_name_builds_defaultable_kinds() {
        let mut model = model();
        model.add_by_name("nodefaults").unwrap();
        model.add_by_name("vnc").unwrap();
        assert!(model.has(DeviceKind::NoDefaults));
        assert!(model.vnc_port().is_some());
    }

    #[test]
    fn duplicate_identifiers_are_rejected() {
        let mut model = model();
        model.add_drive(None).unwrap();
        assert!(matches!(
            model.add_drive(None),
            Err(DeviceError::DuplicateId(_))
        ));
    }

    #[test]
    fn clone_excludes_session_bound_devices() {
        let mut model = model();
        model.add_monitor(Utf8Path::new("/tmp/mon.sock"));
        model.add_serial(Utf8Path::new("/tmp/serial.sock"));
        model.add_fd(3, 1, "stash", None);
        model.add_incoming("tcp").unwrap();
        model.add_vnc(None).unwrap();

        let clone = model.clone_for_successor(None).unwrap();
        assert!(!clone.has(DeviceKind::Monitor));
        assert!(!clone.has(DeviceKind::Serial));
        assert!(!clone.has(DeviceKind::Fd));
        assert!(!clone.has(DeviceKind::Incoming));
        assert!(clone.has(DeviceKind::Vnc));
    }

    #[test]
    fn clone_never_reuses_the_originals_ports() {
        let mut model = model();
        model.add_vnc(None).unwrap();
        model.add_net().unwrap();

        let clone = model.clone_for_successor(None).unwrap();
        assert_ne!(model.vnc_port(), clone.vnc_port());
        assert_ne!(model.redir_port(), clone.redir_port());
    }

    #[test]
    fn clone_can_swap_the_binary() {
        let model = model();
        let clone = model.clone_for_successor(Some(Utf8Path::new("/opt/qemu-next"))).unwrap();
        assert_eq!(clone.render(), "/opt/qemu-next");
    }

    #[test]
    fn dropping_a_model_releases_its_ports() {
        let ports = Arc::new(PortAllocator::new());
        let vnc = {
            let mut model = DeviceModel::new(
                Utf8PathBuf::from("/usr/bin/qemu-kvm"),
                Params::default(),
                Arc::clone(&ports),
            );
            model.add_vnc(None).unwrap()
        };
        assert_eq!(ports.find_free_port(vnc).unwrap(), vnc);
    }
}
