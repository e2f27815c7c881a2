// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line composition.
//!
//! Without a template the device model's `render()` output is launched
//! verbatim. A template is a format string over `{key}` placeholders:
//!
//! - `{cmdline}`: the full rendered device list;
//! - `{devices}`: the rendered list without the binary-path device;
//! - one key per device kind (`{vnc}`, `{drive}`, ...), bound to the
//!   rendered fragments of every device of that kind.
//!
//! A placeholder that names no resolvable key is stripped rather than
//! rejected, so templates may mention optional devices without the caller
//! guaranteeing their presence. The valid key set is computed up front and
//! unresolved placeholders removed in the same pass; there is no
//! format-and-retry loop.

use std::collections::HashMap;

use crate::devices::{DeviceError, DeviceModel};

pub struct CommandTemplate<'a> {
    text: &'a str,
}

impl<'a> CommandTemplate<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text }
    }

    /// Substitutes the model into the template. Fails only on a malformed
    /// template (an unterminated `{`), which is a configuration error.
    pub fn render(&self, model: &DeviceModel) -> Result<String, DeviceError> {
        let keys = substitution_keys(model);
        let mut out = String::with_capacity(self.text.len());
        let mut rest = self.text.char_indices();
        while let Some((at, c)) = rest.next() {
            if c != '{' {
                out.push(c);
                continue;
            }
            let mut key = String::new();
            loop {
                match rest.next() {
                    Some((_, '}')) => break,
                    Some((_, c)) => key.push(c),
                    None => return Err(DeviceError::MalformedTemplate(at)),
                }
            }
            if let Some(value) = keys.get(key.as_str()) {
                out.push_str(value);
            }
            // An unknown key is an optional device that isn't present;
            // its placeholder simply disappears.
        }
        Ok(out)
    }
}

fn substitution_keys(model: &DeviceModel) -> HashMap<&'static str, String> {
    let mut keys = HashMap::new();
    keys.insert("cmdline", model.render());
    keys.insert("devices", model.render_without_binary());
    for device in model.devices() {
        let fragment = device.render();
        keys.entry(device.kind().name())
            .and_modify(|joined: &mut String| {
                joined.push(' ');
                joined.push_str(&fragment);
            })
            .or_insert(fragment);
    }
    keys
}

/// Composes the launch command line for `model`, through `template` when
/// one is configured.
pub fn compose(model: &DeviceModel, template: Option<&str>) -> Result<String, DeviceError> {
    match template {
        Some(text) => CommandTemplate::new(text).render(model),
        None => Ok(model.render()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;
    use crate::port_allocator::PortAllocator;
    use camino::Utf8PathBuf;
    use std::sync::Arc;

    fn model() -> DeviceModel {
        DeviceModel::new(
            Utf8PathBuf::from("/usr/bin/qemu-kvm"),
            Params::default(),
            Arc::new(PortAllocator::new()),
        )
    }

    #[test]
    fn no_template_is_verbatim_render() {
        let mut model = model();
        model.add_nodefaults();
        assert_eq!(compose(&model, None).unwrap(), model.render());
    }

    #[test]
    fn known_keys_are_substituted() {
        let mut model = model();
        model.add_nodefaults();
        model.add_vga("std");
        assert_eq!(
            compose(&model, Some("{binary} -enable-kvm {devices}")).unwrap(),
            "/usr/bin/qemu-kvm -enable-kvm -nodefaults -vga std"
        );
    }

    #[test]
    fn per_device_keys_bind_that_devices_fragment() {
        let mut model = model();
        let port = model.add_vnc(None).unwrap();
        assert_eq!(
            compose(&model, Some("{vnc}")).unwrap(),
            format!("-vnc :{port}")
        );
    }

    #[test]
    fn repeated_kinds_join_their_fragments() {
        let mut model = model();
        model.add_display("none");
        model.add_display("gtk");
        assert_eq!(
            compose(&model, Some("{display}")).unwrap(),
            "-display none -display gtk"
        );
    }

    #[test]
    fn unknown_keys_are_stripped_not_fatal() {
        let model = model();
        assert_eq!(
            compose(&model, Some("{binary} {vnc} -snapshot")).unwrap(),
            "/usr/bin/qemu-kvm  -snapshot"
        );
    }

    #[test]
    fn unterminated_placeholder_is_malformed() {
        let model = model();
        assert!(matches!(
            compose(&model, Some("{binary} {oops")),
            Err(DeviceError::MalformedTemplate(_))
        ));
    }
}
