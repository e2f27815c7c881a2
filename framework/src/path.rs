// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emulator binary discovery.
//!
//! Resolution order: an explicit parameter, then an environment variable,
//! then a `$PATH` search over the candidate names QEMU installs under.
//! Failures here are configuration errors and surface before any process is
//! spawned.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::params::Params;

const QEMU_CANDIDATE_NAMES: &[&str] = &["qemu-kvm", "qemu-system-x86_64", "qemu"];

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path {path} (provided through {origin}) does not exist")]
    MissingBinary { path: Utf8PathBuf, origin: &'static str },

    #[error("binary path {0:?} is not valid UTF-8")]
    NonUtf8Path(std::path::PathBuf),

    #[error("could not find a suitable {0} binary in params, the environment, or $PATH")]
    NoCandidateFound(&'static str),
}

fn validate(path: &Utf8Path, origin: &'static str) -> Result<Utf8PathBuf, PathError> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(PathError::MissingBinary { path: path.to_path_buf(), origin })
    }
}

fn search_candidates(what: &'static str) -> Result<Utf8PathBuf, PathError> {
    for candidate in QEMU_CANDIDATE_NAMES {
        if let Ok(found) = which::which(candidate) {
            return Utf8PathBuf::from_path_buf(found).map_err(PathError::NonUtf8Path);
        }
    }
    Err(PathError::NoCandidateFound(what))
}

/// Finds the emulator binary to launch.
pub fn qemu_binary(params: &Params) -> Result<Utf8PathBuf, PathError> {
    if let Some(explicit) = &params.qemu_bin {
        return validate(explicit, "the qemu_bin parameter");
    }
    if let Ok(env) = std::env::var("QEMU") {
        return validate(Utf8Path::new(&env), "the $QEMU environment variable");
    }
    search_candidates("qemu")
}

/// Finds the alternate binary a migration destination should run. Used to
/// exercise state transfer into a different emulator build.
pub fn qemu_dst_binary(params: &Params) -> Result<Utf8PathBuf, PathError> {
    if let Some(explicit) = &params.qemu_dst_bin {
        return validate(explicit, "the qemu_dst_bin parameter");
    }
    if let Ok(env) = std::env::var("QEMU_DST") {
        return validate(Utf8Path::new(&env), "the $QEMU_DST environment variable");
    }
    search_candidates("destination qemu")
}
