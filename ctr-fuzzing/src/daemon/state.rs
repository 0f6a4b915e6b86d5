// ctr-fuzzing/src/daemon/state.rs
//! Removal of daemon-owned directories, including ones with live mounts

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};

use crate::error::DaemonError;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Recursively remove `path`, detaching mounts beneath it if a plain removal fails
///
/// A path that does not exist counts as removed.
pub fn force_remove_all(path: &Path) -> Result<(), DaemonError> {
    match fs::remove_dir_all(path) {
        Ok(()) => return Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => log::warn!("removing {} failed, detaching mounts: {err}", path.display()),
    }

    let mounts = fs::read_to_string(MOUNTINFO)
        .map(|text| mount_points_under(&text, path))
        .unwrap_or_default();
    for mount in &mounts {
        if let Err(err) = umount2(mount, MntFlags::MNT_DETACH) {
            log::warn!("failed to detach {}: {err}", mount.display());
        }
    }

    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DaemonError::Purge {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Mount points at or below `root`, deepest first
fn mount_points_under(mountinfo: &str, root: &Path) -> Vec<PathBuf> {
    let mut mounts: Vec<PathBuf> = mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .filter(|mount| mount.starts_with(root))
        .collect();
    mounts.sort_by_key(|mount| std::cmp::Reverse(mount.components().count()));
    mounts
}

/// Undo the kernel's `\ooo` octal escaping of whitespace and backslashes
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
