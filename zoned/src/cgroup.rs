/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! cgroup v1 plumbing: the freezer controller backs Lock/Unlock, the
//! devices controller backs grant/revoke. Zone groups live under
//! `<root>/<controller>/zoned/<id>/`.

use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use crate::Error;
use crate::Result;

pub const FROZEN: &str = "FROZEN";
pub const THAWED: &str = "THAWED";

#[derive(Debug, Clone)]
pub struct CgroupDriver {
    root: PathBuf,
}

impl CgroupDriver {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn group_path(&self, controller: &str, zone: &str, knob: &str) -> PathBuf {
        self.root.join(controller).join("zoned").join(zone).join(knob)
    }

    fn write_knob(&self, controller: &str, zone: &str, knob: &str, value: &str) -> Result<()> {
        let path = self.group_path(controller, zone, knob);
        debug!("writing '{value}' to {}", path.display());
        std::fs::write(&path, value)
            .map_err(|e| Error::internal(format!("cannot write {}: {e}", path.display())))
    }

    fn read_knob(&self, controller: &str, zone: &str, knob: &str) -> Result<String> {
        let path = self.group_path(controller, zone, knob);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::internal(format!("cannot read {}: {e}", path.display())))?;
        Ok(text.trim_end().to_string())
    }

    /// Create the zone's groups and park the guard pid in them so the
    /// init inherits the membership.
    pub fn assign(&self, zone: &str, pid: i32) -> Result<()> {
        for controller in ["freezer", "devices"] {
            let dir = self.root.join(controller).join("zoned").join(zone);
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::internal(format!("cannot create {}: {e}", dir.display())))?;
            self.write_knob(controller, zone, "tasks", &pid.to_string())?;
        }
        Ok(())
    }

    pub fn remove(&self, zone: &str) {
        for controller in ["freezer", "devices"] {
            let dir = self.root.join(controller).join("zoned").join(zone);
            let _ = std::fs::remove_dir(dir);
        }
    }

    pub fn freeze(&self, zone: &str) -> Result<()> {
        self.write_knob("freezer", zone, "freezer.state", FROZEN)
    }

    pub fn thaw(&self, zone: &str) -> Result<()> {
        self.write_knob("freezer", zone, "freezer.state", THAWED)
    }

    pub fn freezer_state(&self, zone: &str) -> Result<String> {
        self.read_knob("freezer", zone, "freezer.state")
    }

    pub fn set_device_access(
        &self,
        zone: &str,
        device_path: &Path,
        grant: bool,
        flags: u32,
    ) -> Result<()> {
        let entry = device_entry(device_path, grant, flags)?;
        let knob = if grant {
            "devices.allow"
        } else {
            "devices.deny"
        };
        self.write_knob("devices", zone, knob, &entry)
    }
}

/// Whether the path names a character or block device.
pub fn is_device(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.file_type().is_char_device() || meta.file_type().is_block_device(),
        Err(_) => false,
    }
}

/// Permission string for a device entry, derived from the open flags the
/// caller intends to use. Revocation always removes everything.
fn permissions(grant: bool, flags: u32) -> Option<&'static str> {
    if !grant {
        return Some("rwm");
    }
    match (flags as i32) & libc::O_ACCMODE {
        libc::O_RDWR => Some("rwm"),
        libc::O_RDONLY => Some("rm"),
        libc::O_WRONLY => Some("wm"),
        _ => None,
    }
}

/// One `devices.allow`/`devices.deny` line: `<c|b> <major>:<minor> <perms>`.
fn device_entry(device_path: &Path, grant: bool, flags: u32) -> Result<String> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(device_path)
        .map_err(|e| Error::internal(format!("cannot stat {}: {e}", device_path.display())))?;
    let kind = if meta.file_type().is_char_device() {
        'c'
    } else if meta.file_type().is_block_device() {
        'b'
    } else {
        return Err(Error::Forbidden(format!(
            "not a device: {}",
            device_path.display()
        )));
    };
    let perms = permissions(grant, flags)
        .ok_or_else(|| Error::Forbidden("invalid device access flags".to_string()))?;
    let rdev = meta.rdev();
    let major = nix::sys::stat::major(rdev);
    let minor = nix::sys::stat::minor(rdev);
    Ok(format!("{kind} {major}:{minor} {perms}"))
}
