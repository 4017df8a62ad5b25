/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Minimal SMACK labeling support: enough to detect an active policy and
//! copy the calling process's label onto staged mounts. Anything richer
//! belongs to the platform's labeling tooling, not here.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const SMACK_MOUNT_PATH: &str = "/sys/fs/smackfs";
const SMACK_XATTR_ACCESS: &str = "security.SMACK64";

pub fn is_smack_active() -> bool {
    Path::new(SMACK_MOUNT_PATH).is_dir()
        && std::fs::read_to_string("/proc/filesystems")
            .map(|fs| fs.lines().any(|l| l.trim_end().ends_with("smackfs")))
            .unwrap_or(false)
}

/// The current process's own label, from procfs.
pub fn self_label() -> io::Result<String> {
    let label = std::fs::read_to_string("/proc/self/attr/current")?;
    Ok(label.trim_end_matches(['\0', '\n']).to_string())
}

/// Set the access label of a file. Follows symlinks, like the staging
/// code expects.
pub fn set_access_label(path: &Path, label: &str) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let c_name = CString::new(SMACK_XATTR_ACCESS).expect("static name has no NUL");
    // Safety: both strings are NUL-terminated and outlive the call.
    let rc = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            label.as_ptr().cast(),
            label.len(),
            0,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smack_detection_does_not_panic_without_smack() {
        // On hosts without SMACK this must simply report false.
        let _ = is_smack_active();
    }
}
