/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mount primitives with typed errors.

use std::io::BufRead;
use std::path::Path;
use std::path::PathBuf;

use nix::mount::MntFlags;
use tracing::debug;

pub use nix::mount::MsFlags;

use crate::Error;
use crate::Result;

pub fn mount(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&'static str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    debug!(
        "mounting {:?} on {} type {:?} flags {:?} data {:?}",
        source,
        target.display(),
        fstype,
        flags,
        data
    );
    nix::mount::mount(source, target, fstype, flags, data).map_err(|errno| Error::Mount {
        source_path: source.map(Path::to_path_buf),
        target: target.to_path_buf(),
        fstype: fstype.unwrap_or("none"),
        errno,
    })
}

pub fn umount(target: &Path) -> Result<()> {
    debug!("unmounting {}", target.display());
    nix::mount::umount(target).map_err(|errno| Error::Umount(target.to_path_buf(), errno))
}

pub fn umount_detach(target: &Path) -> Result<()> {
    debug!("lazily unmounting {}", target.display());
    nix::mount::umount2(target, MntFlags::MNT_DETACH)
        .map_err(|errno| Error::Umount(target.to_path_buf(), errno))
}

pub fn mkdir(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new().mode(mode).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::CreateDir(path.to_path_buf(), e)),
    }
}

/// Whether `path` is a mount point, judged from /proc/self/mounts.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let file = std::fs::File::open("/proc/self/mounts").map_err(Error::MountTable)?;
    let reader = std::io::BufReader::new(file);
    for line in reader.lines() {
        let line = line.map_err(Error::MountTable)?;
        if let Some(target) = line.split_whitespace().nth(1) {
            if Path::new(target) == path {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Unmount every mount at or below `root`, deepest first.
pub fn umount_subtree(root: &Path) -> Result<()> {
    let file = std::fs::File::open("/proc/self/mounts").map_err(Error::MountTable)?;
    let reader = std::io::BufReader::new(file);
    let mut targets: Vec<PathBuf> = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(Error::MountTable)?;
        if let Some(target) = line.split_whitespace().nth(1) {
            let target = PathBuf::from(target);
            if target.starts_with(root) {
                targets.push(target);
            }
        }
    }
    targets.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for target in targets {
        umount_detach(&target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_a_mount_point() {
        assert!(is_mount_point(Path::new("/")).unwrap());
    }

    #[test]
    fn fresh_tempdir_is_not_a_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mount_point(dir.path()).unwrap());
    }

    #[test]
    fn mkdir_tolerates_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d");
        mkdir(&path, 0o755).unwrap();
        mkdir(&path, 0o755).unwrap();
        assert!(path.is_dir());
    }
}
