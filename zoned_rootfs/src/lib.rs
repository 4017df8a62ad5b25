/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! zoned_rootfs
//! ============
//!
//! Everything that shapes a zone's filesystem view: mount primitives, the
//! pivot-root sequence with its static pseudo-filesystem table, host-side
//! staging of the zone's /dev and /dev/pts, and replay of declared
//! files/mounts/links.

use std::path::PathBuf;

pub mod devfs;
pub mod mount;
pub mod pivot;
pub mod provision;
pub mod smack;

pub use mount::MsFlags;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mount {source_path:?} on {target:?} ({fstype}) failed: {errno}")]
    Mount {
        source_path: Option<PathBuf>,
        target: PathBuf,
        fstype: &'static str,
        errno: nix::errno::Errno,
    },
    #[error("umount {0:?} failed: {1}")]
    Umount(PathBuf, nix::errno::Errno),
    #[error("pivot_root into {0:?} failed: {1}")]
    PivotRoot(PathBuf, nix::errno::Errno),
    #[error("mknod {0:?} failed: {1}")]
    Mknod(PathBuf, nix::errno::Errno),
    #[error("chown {0:?} failed: {1}")]
    Chown(PathBuf, nix::errno::Errno),
    #[error("symlink {0:?} failed: {1}")]
    Symlink(PathBuf, std::io::Error),
    #[error("cannot create {0:?}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("cannot create {0:?}: {1}")]
    CreateFile(PathBuf, std::io::Error),
    #[error("cannot read mount table: {0}")]
    MountTable(std::io::Error),
    #[error("user namespace config has no mapping for container id {0}")]
    UnmappedId(u32),
    #[error("smack relabel of {0:?} failed: {1}")]
    Smack(PathBuf, std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
