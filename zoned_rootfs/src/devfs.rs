/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Host-side staging of a zone's /dev and /dev/pts.
//!
//! Runs before clone, in a freshly unshared mount namespace so the staged
//! trees never leak into the host's view: a tmpfs at `<work>/<name>.dev`
//! populated with the canonical device nodes, and a private devpts
//! instance at `<work>/<name>.devpts`. Ownership is shifted to the zone's
//! root uid/gid through the user-namespace maps.

use std::path::Path;
use std::path::PathBuf;

use nix::sys::stat::makedev;
use nix::sys::stat::mknod;
use nix::sys::stat::Mode;
use nix::sys::stat::SFlag;
use nix::unistd::chown;
use nix::unistd::Gid;
use nix::unistd::Uid;
use tracing::debug;

use zoned_ns::IdMap;

use crate::mount;
use crate::mount::MsFlags;
use crate::smack;
use crate::Error;
use crate::Result;

const DEV_MAJOR_MEMORY: u64 = 1;
const DEV_MAJOR_TTY: u64 = 5;

struct StaticDev {
    name: &'static str,
    major: u64,
    minor: u64,
    mode: u32,
}

const STATIC_DEVS: &[StaticDev] = &[
    StaticDev { name: "null", major: DEV_MAJOR_MEMORY, minor: 3, mode: 0o666 },
    StaticDev { name: "zero", major: DEV_MAJOR_MEMORY, minor: 5, mode: 0o666 },
    StaticDev { name: "full", major: DEV_MAJOR_MEMORY, minor: 7, mode: 0o666 },
    StaticDev { name: "random", major: DEV_MAJOR_MEMORY, minor: 8, mode: 0o666 },
    StaticDev { name: "urandom", major: DEV_MAJOR_MEMORY, minor: 9, mode: 0o666 },
    StaticDev { name: "tty", major: DEV_MAJOR_TTY, minor: 0, mode: 0o666 },
];

/// GID of the `tty` group inside the zone, before mapping.
const CONTAINER_TTY_GID: u32 = 5;

pub struct DevFs {
    pub dev_path: PathBuf,
    pub devpts_path: PathBuf,
    uid_map: IdMap,
    gid_map: IdMap,
}

impl DevFs {
    pub fn new(name: &str, work_path: &Path, uid_map: IdMap, gid_map: IdMap) -> Self {
        Self {
            dev_path: work_path.join(format!("{name}.dev")),
            devpts_path: work_path.join(format!("{name}.devpts")),
            uid_map,
            gid_map,
        }
    }

    /// The uid the zone's root maps to on the host (the map's image of
    /// container id 0). Without a user namespace both maps are empty and
    /// everything stays with host root.
    fn container_root_uid(&self) -> Result<Uid> {
        if self.uid_map.is_empty() {
            return Ok(Uid::from_raw(0));
        }
        self.uid_map
            .host_id(0)
            .map(Uid::from_raw)
            .ok_or(Error::UnmappedId(0))
    }

    fn container_root_gid(&self) -> Result<Gid> {
        if self.gid_map.is_empty() {
            return Ok(Gid::from_raw(0));
        }
        self.gid_map
            .host_id(0)
            .map(Gid::from_raw)
            .ok_or(Error::UnmappedId(0))
    }

    fn chown_container_root(&self, path: &Path) -> Result<()> {
        chown(
            path,
            Some(self.container_root_uid()?),
            Some(self.container_root_gid()?),
        )
        .map_err(|e| Error::Chown(path.to_path_buf(), e))
    }

    /// Stage both trees. The caller must already have unshared its mount
    /// namespace and made `/` a recursive slave.
    pub fn execute(&self) -> Result<()> {
        debug!("staging {}", self.dev_path.display());
        mount::mkdir(&self.dev_path, 0o755)?;
        mount::mount(
            Some(Path::new("devfs")),
            &self.dev_path,
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=755,size=65536"),
        )?;
        self.chown_container_root(&self.dev_path)?;

        for dev in STATIC_DEVS {
            let path = self.dev_path.join(dev.name);
            mknod(
                &path,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(dev.mode),
                makedev(dev.major, dev.minor),
            )
            .map_err(|e| Error::Mknod(path.clone(), e))?;
            self.chown_container_root(&path)?;
        }

        debug!("staging {}", self.devpts_path.display());
        // The pts gid inside the zone maps like any other id. Root and
        // tty gids may live in disjoint ranges.
        let pts_gid = if self.gid_map.is_empty() {
            CONTAINER_TTY_GID
        } else {
            self.gid_map
                .host_id(CONTAINER_TTY_GID)
                .ok_or(Error::UnmappedId(CONTAINER_TTY_GID))?
        };
        let devpts_opts = format!("newinstance,ptmxmode=0666,mode=0620,gid={pts_gid}");
        mount::mkdir(&self.devpts_path, 0o755)?;
        mount::mount(
            Some(Path::new("devpts")),
            &self.devpts_path,
            Some("devpts"),
            MsFlags::MS_NOSUID,
            Some(&devpts_opts),
        )?;
        self.chown_container_root(&self.devpts_path)?;
        self.chown_container_root(&self.devpts_path.join("ptmx"))?;

        // The kernel gives the fresh mount roots the floor label instead
        // of the mounter's; relabel so the zone can actually use them.
        if smack::is_smack_active() {
            let label = smack::self_label().map_err(|e| Error::Smack(self.dev_path.clone(), e))?;
            smack::set_access_label(&self.dev_path, &label)
                .map_err(|e| Error::Smack(self.dev_path.clone(), e))?;
            smack::set_access_label(&self.devpts_path, &label)
                .map_err(|e| Error::Smack(self.devpts_path.clone(), e))?;
        }

        Ok(())
    }

    /// Tear the staged trees down again.
    pub fn revert(&self) -> Result<()> {
        mount::umount(&self.dev_path)?;
        mount::umount(&self.devpts_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use zoned_ns::IdRange;

    use super::*;

    fn mapped(ranges: &[(u32, u32, u32)]) -> IdMap {
        IdMap::new(
            ranges
                .iter()
                .map(|&(container_id, host_id, length)| IdRange {
                    container_id,
                    host_id,
                    length,
                })
                .collect(),
        )
    }

    #[test]
    fn staging_paths_follow_zone_name() {
        let devfs = DevFs::new("z1", Path::new("/run/zoned"), IdMap::default(), IdMap::default());
        assert_eq!(devfs.dev_path, PathBuf::from("/run/zoned/z1.dev"));
        assert_eq!(devfs.devpts_path, PathBuf::from("/run/zoned/z1.devpts"));
    }

    #[test]
    fn container_root_maps_through_uid_map() {
        let devfs = DevFs::new(
            "z1",
            Path::new("/run/zoned"),
            mapped(&[(0, 100000, 1000)]),
            mapped(&[(0, 200000, 1000)]),
        );
        assert_eq!(devfs.container_root_uid().unwrap(), Uid::from_raw(100000));
        assert_eq!(devfs.container_root_gid().unwrap(), Gid::from_raw(200000));
    }

    #[test]
    fn empty_maps_mean_host_root() {
        let devfs = DevFs::new("z1", Path::new("/run"), IdMap::default(), IdMap::default());
        assert_eq!(devfs.container_root_uid().unwrap(), Uid::from_raw(0));
    }

    #[test]
    fn unmapped_root_is_an_error() {
        let devfs = DevFs::new(
            "z1",
            Path::new("/run"),
            mapped(&[(1000, 5000, 10)]),
            IdMap::default(),
        );
        assert!(matches!(
            devfs.container_root_uid(),
            Err(Error::UnmappedId(0))
        ));
    }
}
