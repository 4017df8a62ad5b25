/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The pivot-root sequence that gives the init child its filesystem view.
//!
//! Plan construction (path formatting, host mount probing, table
//! filtering) happens in the guard before clone; [PivotPlan::execute]
//! then runs inside the child's mount namespace and performs syscalls
//! over the prepared values only. No formatting or logging happens after
//! clone.

use std::path::Path;
use std::path::PathBuf;

use nix::sys::stat::Mode;
use tracing::debug;

use crate::mount;
use crate::mount::MsFlags;
use crate::Error;
use crate::Result;

/// Directory inside the new root where the old root is parked during the
/// pivot. Lives on a private tmpfs so it can be unmounted wholesale.
pub const OLD_ROOT: &str = "/.oldroot";

struct StaticMount {
    source: &'static str,
    target: &'static str,
    fstype: &'static str,
    flags: MsFlags,
    skip_userns: bool,
    skip_unmounted: bool,
    skip_no_netns: bool,
}

const NOSUID_NOEXEC_NODEV: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_NODEV);

const STATIC_MOUNTS: &[StaticMount] = &[
    StaticMount {
        source: "proc",
        target: "/proc",
        fstype: "proc",
        flags: NOSUID_NOEXEC_NODEV,
        skip_userns: false,
        skip_unmounted: false,
        skip_no_netns: false,
    },
    StaticMount {
        source: "/proc/sys",
        target: "/proc/sys",
        fstype: "",
        flags: MsFlags::MS_BIND
            .union(NOSUID_NOEXEC_NODEV)
            .union(MsFlags::MS_RDONLY),
        skip_userns: false,
        skip_unmounted: false,
        skip_no_netns: false,
    },
    StaticMount {
        source: "sysfs",
        target: "/sys",
        fstype: "sysfs",
        flags: NOSUID_NOEXEC_NODEV.union(MsFlags::MS_RDONLY),
        skip_userns: false,
        skip_unmounted: false,
        skip_no_netns: true,
    },
    StaticMount {
        source: "securityfs",
        target: "/sys/kernel/security",
        fstype: "securityfs",
        flags: NOSUID_NOEXEC_NODEV.union(MsFlags::MS_RDONLY),
        skip_userns: true,
        skip_unmounted: true,
        skip_no_netns: false,
    },
    StaticMount {
        source: "selinuxfs",
        target: "/sys/fs/selinux",
        fstype: "selinuxfs",
        flags: NOSUID_NOEXEC_NODEV.union(MsFlags::MS_RDONLY),
        skip_userns: true,
        skip_unmounted: true,
        skip_no_netns: false,
    },
    StaticMount {
        source: "smackfs",
        target: "/sys/fs/smackfs",
        fstype: "smackfs",
        flags: NOSUID_NOEXEC_NODEV.union(MsFlags::MS_RDONLY),
        skip_userns: true,
        skip_unmounted: true,
        skip_no_netns: false,
    },
];

const STATIC_LINKS: &[(&str, &str)] = &[
    ("/proc/self/fd/0", "/dev/stdin"),
    ("/proc/self/fd/1", "/dev/stdout"),
    ("/proc/self/fd/2", "/dev/stderr"),
    ("/proc/self/fd", "/dev/fd"),
];

struct PreparedMount {
    source: PathBuf,
    target: PathBuf,
    fstype: &'static str,
    flags: MsFlags,
}

pub struct PivotPlan {
    root_path: PathBuf,
    staging: PathBuf,
    newroot: PathBuf,
    put_old_rel: PathBuf,
    reusing_host_root: bool,
    static_mounts: Vec<PreparedMount>,
    dev_source: PathBuf,
    devpts_source: PathBuf,
    dev_prepared_on_host: PathBuf,
    dev_flags: MsFlags,
    links: Vec<(PathBuf, PathBuf)>,
}

impl PivotPlan {
    /// Resolve everything the child will need. `work_path` holds the
    /// pre-staged `<name>.dev` and `<name>.devpts` mounts.
    pub fn new(name: &str, root_path: &Path, work_path: &Path, namespaces: zoned_ns::NsSet) -> Result<Self> {
        let is_userns = namespaces.contains(zoned_ns::NsKind::User);
        let is_netns = namespaces.contains(zoned_ns::NsKind::Net);

        let staging = join_abs(root_path, Path::new(OLD_ROOT));
        let newroot = staging.join("newroot");

        let mut static_mounts = Vec::new();
        for m in STATIC_MOUNTS {
            if m.skip_userns && is_userns {
                debug!("not mounting {}: skipped under user namespace", m.target);
                continue;
            }
            if m.skip_no_netns && !is_netns && is_userns {
                debug!("not mounting {}: skipped without net namespace", m.target);
                continue;
            }
            if m.skip_unmounted {
                let host_path = Path::new(m.target);
                if !host_path.is_dir() || !mount::is_mount_point(host_path)? {
                    debug!("not mounting {}: not mounted on the host", m.target);
                    continue;
                }
            }
            static_mounts.push(PreparedMount {
                source: PathBuf::from(m.source),
                target: PathBuf::from(m.target),
                fstype: m.fstype,
                flags: m.flags,
            });
        }

        // After the pivot the staged trees appear under the parked old
        // root; under a user namespace they can only be bind-mounted.
        let dev_prepared_on_host = work_path.join(format!("{name}.dev"));
        let dev_source = join_abs(Path::new(OLD_ROOT), &join_abs(work_path, Path::new(&format!("{name}.dev"))));
        let devpts_source = join_abs(Path::new(OLD_ROOT), &join_abs(work_path, Path::new(&format!("{name}.devpts"))));
        let dev_flags = if is_userns {
            MsFlags::MS_BIND
        } else {
            MsFlags::MS_MOVE
        };

        Ok(Self {
            root_path: root_path.to_path_buf(),
            staging,
            newroot,
            put_old_rel: PathBuf::from(format!(".{OLD_ROOT}")),
            reusing_host_root: root_path == Path::new("/"),
            static_mounts,
            dev_source,
            devpts_source,
            dev_prepared_on_host,
            dev_flags,
            links: STATIC_LINKS
                .iter()
                .map(|(src, dst)| (PathBuf::from(src), PathBuf::from(dst)))
                .collect(),
        })
    }

    /// Runs inside the child's mount namespace. Syscalls only.
    pub fn execute(&self) -> Result<()> {
        // Keep every mount change invisible to the host.
        mount::mount(
            None,
            Path::new("/"),
            None,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None,
        )?;

        // The new root must sit on its own mount point for pivot_root.
        mkdir_raw(&self.staging)?;
        mount::mount(None, &self.staging, Some("tmpfs"), MsFlags::empty(), None)?;
        mkdir_raw(&self.newroot)?;
        mount::mount(
            Some(&self.root_path),
            &self.newroot,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )?;

        nix::unistd::chdir(&self.newroot)
            .map_err(|e| Error::PivotRoot(self.newroot.clone(), e))?;
        nix::unistd::pivot_root(".", self.put_old_rel.as_path())
            .map_err(|e| Error::PivotRoot(self.newroot.clone(), e))?;
        nix::unistd::chdir("/").map_err(|e| Error::PivotRoot(PathBuf::from("/"), e))?;

        if self.reusing_host_root {
            self.cleanup_host_root()?;
        }

        for m in &self.static_mounts {
            mkdir_raw(&m.target)?;
            mount::mount(
                Some(&m.source),
                &m.target,
                if m.fstype.is_empty() {
                    None
                } else {
                    Some(m.fstype)
                },
                m.flags,
                None,
            )?;
        }

        mkdir_raw(Path::new("/dev"))?;
        mount::mount(
            Some(&self.dev_source),
            Path::new("/dev"),
            None,
            self.dev_flags,
            None,
        )?;
        mkdir_raw(Path::new("/dev/pts"))?;
        mount::mount(
            Some(&self.devpts_source),
            Path::new("/dev/pts"),
            None,
            self.dev_flags,
            None,
        )?;

        for (src, dst) in &self.links {
            std::os::unix::fs::symlink(src, dst)
                .map_err(|e| Error::Symlink(dst.clone(), e))?;
        }

        Ok(())
    }

    /// The zone reuses the host `/`: drop the inherited pseudo trees so
    /// they can be remounted cleanly. Reusing `/` with a user namespace
    /// is not supported; the unmounts would fail with EPERM as they
    /// should.
    fn cleanup_host_root(&self) -> Result<()> {
        let old_root = Path::new(OLD_ROOT);
        mount::umount_detach(&join_abs(old_root, &self.dev_prepared_on_host))?;
        for subtree in ["/sys", "/dev", "/proc"] {
            mount::umount_subtree(&join_abs(old_root, Path::new(subtree)))?;
        }
        Ok(())
    }
}

fn mkdir_raw(path: &Path) -> Result<()> {
    match nix::unistd::mkdir(path, Mode::from_bits_truncate(0o755)) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(Error::CreateDir(
            path.to_path_buf(),
            std::io::Error::from_raw_os_error(e as i32),
        )),
    }
}

/// Join an absolute path beneath a base directory.
fn join_abs(base: &Path, abs: &Path) -> PathBuf {
    match abs.strip_prefix("/") {
        Ok(rel) => base.join(rel),
        Err(_) => base.join(abs),
    }
}

#[cfg(test)]
mod tests {
    use zoned_ns::NsKind;
    use zoned_ns::NsSet;

    use super::*;

    #[test]
    fn userns_skips_security_filesystems() {
        let plan = PivotPlan::new(
            "z1",
            Path::new("/var/lib/zoned/z1"),
            Path::new("/run/zoned"),
            NsSet::empty().with(NsKind::User).with(NsKind::Mnt),
        )
        .unwrap();
        let targets: Vec<_> = plan
            .static_mounts
            .iter()
            .map(|m| m.target.to_string_lossy().into_owned())
            .collect();
        assert!(targets.contains(&"/proc".to_string()));
        assert!(!targets.contains(&"/sys/kernel/security".to_string()));
        // userns without netns also drops sysfs
        assert!(!targets.contains(&"/sys".to_string()));
        assert_eq!(plan.dev_flags, MsFlags::MS_BIND);
    }

    #[test]
    fn plain_namespaces_move_staged_dev() {
        let plan = PivotPlan::new(
            "z1",
            Path::new("/var/lib/zoned/z1"),
            Path::new("/run/zoned"),
            NsSet::empty().with(NsKind::Mnt).with(NsKind::Net),
        )
        .unwrap();
        assert_eq!(plan.dev_flags, MsFlags::MS_MOVE);
        assert_eq!(
            plan.dev_source,
            PathBuf::from("/.oldroot/run/zoned/z1.dev")
        );
        assert_eq!(
            plan.devpts_source,
            PathBuf::from("/.oldroot/run/zoned/z1.devpts")
        );
    }

    #[test]
    fn staging_lives_inside_the_new_root() {
        let plan = PivotPlan::new(
            "zone-a",
            Path::new("/zones/zone-a"),
            Path::new("/run/zoned"),
            NsSet::empty().with(NsKind::Mnt),
        )
        .unwrap();
        assert_eq!(plan.staging, PathBuf::from("/zones/zone-a/.oldroot"));
        assert_eq!(plan.newroot, PathBuf::from("/zones/zone-a/.oldroot/newroot"));
        assert_eq!(plan.put_old_rel, PathBuf::from("./.oldroot"));
        assert!(!plan.reusing_host_root);
    }
}
