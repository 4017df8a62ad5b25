/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The start machinery: the start barrier, the uid/gid map writes and the
//! init bootstrap plan.
//!
//! The plan is built in the guard before clone - every path, argument and
//! environment entry is resolved to a CString up front - so the cloned
//! child only performs syscalls until it execs.

use std::ffi::CString;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::path::PathBuf;

use nix::sys::socket::socketpair;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::unistd::Pid;
use zoned_ns::IdMap;
use zoned_ns::NsKind;
use zoned_rootfs::pivot::PivotPlan;
use zoned_rootfs::provision::Provisions;

use crate::config::ContainerConfig;
use crate::Error;
use crate::Result;

/// Default init environment, the same PATH systemd-nspawn hands to its
/// payloads.
const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// The start barrier: a socketpair whose single byte releases the init
/// child once the guard has written the id maps.
pub struct Barrier {
    guard_end: OwnedFd,
    child_end: OwnedFd,
}

impl Barrier {
    pub fn new() -> Result<Self> {
        let (guard_end, child_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(Error::Barrier)?;
        Ok(Self {
            guard_end,
            child_end,
        })
    }

    /// Fd the cloned child blocks on. CLOEXEC keeps it from leaking
    /// through the final exec.
    pub fn child_fd(&self) -> std::os::fd::RawFd {
        self.child_end.as_raw_fd()
    }

    /// Release the child. Guard side, after the id maps are in place.
    pub fn release(&self) -> Result<()> {
        let buf = [1u8];
        nix::unistd::write(&self.guard_end, &buf).map_err(Error::Barrier)?;
        Ok(())
    }
}

/// Child side: block until the guard releases the barrier. Syscalls only.
fn barrier_wait(fd: std::os::fd::RawFd) -> std::result::Result<(), ()> {
    let mut buf = [0u8; 1];
    loop {
        match nix::unistd::read(fd, &mut buf) {
            Ok(1) => return Ok(()),
            Ok(_) => return Err(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return Err(()),
        }
    }
}

/// Write the uid and gid maps of a freshly cloned init. A no-op for an
/// empty map. This must complete before the barrier is released: the
/// child's first privileged operations depend on the mapping.
pub fn setup_userns(init_pid: Pid, uid_map: &IdMap, gid_map: &IdMap) -> Result<()> {
    for (file, map) in [("uid_map", uid_map), ("gid_map", gid_map)] {
        if map.is_empty() {
            continue;
        }
        let path = PathBuf::from(format!("/proc/{init_pid}/{file}"));
        let mut handle = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|error| Error::MapWrite {
                path: path.clone(),
                error,
            })?;
        handle
            .write_all(map.to_proc_file().as_bytes())
            .map_err(|error| Error::MapWrite { path, error })?;
    }
    Ok(())
}

/// Everything the init child does between clone and exec, fully resolved.
pub struct InitPlan {
    barrier_fd: std::os::fd::RawFd,
    pivot: PivotPlan,
    provisions: Provisions,
    hostname: Option<String>,
    pts_path: CString,
    reset_uid: bool,
    reset_gid: bool,
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl InitPlan {
    /// `pts_name` is the in-zone path of the first terminal's slave.
    pub fn build(config: &ContainerConfig, barrier: &Barrier, pts_name: &str) -> Result<Self> {
        let pivot = PivotPlan::new(
            &config.name,
            &config.root_path,
            &config.work_path,
            config.namespaces,
        )?;
        let to_cstring = |s: &str| CString::new(s.as_bytes()).map_err(|_| Error::NulByte);
        let program = to_cstring(&config.init_argv[0])?;
        let argv = config
            .init_argv
            .iter()
            .map(|a| to_cstring(a))
            .collect::<Result<Vec<_>>>()?;
        let envp = vec![
            to_cstring(DEFAULT_PATH)?,
            to_cstring("container=zoned")?,
            to_cstring("HOME=/root")?,
        ];
        Ok(Self {
            barrier_fd: barrier.child_fd(),
            pivot,
            provisions: config.provisions.clone(),
            hostname: config
                .namespaces
                .contains(NsKind::Uts)
                .then(|| config.name.clone()),
            pts_path: CString::new(pts_name.as_bytes()).map_err(|_| Error::NulByte)?,
            reset_uid: !config.uid_map.is_empty(),
            reset_gid: !config.gid_map.is_empty(),
            program,
            argv,
            envp,
        })
    }

    /// Entry point of the cloned child. Never returns on success; the
    /// return value is the exit code on failure.
    pub fn run(&self) -> isize {
        if barrier_wait(self.barrier_fd).is_err() {
            return libc::EXIT_FAILURE as isize;
        }

        if self.pivot.execute().is_err() {
            return libc::EXIT_FAILURE as isize;
        }
        if self.provisions.execute().is_err() {
            return libc::EXIT_FAILURE as isize;
        }
        if let Some(hostname) = &self.hostname {
            if nix::unistd::sethostname(hostname).is_err() {
                return libc::EXIT_FAILURE as isize;
            }
        }

        if self.setup_control_tty().is_err() {
            return libc::EXIT_FAILURE as isize;
        }

        // Inside a fresh user namespace the child starts with the
        // pre-clone uid; reset to the mapped root.
        if self.reset_uid && unsafe { libc::setreuid(0, 0) } != 0 {
            return libc::EXIT_FAILURE as isize;
        }
        if self.reset_gid && unsafe { libc::setregid(0, 0) } != 0 {
            return libc::EXIT_FAILURE as isize;
        }

        let _ = nix::unistd::execve(&self.program, &self.argv, &self.envp);
        libc::EXIT_FAILURE as isize
    }

    fn setup_control_tty(&self) -> std::result::Result<(), ()> {
        // Safety: pts_path is NUL-terminated; the fd is checked below.
        let fd = unsafe { libc::open(self.pts_path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(());
        }
        if nix::unistd::setsid().is_err() {
            return Err(());
        }
        // Safety: plain ioctl on a terminal fd.
        if unsafe { libc::ioctl(fd, libc::TIOCSCTTY as _, 0) } < 0 {
            return Err(());
        }
        for stdio in 0..=2 {
            if nix::unistd::dup2(fd, stdio).is_err() {
                return Err(());
            }
        }
        if fd > 2 && nix::unistd::close(fd).is_err() {
            return Err(());
        }
        Ok(())
    }
}

/// In-zone path of a terminal slave as the init child will see it.
pub fn guest_pts_path(pts_name: &str) -> String {
    // Names from a private devpts are already /dev/pts/N.
    if pts_name.starts_with("/dev/pts/") {
        pts_name.to_string()
    } else {
        let trailing = Path::new(pts_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("/dev/pts/{trailing}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_releases_child_side() {
        let barrier = Barrier::new().unwrap();
        barrier.release().unwrap();
        barrier_wait(barrier.child_fd()).unwrap();
    }

    #[test]
    fn empty_maps_write_nothing() {
        // Writing to our own pid's map files would fail; empty maps must
        // short-circuit before touching /proc.
        setup_userns(Pid::from_raw(1), &IdMap::default(), &IdMap::default()).unwrap();
    }

    #[test]
    fn guest_paths_normalize_to_dev_pts() {
        assert_eq!(guest_pts_path("/dev/pts/4"), "/dev/pts/4");
        assert_eq!(guest_pts_path("/dev/pts/17"), "/dev/pts/17");
        assert_eq!(guest_pts_path("5"), "/dev/pts/5");
    }
}
