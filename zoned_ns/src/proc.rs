/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process creation and namespace entry.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;

use nix::sys::wait::waitpid;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use tracing::debug;

use crate::Error;
use crate::NsSet;
use crate::Result;

/// Stack size for cloned children. The init child runs the whole rootfs
/// bootstrap on it before exec, so a single page is not enough.
pub const CLONE_STACK_SIZE: usize = 256 * 1024;

/// Clone a child with the given flags (namespace bits, CLONE_PARENT and
/// friends). The child runs `f` and its return value becomes the exit
/// code. SIGCHLD is always requested so a parent can reap the child.
pub fn clone_child<F>(f: F, flags: crate::CloneFlags) -> Result<Pid>
where
    F: FnMut() -> isize,
{
    let mut stack = vec![0u8; CLONE_STACK_SIZE];
    let mut cb = f;
    // Safety: the callback owns everything it touches and the child never
    // returns into our frames; it either execs or _exits.
    let pid = unsafe {
        nix::sched::clone(
            Box::new(&mut cb),
            &mut stack,
            flags,
            Some(nix::sys::signal::Signal::SIGCHLD as i32),
        )
    }
    .map_err(Error::Clone)?;
    debug!("cloned child {pid} with flags {flags:?}");
    Ok(pid)
}

/// Enter the namespaces of `pid`. The user namespace, when requested,
/// is entered first: it is the one that grants the privileges the
/// remaining setns calls may need.
pub fn setns(pid: Pid, namespaces: NsSet) -> Result<()> {
    // Open every fd up front; once we start switching mount namespaces
    // /proc may no longer show the target.
    let mut handles: Vec<(&'static str, nix::sched::CloneFlags, File)> = Vec::new();
    for kind in namespaces.iter() {
        let path = crate::ns_path(pid, kind);
        let fd = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .map_err(|e| Error::NsOpen {
                path: path.clone(),
                errno: nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)),
            })?;
        handles.push((kind.proc_name(), kind.clone_flag(), fd));
    }
    for (name, flag, fd) in handles {
        nix::sched::setns(&fd, flag).map_err(|errno| Error::Setns {
            pid,
            ns: name,
            errno,
        })?;
    }
    Ok(())
}

pub fn unshare(namespaces: NsSet) -> Result<()> {
    nix::sched::unshare(namespaces.clone_flags()).map_err(Error::Unshare)
}

/// Wait for a specific child, retrying on EINTR and on stop/continue
/// reports, and return its final status.
pub fn wait_exit(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                return Ok(status);
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(Error::Wait(pid, errno)),
        }
    }
}

/// Collapse a [WaitStatus] into the conventional shell-style exit code.
pub fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => 254,
    }
}
