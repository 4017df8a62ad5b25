/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! zoned_attach
//! ============
//!
//! Runs a caller-supplied command inside a running zone.
//!
//! Three processes cooperate: the caller forks an intermediary, which
//! enters the target's namespaces and clones the final child with
//! CLONE_PARENT (so the child's parent is the original caller and the
//! intermediary can exit immediately, while the child still lands in the
//! target PID namespace). The child drops capabilities, switches
//! credentials, takes the control TTY and execs.
//!
//! Everything the post-fork paths touch - CStrings, fds, the capability
//! ceiling - is prepared before the first fork; after it, only syscalls
//! and `_exit`.

use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use nix::mount::MsFlags;
use nix::sys::wait::WaitStatus;
use nix::unistd::fork;
use nix::unistd::ForkResult;
use nix::unistd::Gid;
use nix::unistd::Pid;
use nix::unistd::Uid;
use tracing::debug;
use zoned_ns::caps;
use zoned_ns::creds;
use zoned_ns::proc;
use zoned_ns::CloneFlags;
use zoned_ns::NsSet;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot open tty {0:?}: {1}")]
    Tty(PathBuf, std::io::Error),
    #[error("argv must not be empty")]
    EmptyArgv,
    #[error("NUL byte in argument or environment entry")]
    NulByte,
    #[error("fork failed: {0}")]
    Fork(nix::errno::Errno),
    #[error("pipe failed: {0}")]
    Pipe(nix::errno::Errno),
    #[error("intermediary died before reporting the child pid")]
    NoChildPid,
    #[error(transparent)]
    Ns(#[from] zoned_ns::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct AttachOptions {
    /// Init of the target zone; its namespaces are the ones entered.
    pub init_pid: Pid,
    pub namespaces: NsSet,
    pub uid: Uid,
    pub gid: Gid,
    pub supplementary_gids: Vec<Gid>,
    /// Bounding-set mask to keep; everything else is dropped.
    pub caps_to_keep: u64,
    /// Working directory, resolved inside the zone.
    pub work_dir: PathBuf,
    /// Terminal that becomes the child's controlling TTY and stdio.
    pub tty_path: PathBuf,
    pub env_to_keep: Vec<String>,
    pub env_to_set: Vec<(String, String)>,
    /// Remount /proc and /sys when entering PID/NET but not MNT.
    pub remount_proc_sys: bool,
    pub argv: Vec<String>,
}

/// Exit statuses of the two processes the caller waits for.
#[derive(Debug)]
pub struct AttachResult {
    pub intermediary: WaitStatus,
    pub child: WaitStatus,
}

struct Prepared {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    tty: OwnedFd,
    last_cap: u32,
}

mod ioctls {
    nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| Error::NulByte)
}

/// Resolve the final environment: keep the listed names from the current
/// environment, then apply the explicit settings on top.
fn build_env(keep: &[String], set: &[(String, String)]) -> Result<Vec<CString>> {
    let mut entries: Vec<(String, String)> = Vec::new();
    for name in keep {
        if let Ok(value) = std::env::var(name) {
            entries.push((name.clone(), value));
        }
    }
    for (name, value) in set {
        entries.retain(|(n, _)| n != name);
        entries.push((name.clone(), value.clone()));
    }
    entries
        .iter()
        .map(|(n, v)| cstring(format!("{n}={v}").as_bytes()))
        .collect()
}

fn prepare(options: &AttachOptions) -> Result<Prepared> {
    if options.argv.is_empty() {
        return Err(Error::EmptyArgv);
    }
    let tty: OwnedFd = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&options.tty_path)
        .map_err(|e| Error::Tty(options.tty_path.clone(), e))?
        .into();
    Ok(Prepared {
        program: cstring(options.argv[0].as_bytes())?,
        argv: options
            .argv
            .iter()
            .map(|a| cstring(a.as_bytes()))
            .collect::<Result<_>>()?,
        envp: build_env(&options.env_to_keep, &options.env_to_set)?,
        tty,
        last_cap: caps::last_cap()?,
    })
}

/// Attach and wait for completion.
pub fn attach(options: &AttachOptions) -> Result<AttachResult> {
    let prepared = prepare(options)?;
    let (pipe_read, pipe_write) = nix::unistd::pipe().map_err(Error::Pipe)?;

    debug!(
        "attaching to init {} in namespaces {:?}",
        options.init_pid,
        options.namespaces.clone_flags()
    );

    // Safety: the intermediary branch only runs async-signal-safe code
    // and never returns.
    let inter_pid = match unsafe { fork() }.map_err(Error::Fork)? {
        ForkResult::Parent { child } => {
            drop(pipe_write);
            child
        }
        ForkResult::Child => {
            drop(pipe_read);
            intermediary(options, &prepared, pipe_write)
        }
    };

    // The intermediary reports the pid of the cloned grandchild, which
    // CLONE_PARENT made our direct child.
    let mut pid_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < pid_bytes.len() {
        match nix::unistd::read(pipe_read.as_raw_fd(), &mut pid_bytes[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    let intermediary_status = proc::wait_exit(inter_pid)?;
    if filled < pid_bytes.len() {
        return Err(Error::NoChildPid);
    }
    let child_pid = Pid::from_raw(i32::from_le_bytes(pid_bytes));
    let child_status = proc::wait_exit(child_pid)?;

    Ok(AttachResult {
        intermediary: intermediary_status,
        child: child_status,
    })
}

/// Second process: enter the namespaces, chdir, clone the final child
/// with CLONE_PARENT, report its pid, exit.
fn intermediary(options: &AttachOptions, prepared: &Prepared, pipe_write: OwnedFd) -> ! {
    if proc::setns(options.init_pid, options.namespaces).is_err() {
        unsafe { libc::_exit(libc::EXIT_FAILURE) };
    }
    if nix::unistd::chdir(&options.work_dir).is_err() {
        unsafe { libc::_exit(libc::EXIT_FAILURE) };
    }

    // The PID namespace only applies to children, hence the second hop.
    let child_pid = match proc::clone_child(|| child(options, prepared), CloneFlags::CLONE_PARENT)
    {
        Ok(pid) => pid,
        Err(_) => unsafe { libc::_exit(libc::EXIT_FAILURE) },
    };

    let bytes = child_pid.as_raw().to_le_bytes();
    let mut written = 0;
    while written < bytes.len() {
        match nix::unistd::write(&pipe_write, &bytes[written..]) {
            Ok(n) => written += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => unsafe { libc::_exit(libc::EXIT_FAILURE) },
        }
    }
    unsafe { libc::_exit(libc::EXIT_SUCCESS) };
}

/// Final process, inside all namespaces. Syscalls and `_exit` only.
fn child(options: &AttachOptions, prepared: &Prepared) -> isize {
    if options.remount_proc_sys && remount_proc_sys().is_err() {
        return libc::EXIT_FAILURE as isize;
    }

    if caps::drop_bounding_except(options.caps_to_keep, prepared.last_cap).is_err() {
        return libc::EXIT_FAILURE as isize;
    }

    if creds::setregid(options.gid, options.gid).is_err() {
        return libc::EXIT_FAILURE as isize;
    }
    // Setting supplementary groups needs privilege; an empty list means
    // "leave them alone".
    if !options.supplementary_gids.is_empty()
        && creds::setgroups(&options.supplementary_gids).is_err()
    {
        return libc::EXIT_FAILURE as isize;
    }
    if creds::setreuid(options.uid, options.uid).is_err() {
        return libc::EXIT_FAILURE as isize;
    }

    let tty = prepared.tty.as_raw_fd();
    if nix::unistd::isatty(tty) != Ok(true) {
        return libc::EXIT_FAILURE as isize;
    }
    if creds::setsid().is_err() {
        return libc::EXIT_FAILURE as isize;
    }
    // Safety: tty is a valid descriptor owned by `prepared`.
    if unsafe { ioctls::tiocsctty(tty, 0) }.is_err() {
        return libc::EXIT_FAILURE as isize;
    }
    for stdio in 0..=2 {
        if nix::unistd::dup2(tty, stdio).is_err() {
            return libc::EXIT_FAILURE as isize;
        }
    }

    let _ = nix::unistd::execve(&prepared.program, &prepared.argv, &prepared.envp);
    libc::EXIT_FAILURE as isize
}

/// Fresh /proc and /sys for an attach that entered PID/NET namespaces
/// while keeping the zone's mount namespace out of the requested set.
fn remount_proc_sys() -> std::result::Result<(), nix::errno::Errno> {
    nix::sched::unshare(CloneFlags::CLONE_NEWNS)?;
    nix::mount::mount(
        None::<&Path>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    nix::mount::umount2("/proc", nix::mount::MntFlags::MNT_DETACH)?;
    nix::mount::mount(
        Some("none"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )?;
    nix::mount::umount2("/sys", nix::mount::MntFlags::MNT_DETACH)?;
    nix::mount::mount(
        Some("none"),
        "/sys",
        Some("sysfs"),
        MsFlags::empty(),
        None::<&str>,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keeps_then_sets() {
        std::env::set_var("ZONED_ATTACH_TEST_PATH", "/usr/bin");
        let env = build_env(
            &["ZONED_ATTACH_TEST_PATH".to_string()],
            &[("FOO".to_string(), "bar".to_string())],
        )
        .unwrap();
        let entries: Vec<&str> = env.iter().map(|e| e.to_str().unwrap()).collect();
        assert_eq!(
            entries,
            vec!["ZONED_ATTACH_TEST_PATH=/usr/bin", "FOO=bar"]
        );
    }

    #[test]
    fn explicit_setting_overrides_kept_value() {
        std::env::set_var("ZONED_ATTACH_TEST_DUP", "old");
        let env = build_env(
            &["ZONED_ATTACH_TEST_DUP".to_string()],
            &[("ZONED_ATTACH_TEST_DUP".to_string(), "new".to_string())],
        )
        .unwrap();
        let entries: Vec<&str> = env.iter().map(|e| e.to_str().unwrap()).collect();
        assert_eq!(entries, vec!["ZONED_ATTACH_TEST_DUP=new"]);
    }

    #[test]
    fn unset_kept_names_are_dropped() {
        std::env::remove_var("ZONED_ATTACH_TEST_MISSING");
        let env = build_env(&["ZONED_ATTACH_TEST_MISSING".to_string()], &[]).unwrap();
        assert!(env.is_empty());
    }

    #[test]
    fn empty_argv_is_rejected() {
        let options = AttachOptions {
            init_pid: Pid::from_raw(1),
            namespaces: NsSet::empty(),
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
            supplementary_gids: Vec::new(),
            caps_to_keep: 0,
            work_dir: "/".into(),
            tty_path: "/dev/null".into(),
            env_to_keep: Vec::new(),
            env_to_set: Vec::new(),
            remount_proc_sys: false,
            argv: Vec::new(),
        };
        assert!(matches!(prepare(&options), Err(Error::EmptyArgv)));
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(matches!(
            build_env(&[], &[("A\0B".to_string(), "x".to_string())]),
            Err(Error::NulByte)
        ));
    }
}
