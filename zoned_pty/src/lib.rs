/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! zoned_pty
//! =========
//!
//! Pseudo-terminal allocation for zones and the interactive console
//! multiplexer that binds a user's terminal to one of a zone's PTY
//! masters.

use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use nix::fcntl::fcntl;
use nix::fcntl::FcntlArg;
use nix::fcntl::FdFlag;
use nix::fcntl::OFlag;
use nix::sys::termios::cfmakeraw;
use nix::sys::termios::tcgetattr;
use nix::sys::termios::tcsetattr;
use nix::sys::termios::SetArg;
use nix::unistd::chown;
use nix::unistd::ttyname;
use nix::unistd::Uid;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

pub mod console;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("openpty failed: {0}")]
    Openpty(nix::errno::Errno),
    #[error("cannot open {0}: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("terminal attribute call failed: {0}")]
    Termios(nix::errno::Errno),
    #[error("fcntl on pty master failed: {0}")]
    Fcntl(nix::errno::Errno),
    #[error("chown {0:?} failed: {1}")]
    Chown(PathBuf, nix::errno::Errno),
    #[error("pty ioctl failed: {0}")]
    Ioctl(nix::errno::Errno),
    #[error("requested terminal {requested} but only {count} exist")]
    NoSuchTerminal { requested: usize, count: usize },
    #[error("stdin/stdout is not a terminal")]
    NotATty,
    #[error(transparent)]
    Ipc(#[from] zoned_ipc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What the guard knows about a zone's terminals before they exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalsConfig {
    pub count: u32,
    /// Private devpts instance to allocate from; `None` uses the host's.
    pub devpts_path: Option<PathBuf>,
    /// Owner of the slave ends when allocating from a private devpts.
    pub uid: u32,
}

impl Default for TerminalsConfig {
    fn default() -> Self {
        Self {
            count: 1,
            devpts_path: None,
            uid: 0,
        }
    }
}

/// One allocated pseudo-terminal: the retained master and the slave's
/// name for export into the zone's /dev.
#[derive(Debug)]
pub struct Pty {
    pub master: OwnedFd,
    pub pts_name: String,
}

mod ioctls {
    nix::ioctl_write_ptr!(tiocsptlck, b'T', 0x31, libc::c_int);
    nix::ioctl_read!(tiocgptn, b'T', 0x30, libc::c_uint);
}

fn set_master_flags(master: &OwnedFd) -> Result<()> {
    fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(Error::Fcntl)?;
    let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL).map_err(Error::Fcntl)?;
    fcntl(
        master.as_raw_fd(),
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )
    .map_err(Error::Fcntl)?;
    Ok(())
}

fn make_slave_raw<F: AsFd>(slave: &F) -> Result<()> {
    let mut attrs = tcgetattr(slave).map_err(Error::Termios)?;
    cfmakeraw(&mut attrs);
    tcsetattr(slave, SetArg::TCSADRAIN, &attrs).map_err(Error::Termios)?;
    Ok(())
}

/// Allocate a PTY pair from the host devpts. The slave is switched to
/// raw mode and closed; the master comes back CLOEXEC and nonblocking.
pub fn open_pty() -> Result<Pty> {
    let pair = nix::pty::openpty(None::<&nix::pty::Winsize>, None::<&nix::sys::termios::Termios>)
        .map_err(Error::Openpty)?;
    set_master_flags(&pair.master)?;
    make_slave_raw(&pair.slave)?;
    let pts_name = ttyname(pair.slave.as_fd())
        .map_err(Error::Openpty)?
        .to_string_lossy()
        .into_owned();
    debug!("allocated pty {pts_name}");
    Ok(Pty {
        master: pair.master,
        pts_name,
    })
}

/// Allocate a PTY pair through a private devpts instance: open its ptmx,
/// unlock, chown the slave to `uid`.
pub fn open_pty_in(devpts_path: &Path, uid: Uid) -> Result<Pty> {
    let ptmx_path = devpts_path.join("ptmx");
    let master: OwnedFd = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&ptmx_path)
        .map_err(|e| Error::Open(ptmx_path.clone(), e))?
        .into();
    set_master_flags(&master)?;

    // Safety: ioctl on a valid ptmx descriptor with properly typed args.
    let mut pts_number: libc::c_uint = 0;
    unsafe {
        let unlock: libc::c_int = 0;
        ioctls::tiocsptlck(master.as_raw_fd(), &unlock).map_err(Error::Ioctl)?;
        ioctls::tiocgptn(master.as_raw_fd(), &mut pts_number).map_err(Error::Ioctl)?;
    }

    let slave_path = devpts_path.join(pts_number.to_string());
    chown(&slave_path, Some(uid), None).map_err(|e| Error::Chown(slave_path.clone(), e))?;

    let slave = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&slave_path)
        .map_err(|e| Error::Open(slave_path.clone(), e))?;
    make_slave_raw(&slave)?;

    // Exported name is relative to the devpts mount, which becomes the
    // zone's /dev/pts.
    Ok(Pty {
        master,
        pts_name: format!("/dev/pts/{pts_number}"),
    })
}

/// Allocate all terminals of a zone per its config.
pub fn prepare_terminals(config: &TerminalsConfig) -> Result<Vec<Pty>> {
    let mut ptys = Vec::with_capacity(config.count as usize);
    for _ in 0..config.count {
        let pty = match &config.devpts_path {
            Some(devpts) => open_pty_in(devpts, Uid::from_raw(config.uid))?,
            None => open_pty()?,
        };
        ptys.push(pty);
    }
    Ok(ptys)
}

#[cfg(test)]
mod tests {
    use nix::sys::stat::fstat;

    use super::*;

    #[test]
    fn master_is_cloexec_and_nonblocking() {
        let pty = open_pty().unwrap();
        let fd_flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(fd_flags).contains(FdFlag::FD_CLOEXEC));
        let fl_flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL).unwrap();
        assert!(OFlag::from_bits_truncate(fl_flags).contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn pts_name_points_at_a_character_device() {
        let pty = open_pty().unwrap();
        assert!(pty.pts_name.starts_with("/dev/pts/"));
        let meta = std::fs::metadata(&pty.pts_name).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_char_device());
        // and the master is a live fd
        fstat(pty.master.as_raw_fd()).unwrap();
    }

    #[test]
    fn default_config_is_one_host_terminal() {
        let config = TerminalsConfig::default();
        assert_eq!(config.count, 1);
        assert!(config.devpts_path.is_none());
    }
}
