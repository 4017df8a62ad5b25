/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Signal delivery as readable events. Each process owns exactly one
//! [SignalWatch]; the watched signals are blocked for normal delivery and
//! read back from the descriptor inside the event loop, so no async
//! handler ever runs.

use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;

use nix::sys::signal::sigprocmask;
use nix::sys::signal::SigSet;
use nix::sys::signal::SigmaskHow;
use nix::sys::signal::Signal;
use nix::sys::signalfd::SfdFlags;
use nix::sys::signalfd::SignalFd;

use crate::Result;

pub struct SignalWatch {
    fd: SignalFd,
    mask: SigSet,
}

impl SignalWatch {
    /// Block `signals` for normal delivery and route them through a
    /// signalfd instead.
    pub fn new(signals: &[Signal]) -> Result<Self> {
        let mut mask = SigSet::empty();
        for sig in signals {
            mask.add(*sig);
        }
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)?;
        Ok(Self { fd, mask })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Drain one pending signal, if any.
    pub fn read(&mut self) -> Result<Option<Signal>> {
        match self.fd.read_signal()? {
            Some(info) => {
                let sig = Signal::try_from(info.ssi_signo as i32)
                    .map_err(|_| nix::errno::Errno::EINVAL)?;
                Ok(Some(sig))
            }
            None => Ok(None),
        }
    }

    /// Restore normal delivery of the watched signals. Only used on exit
    /// paths that outlive the watch (e.g. the console restoring state).
    pub fn unblock(&self) -> Result<()> {
        sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&self.mask), None)?;
        Ok(())
    }
}

impl AsFd for SignalWatch {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// SIGPIPE is blocked process-wide: a peer resetting its socket must
/// surface as EPIPE from write, never as a signal.
pub fn block_sigpipe() -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGPIPE);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    use super::*;

    #[test]
    fn delivers_blocked_signal_through_fd() {
        let mut watch = SignalWatch::new(&[Signal::SIGUSR1]).unwrap();
        assert_eq!(watch.read().unwrap(), None);
        kill(Pid::this(), Signal::SIGUSR1).unwrap();
        // The signal is pending on the mask; signalfd must report it.
        let mut got = None;
        for _ in 0..100 {
            if let Some(sig) = watch.read().unwrap() {
                got = Some(sig);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(got, Some(Signal::SIGUSR1));
    }
}
