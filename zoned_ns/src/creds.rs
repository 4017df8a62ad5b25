/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Credential switching. All of these are single syscalls and safe to use
//! on post-fork paths.

use nix::errno::Errno;
use nix::unistd::Gid;
use nix::unistd::Pid;
use nix::unistd::Uid;

use crate::Error;
use crate::Result;

pub fn setregid(rgid: Gid, egid: Gid) -> Result<()> {
    let ret = unsafe { libc::setregid(rgid.as_raw(), egid.as_raw()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::Credentials {
            call: "setregid",
            errno: Errno::last(),
        })
    }
}

pub fn setreuid(ruid: Uid, euid: Uid) -> Result<()> {
    let ret = unsafe { libc::setreuid(ruid.as_raw(), euid.as_raw()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::Credentials {
            call: "setreuid",
            errno: Errno::last(),
        })
    }
}

pub fn setgroups(gids: &[Gid]) -> Result<()> {
    nix::unistd::setgroups(gids).map_err(|errno| Error::Credentials {
        call: "setgroups",
        errno,
    })
}

pub fn setsid() -> Result<Pid> {
    nix::unistd::setsid().map_err(|errno| Error::Credentials {
        call: "setsid",
        errno,
    })
}
