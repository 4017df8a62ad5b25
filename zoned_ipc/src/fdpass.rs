/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Descriptor transfer over unix sockets. The sender dup-and-sends via
//! SCM_RIGHTS and closes its copy; exactly one descriptor per message,
//! accompanied by a single marker byte so the receiver has something to
//! poll on.

use std::io::IoSlice;
use std::io::IoSliceMut;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

use nix::sys::socket::recvmsg;
use nix::sys::socket::sendmsg;
use nix::sys::socket::ControlMessage;
use nix::sys::socket::ControlMessageOwned;
use nix::sys::socket::MsgFlags;

use crate::Error;
use crate::Result;

const MARKER: [u8; 1] = [0xfd];

pub fn send_fd(sock: BorrowedFd, fd: BorrowedFd) -> Result<()> {
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&MARKER)];
    sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
    Ok(())
}

pub fn recv_fd(sock: BorrowedFd) -> Result<OwnedFd> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut cmsg_buf = nix::cmsg_space!([std::os::fd::RawFd; 1]);
    let msg = recvmsg::<()>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )?;
    if msg.bytes == 0 {
        return Err(Error::Disconnected);
    }
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.first() {
                // Safety: the kernel installed a fresh descriptor for us.
                return Ok(unsafe { OwnedFd::from_raw_fd(*fd) });
            }
        }
    }
    Err(Error::Malformed(
        "expected SCM_RIGHTS control message".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::io::Seek;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn descriptor_travels_across_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"hello").unwrap();
        tmp.rewind().unwrap();

        send_fd(a.as_fd(), tmp.as_fd()).unwrap();
        let received = recv_fd(b.as_fd()).unwrap();

        let mut file = File::from(received);
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
    }
}
