/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The connecting side of an RPC endpoint. Calls are blocking with a
//! per-call timeout; frames that are not the awaited reply (calls and
//! signals initiated by the remote side) are queued and can be drained
//! with [Client::next_incoming].

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::wire;
use crate::wire::Frame;
use crate::wire::SignalSet;
use crate::wire::WireError;
use crate::Error;
use crate::Result;

/// Default per-call timeout; lifecycle operations that must run to
/// completion pass `None` instead.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Client {
    stream: UnixStream,
    next_msg_id: u64,
    /// Remote-initiated frames observed while waiting for a reply.
    inbox: VecDeque<Frame>,
}

impl Client {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref())?;
        Ok(Self {
            stream,
            next_msg_id: 1,
            inbox: VecDeque::new(),
        })
    }

    /// Connect, retrying until the socket appears or the deadline passes.
    /// Used against freshly spawned guards whose listener may not be
    /// bound yet.
    pub fn connect_with_retry(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::connect(path.as_ref()) {
                Ok(client) => return Ok(client),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Call `method` and block for its reply. `timeout` of `None` waits
    /// forever.
    pub fn call<Req: Serialize, Rep: DeserializeOwned>(
        &mut self,
        method: u32,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Rep> {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        let frame = Frame::new(method, id, request)?;
        wire::write_frame(&self.stream, &frame)?;

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let frame = self.read_frame_deadline(deadline)?;
            match frame.method {
                wire::RETURN_METHOD_ID if frame.id == id => return frame.parse(),
                wire::ERROR_METHOD_ID if frame.id == id => {
                    let err: WireError = frame.parse()?;
                    return Err(Error::Remote {
                        code: err.code,
                        message: err.message,
                    });
                }
                wire::RETURN_METHOD_ID | wire::ERROR_METHOD_ID => {
                    debug!("dropping reply for stale message id {}", frame.id);
                }
                _ => self.inbox.push_back(frame),
            }
        }
    }

    /// Announce the signal methods this endpoint will emit.
    pub fn register_signals(&mut self, methods: &[u32]) -> Result<()> {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        let frame = Frame::new(
            wire::REGISTER_SIGNAL_METHOD_ID,
            id,
            &SignalSet {
                methods: methods.to_vec(),
            },
        )?;
        wire::write_frame(&self.stream, &frame)?;
        Ok(())
    }

    /// Emit a signal; no reply is expected.
    pub fn signal<T: Serialize>(&mut self, method: u32, value: &T) -> Result<()> {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        let frame = Frame::new(method, id, value)?;
        wire::write_frame(&self.stream, &frame)?;
        Ok(())
    }

    /// Next remote-initiated frame (call or signal), waiting up to
    /// `timeout`.
    pub fn next_incoming(&mut self, timeout: Option<Duration>) -> Result<Frame> {
        if let Some(frame) = self.inbox.pop_front() {
            return Ok(frame);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let frame = self.read_frame_deadline(deadline)?;
            match frame.method {
                wire::RETURN_METHOD_ID | wire::ERROR_METHOD_ID => {
                    debug!("dropping reply for stale message id {}", frame.id);
                }
                _ => return Ok(frame),
            }
        }
    }

    /// Wait for a specific remote-initiated method, replying to nothing.
    pub fn wait_incoming(&mut self, method: u32, timeout: Option<Duration>) -> Result<Frame> {
        let deadline = timeout.map(|t| Instant::now() + t);
        // Check queued frames first.
        if let Some(pos) = self.inbox.iter().position(|f| f.method == method) {
            return Ok(self.inbox.remove(pos).expect("position just found"));
        }
        loop {
            let frame = self.read_frame_deadline(deadline)?;
            match frame.method {
                wire::RETURN_METHOD_ID | wire::ERROR_METHOD_ID => {
                    debug!("dropping reply for stale message id {}", frame.id);
                }
                m if m == method => return Ok(frame),
                _ => self.inbox.push_back(frame),
            }
        }
    }

    /// Answer a remote-initiated call.
    pub fn reply_ok<T: Serialize>(&mut self, id: u64, value: &T) -> Result<()> {
        let frame = Frame::new(wire::RETURN_METHOD_ID, id, value)?;
        wire::write_frame(&self.stream, &frame)?;
        Ok(())
    }

    pub fn reply_error(&mut self, id: u64, code: i32, message: &str) -> Result<()> {
        let frame = Frame::new(
            wire::ERROR_METHOD_ID,
            id,
            &WireError {
                code,
                message: message.to_string(),
            },
        )?;
        wire::write_frame(&self.stream, &frame)?;
        Ok(())
    }

    /// Receive a descriptor sent out of band by the service.
    pub fn recv_fd(&mut self) -> Result<std::os::fd::OwnedFd> {
        crate::fdpass::recv_fd(self.stream.as_fd())
    }

    fn read_frame_deadline(&mut self, deadline: Option<Instant>) -> Result<Frame> {
        loop {
            let timeout = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::Timeout);
                    }
                    PollTimeout::try_from(d - now).unwrap_or(PollTimeout::MAX)
                }
                None => PollTimeout::NONE,
            };
            let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Err(Error::Timeout),
                Ok(_) => return wire::read_frame(&self.stream),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        self.stream.as_raw_fd()
    }
}
