/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The accepting side of an RPC endpoint: one listening unix socket, a
//! bounded set of peers, request dispatch as plain values. The owner
//! drives [Service::poll] from its main loop and matches on the returned
//! events; no callback table is registered anywhere.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use nix::sys::epoll::EpollFlags;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::event::EventLoop;
use crate::event::Ready;
use crate::wire;
use crate::wire::Frame;
use crate::wire::SignalSet;
use crate::wire::WireError;
use crate::Error;
use crate::Result;

/// Opaque identity of a connected peer, stable for the lifetime of the
/// connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub enum ServiceEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// An application-level request from a peer; answer it with
    /// [Service::reply_ok] or [Service::reply_error], now or later.
    Request {
        peer: PeerId,
        method: u32,
        id: u64,
        payload: Vec<u8>,
    },
    /// A broadcast-style message matching the peer's registered signal
    /// set; no reply expected.
    Signal {
        peer: PeerId,
        method: u32,
        payload: Vec<u8>,
    },
    /// Completion of an outgoing [Service::call].
    Reply {
        peer: PeerId,
        id: u64,
        result: Result<Vec<u8>>,
    },
    /// Readiness of an externally registered descriptor
    /// (see [Service::add_fd]).
    Fd(Ready),
}

struct Peer {
    id: PeerId,
    stream: UnixStream,
    /// Signal methods this peer announced it will emit.
    emits: Vec<u32>,
}

struct PendingCall {
    peer: PeerId,
    deadline: Option<Instant>,
}

pub struct Service {
    event_loop: EventLoop,
    listener: UnixListener,
    socket_path: PathBuf,
    max_peers: usize,
    peers: HashMap<RawFd, Peer>,
    by_id: HashMap<PeerId, RawFd>,
    pending: HashMap<u64, PendingCall>,
    next_msg_id: u64,
}

impl Service {
    /// Bind and listen on `path`. A stale socket file from a previous
    /// incarnation is removed first.
    pub fn new(path: impl AsRef<Path>, max_peers: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed stale socket {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        let event_loop = EventLoop::new()?;
        event_loop.add(listener.as_fd(), EpollFlags::EPOLLIN)?;
        info!("listening on {}", path.display());
        Ok(Self {
            event_loop,
            listener,
            socket_path: path.to_path_buf(),
            max_peers,
            peers: HashMap::new(),
            by_id: HashMap::new(),
            pending: HashMap::new(),
            next_msg_id: 1,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.by_id.keys().copied().collect()
    }

    pub fn has_peer(&self, peer: PeerId) -> bool {
        self.by_id.contains_key(&peer)
    }

    /// Register an additional descriptor (e.g. a signalfd) with the
    /// service's event loop; readiness is reported as [ServiceEvent::Fd].
    pub fn add_fd(&self, fd: BorrowedFd, events: EpollFlags) -> Result<()> {
        self.event_loop.add(fd, events)
    }

    /// Wait up to `timeout_ms` (`None` blocks) and return everything that
    /// happened. Requests from one peer are returned in arrival order.
    pub fn poll(&mut self, timeout_ms: Option<u16>) -> Result<Vec<ServiceEvent>> {
        let ready = self.event_loop.wait(timeout_ms)?;
        let mut events = VecDeque::new();
        for r in ready {
            if r.fd == self.listener.as_raw_fd() {
                self.accept_pending(&mut events)?;
            } else if self.peers.contains_key(&r.fd) {
                self.service_peer(r, &mut events);
            } else {
                events.push_back(ServiceEvent::Fd(r));
            }
        }
        self.expire_calls(&mut events);
        Ok(events.into())
    }

    fn accept_pending(&mut self, events: &mut VecDeque<ServiceEvent>) -> Result<()> {
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if self.peers.len() >= self.max_peers {
                warn!(
                    "refusing peer on {}: {} already connected",
                    self.socket_path.display(),
                    self.peers.len()
                );
                drop(stream);
                continue;
            }
            let id = PeerId(Uuid::new_v4());
            let fd = stream.as_raw_fd();
            self.event_loop.add(stream.as_fd(), EpollFlags::EPOLLIN)?;
            self.peers.insert(
                fd,
                Peer {
                    id,
                    stream,
                    emits: Vec::new(),
                },
            );
            self.by_id.insert(id, fd);
            debug!("peer {id} connected");
            events.push_back(ServiceEvent::PeerConnected(id));
        }
    }

    fn service_peer(&mut self, ready: Ready, events: &mut VecDeque<ServiceEvent>) {
        if ready.readable() {
            let frame = {
                let peer = self.peers.get(&ready.fd).expect("peer checked by caller");
                wire::read_frame(&peer.stream)
            };
            match frame {
                Ok(frame) => {
                    self.route_frame(ready.fd, frame, events);
                    return;
                }
                Err(Error::Disconnected) => {}
                Err(e) => {
                    let peer = self.peers.get(&ready.fd).expect("peer checked by caller");
                    warn!("naughty peer {}: {}", peer.id, e);
                }
            }
            self.drop_peer(ready.fd, events);
        } else if ready.closed() {
            self.drop_peer(ready.fd, events);
        }
    }

    fn route_frame(&mut self, fd: RawFd, frame: Frame, events: &mut VecDeque<ServiceEvent>) {
        let peer_id = self.peers.get(&fd).expect("routed for live peer").id;
        // A reply only counts when it comes from the peer the call went
        // to; anything else is noise.
        let pending_here = |pending: &HashMap<u64, PendingCall>| {
            pending
                .get(&frame.id)
                .is_some_and(|call| call.peer == peer_id)
        };
        match frame.method {
            wire::RETURN_METHOD_ID if pending_here(&self.pending) => {
                self.pending.remove(&frame.id);
                events.push_back(ServiceEvent::Reply {
                    peer: peer_id,
                    id: frame.id,
                    result: Ok(frame.payload),
                });
            }
            wire::ERROR_METHOD_ID if pending_here(&self.pending) => {
                self.pending.remove(&frame.id);
                let err = match serde_json::from_slice::<WireError>(&frame.payload) {
                    Ok(e) => Error::Remote {
                        code: e.code,
                        message: e.message,
                    },
                    Err(e) => Error::Codec(e),
                };
                events.push_back(ServiceEvent::Reply {
                    peer: peer_id,
                    id: frame.id,
                    result: Err(err),
                });
            }
            wire::RETURN_METHOD_ID | wire::ERROR_METHOD_ID => {
                warn!("peer {peer_id} answered unknown message id {}", frame.id);
            }
            wire::REGISTER_SIGNAL_METHOD_ID => {
                match serde_json::from_slice::<SignalSet>(&frame.payload) {
                    Ok(set) => {
                        debug!("peer {peer_id} registered signals {:?}", set.methods);
                        let peer = self.peers.get_mut(&fd).expect("routed for live peer");
                        peer.emits.extend(set.methods);
                    }
                    Err(e) => {
                        warn!("naughty peer {peer_id}: bad signal registration: {e}");
                        self.drop_peer(fd, events);
                    }
                }
            }
            method => {
                let peer = self.peers.get(&fd).expect("routed for live peer");
                if peer.emits.contains(&method) {
                    events.push_back(ServiceEvent::Signal {
                        peer: peer_id,
                        method,
                        payload: frame.payload,
                    });
                } else {
                    events.push_back(ServiceEvent::Request {
                        peer: peer_id,
                        method,
                        id: frame.id,
                        payload: frame.payload,
                    });
                }
            }
        }
    }

    fn drop_peer(&mut self, fd: RawFd, events: &mut VecDeque<ServiceEvent>) {
        if let Some(peer) = self.peers.remove(&fd) {
            let _ = self.event_loop.remove(peer.stream.as_fd());
            self.by_id.remove(&peer.id);
            // Fail every call still in flight toward this peer.
            let dead: Vec<u64> = self
                .pending
                .iter()
                .filter(|(_, call)| call.peer == peer.id)
                .map(|(id, _)| *id)
                .collect();
            for id in dead {
                self.pending.remove(&id);
                events.push_back(ServiceEvent::Reply {
                    peer: peer.id,
                    id,
                    result: Err(Error::Disconnected),
                });
            }
            debug!("peer {} disconnected", peer.id);
            events.push_back(ServiceEvent::PeerDisconnected(peer.id));
        }
    }

    /// Disconnect a peer from the application layer (policy violation,
    /// shutdown). Queued events for it are delivered on the next poll.
    pub fn disconnect(&mut self, peer: PeerId) {
        if let Some(fd) = self.by_id.get(&peer).copied() {
            let mut events = VecDeque::new();
            self.drop_peer(fd, &mut events);
        }
    }

    fn expire_calls(&mut self, events: &mut VecDeque<ServiceEvent>) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, call)| call.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let call = self.pending.remove(&id).expect("id collected above");
            events.push_back(ServiceEvent::Reply {
                peer: call.peer,
                id,
                result: Err(Error::Timeout),
            });
        }
    }

    fn write_to(&mut self, peer: PeerId, frame: &Frame) -> Result<()> {
        let fd = *self.by_id.get(&peer).ok_or(Error::Disconnected)?;
        let stream = &self.peers.get(&fd).expect("by_id is consistent").stream;
        match wire::write_frame(stream, frame) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("write to peer {peer} failed: {e}");
                let mut events = VecDeque::new();
                self.drop_peer(fd, &mut events);
                Err(Error::Disconnected)
            }
        }
    }

    pub fn reply_ok<T: Serialize>(&mut self, peer: PeerId, id: u64, value: &T) -> Result<()> {
        let frame = Frame::new(wire::RETURN_METHOD_ID, id, value)?;
        self.write_to(peer, &frame)
    }

    /// Reply with an already-serialized payload; used when relaying a
    /// remote result without reinterpreting it.
    pub fn reply_raw(&mut self, peer: PeerId, id: u64, payload: Vec<u8>) -> Result<()> {
        let frame = Frame {
            method: wire::RETURN_METHOD_ID,
            id,
            payload,
        };
        self.write_to(peer, &frame)
    }

    pub fn reply_error(&mut self, peer: PeerId, id: u64, code: i32, message: &str) -> Result<()> {
        let frame = Frame::new(
            wire::ERROR_METHOD_ID,
            id,
            &WireError {
                code,
                message: message.to_string(),
            },
        )?;
        self.write_to(peer, &frame)
    }

    /// Issue an asynchronous call toward a peer. The reply (or timeout)
    /// arrives later as [ServiceEvent::Reply] under the returned id.
    pub fn call<T: Serialize>(
        &mut self,
        peer: PeerId,
        method: u32,
        value: &T,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        let frame = Frame::new(method, id, value)?;
        self.write_to(peer, &frame)?;
        self.pending.insert(
            id,
            PendingCall {
                peer,
                deadline: timeout.map(|t| Instant::now() + t),
            },
        );
        Ok(id)
    }

    /// Emit a signal toward one peer; no reply is tracked.
    pub fn signal<T: Serialize>(&mut self, peer: PeerId, method: u32, value: &T) -> Result<()> {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        let frame = Frame::new(method, id, value)?;
        self.write_to(peer, &frame)
    }

    /// Emit a signal toward every connected peer.
    pub fn broadcast<T: Serialize>(&mut self, method: u32, value: &T) {
        for peer in self.peer_ids() {
            if let Err(e) = self.signal(peer, method, value) {
                debug!("broadcast to {peer} failed: {e}");
            }
        }
    }

    /// Dup-and-send a descriptor to a peer, out of band relative to the
    /// frame stream.
    pub fn send_fd(&mut self, peer: PeerId, fd: BorrowedFd) -> Result<()> {
        let peer_fd = *self.by_id.get(&peer).ok_or(Error::Disconnected)?;
        let stream = &self.peers.get(&peer_fd).expect("by_id is consistent").stream;
        crate::fdpass::send_fd(stream.as_fd(), fd)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;

    fn sock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("svc.socket")
    }

    #[test]
    fn accepts_and_answers_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = Service::new(sock_path(&dir), 8).unwrap();
        let path = service.socket_path().to_path_buf();

        let handle = std::thread::spawn(move || {
            let mut client = Client::connect(&path).unwrap();
            let reply: serde_json::Value = client
                .call(7, &serde_json::json!({"ping": true}), None)
                .unwrap();
            reply
        });

        let mut answered = false;
        while !answered {
            for ev in service.poll(Some(1000)).unwrap() {
                if let ServiceEvent::Request {
                    peer, method, id, ..
                } = ev
                {
                    assert_eq!(method, 7);
                    service
                        .reply_ok(peer, id, &serde_json::json!({"pong": true}))
                        .unwrap();
                    answered = true;
                }
            }
        }
        assert_eq!(handle.join().unwrap(), serde_json::json!({"pong": true}));
    }

    #[test]
    fn refuses_peers_beyond_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = Service::new(sock_path(&dir), 1).unwrap();
        let path = service.socket_path().to_path_buf();

        let _first = UnixStream::connect(&path).unwrap();
        let second = UnixStream::connect(&path).unwrap();
        // Drain the accept queue; the second connection must be declined.
        for _ in 0..10 {
            service.poll(Some(10)).unwrap();
        }
        assert_eq!(service.peer_count(), 1);
        // The refused stream observes EOF.
        second.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        use std::io::Read;
        let got = (&second).read(&mut buf);
        assert!(matches!(got, Ok(0)), "expected EOF, got {got:?}");
    }

    #[test]
    fn malformed_frame_drops_peer() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = Service::new(sock_path(&dir), 8).unwrap();
        let path = service.socket_path().to_path_buf();

        let stream = UnixStream::connect(&path).unwrap();
        use std::io::Write;
        (&stream)
            .write_all(&(wire::MAX_FRAME_LEN + 1).to_le_bytes())
            .unwrap();

        let mut disconnected = false;
        for _ in 0..10 {
            for ev in service.poll(Some(100)).unwrap() {
                if matches!(ev, ServiceEvent::PeerDisconnected(_)) {
                    disconnected = true;
                }
            }
            if disconnected {
                break;
            }
        }
        assert!(disconnected);
        assert_eq!(service.peer_count(), 0);
    }

    #[test]
    fn outgoing_call_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = Service::new(sock_path(&dir), 8).unwrap();
        let path = service.socket_path().to_path_buf();

        let _silent = UnixStream::connect(&path).unwrap();
        let mut peer = None;
        while peer.is_none() {
            for ev in service.poll(Some(1000)).unwrap() {
                if let ServiceEvent::PeerConnected(id) = ev {
                    peer = Some(id);
                }
            }
        }
        let id = service
            .call(
                peer.unwrap(),
                9,
                &serde_json::json!({}),
                Some(Duration::from_millis(20)),
            )
            .unwrap();

        let mut timed_out = false;
        for _ in 0..20 {
            for ev in service.poll(Some(50)).unwrap() {
                if let ServiceEvent::Reply {
                    id: got,
                    result: Err(Error::Timeout),
                    ..
                } = ev
                {
                    assert_eq!(got, id);
                    timed_out = true;
                }
            }
            if timed_out {
                break;
            }
        }
        assert!(timed_out);
    }
}
