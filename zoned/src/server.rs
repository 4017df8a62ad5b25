/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The host RPC dispatcher: one poll loop mapping socket events to
//! manager operations. Requests are enum-dispatched through a single
//! match; long-running operations go to the worker pool and answer
//! through its completion channel; proxy replies are relayed by message
//! id.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use nix::sys::epoll::EpollFlags;
use nix::sys::signal::Signal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;
use zoned_api::host as api;
use zoned_api::ErrorCode;
use zoned_api::Void;
use zoned_api::HOST_ID;
use zoned_ipc::client::DEFAULT_CALL_TIMEOUT;
use zoned_ipc::PeerId;
use zoned_ipc::Service;
use zoned_ipc::ServiceEvent;
use zoned_ipc::SignalWatch;
use zoned_rootfs::provision::Declaration;

use crate::manager::ZonesManager;
use crate::policy::ProxyCallPolicy;
use crate::worker::WorkerPool;
use crate::Error;
use crate::Result;

const WORKER_POOL_SIZE: usize = 4;

pub struct Server {
    service: Service,
    manager: Arc<ZonesManager>,
    policy: ProxyCallPolicy,
    pool: WorkerPool,
    shutdown: SignalWatch,
    /// Peers that registered as zone agents (the reserved id `host`
    /// marks a host-side service endpoint).
    agents: HashMap<PeerId, String>,
    agents_by_zone: HashMap<String, PeerId>,
    /// Outgoing proxy call id -> original requester.
    pending_proxies: HashMap<u64, (PeerId, u64)>,
    queue_locked: bool,
    queued: VecDeque<(PeerId, u32, u64, Vec<u8>)>,
    stopping: bool,
}

impl Server {
    pub fn new(manager: Arc<ZonesManager>) -> Result<Self> {
        let service = Service::new(&manager.daemon.socket_path, 64)?;
        let policy = ProxyCallPolicy::new(manager.daemon.proxy_call_rules.clone());
        let pool = WorkerPool::new(WORKER_POOL_SIZE)?;
        service.add_fd(pool.wakeup_fd(), EpollFlags::EPOLLIN)?;
        let shutdown = SignalWatch::new(&[Signal::SIGTERM, Signal::SIGINT])?;
        service.add_fd(std::os::fd::AsFd::as_fd(&shutdown), EpollFlags::EPOLLIN)?;
        Ok(Self {
            service,
            manager,
            policy,
            pool,
            shutdown,
            agents: HashMap::new(),
            agents_by_zone: HashMap::new(),
            pending_proxies: HashMap::new(),
            queue_locked: false,
            queued: VecDeque::new(),
            stopping: false,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        info!("serving on {}", self.manager.daemon.socket_path.display());
        while !self.stopping {
            let events = self.service.poll(None)?;
            for event in events {
                self.handle_event(event);
            }
        }
        info!("shutting down");
        Ok(())
    }

    fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::PeerConnected(peer) => {
                debug!("peer {peer} connected");
            }
            ServiceEvent::PeerDisconnected(peer) => {
                if let Some(zone) = self.agents.remove(&peer) {
                    self.agents_by_zone.remove(&zone);
                    self.service.broadcast(
                        api::SIGNAL_CONNECTION_STATE,
                        &api::ConnectionState {
                            zone,
                            connected: false,
                        },
                    );
                }
                // Fail proxies whose requester disappeared.
                self.pending_proxies.retain(|_, (caller, _)| *caller != peer);
            }
            ServiceEvent::Request {
                peer,
                method,
                id,
                payload,
            } => {
                if self.queue_locked && method != api::METHOD_UNLOCK_QUEUE {
                    self.queued.push_back((peer, method, id, payload));
                    return;
                }
                self.handle_request(peer, method, id, &payload);
            }
            ServiceEvent::Signal { peer, method, .. } => {
                debug!("ignoring signal {method} from {peer}");
            }
            ServiceEvent::Reply { peer, id, result } => {
                self.handle_reply(peer, id, result);
            }
            ServiceEvent::Fd(ready) => {
                if ready.fd == self.pool.wakeup_raw_fd() {
                    for completion in self.pool.drain_completions() {
                        match completion.result {
                            Ok(payload) => {
                                let _ = self.service.reply_raw(
                                    completion.peer,
                                    completion.msg_id,
                                    payload,
                                );
                            }
                            Err(e) => self.reply_err(completion.peer, completion.msg_id, &e),
                        }
                    }
                } else if ready.fd == self.shutdown.raw_fd() {
                    if let Ok(Some(sig)) = self.shutdown.read() {
                        info!("received {sig:?}, stopping");
                        self.stopping = true;
                    }
                }
            }
        }
    }

    fn reply_err(&mut self, peer: PeerId, id: u64, error: &Error) {
        let api_error = error.to_api();
        let _ = self
            .service
            .reply_error(peer, id, api_error.code as i32, &api_error.message);
    }

    fn reply<T: Serialize>(&mut self, peer: PeerId, id: u64, result: Result<T>) {
        match result {
            Ok(value) => {
                let _ = self.service.reply_ok(peer, id, &value);
            }
            Err(e) => self.reply_err(peer, id, &e),
        }
    }

    fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::Ipc(zoned_ipc::Error::Codec(e)))
    }

    /// Offload a manager operation that may take a while; the reply goes
    /// out when the worker finishes.
    fn offload<F>(&mut self, peer: PeerId, id: u64, operation: F)
    where
        F: FnOnce(&ZonesManager) -> Result<()> + Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        let completions = self.pool.completion_sender();
        self.pool.submit(move || {
            let result = operation(&manager).map(|()| Void {});
            completions.complete(peer, id, result);
        });
    }

    fn handle_request(&mut self, peer: PeerId, method: u32, id: u64, payload: &[u8]) {
        match method {
            api::METHOD_LOCK_QUEUE => {
                self.queue_locked = true;
                self.reply(peer, id, Ok(Void {}));
            }
            api::METHOD_UNLOCK_QUEUE => {
                self.queue_locked = false;
                self.reply(peer, id, Ok(Void {}));
                while let Some((peer, method, id, payload)) = self.queued.pop_front() {
                    self.handle_request(peer, method, id, &payload);
                    if self.queue_locked {
                        break;
                    }
                }
            }
            api::METHOD_GET_ZONE_ID_LIST => {
                let ids = self.manager.zone_ids();
                self.reply(peer, id, Ok(api::ZoneIds { ids }));
            }
            api::METHOD_GET_ACTIVE_ZONE_ID => {
                let active = self.manager.active_zone_id();
                self.reply(peer, id, Ok(api::ZoneId { id: active }));
            }
            api::METHOD_GET_ZONE_INFO => {
                let result = Self::parse::<api::ZoneId>(payload)
                    .and_then(|request| self.manager.zone_info(&request.id));
                self.reply(peer, id, result);
            }
            api::METHOD_CREATE_ZONE => match Self::parse::<api::CreateZone>(payload) {
                Ok(request) => self.offload(peer, id, move |manager| {
                    manager.create_zone(&request.id, &request.template_name)
                }),
                Err(e) => self.reply_err(peer, id, &e),
            },
            api::METHOD_DESTROY_ZONE => match Self::parse::<api::ZoneId>(payload) {
                Ok(request) => self.offload(peer, id, move |manager| {
                    manager.destroy_zone_blocking(&request.id)
                }),
                Err(e) => self.reply_err(peer, id, &e),
            },
            api::METHOD_START_ZONE => match Self::parse::<api::ZoneId>(payload) {
                Ok(request) => self.offload(peer, id, move |manager| {
                    manager.start_zone_blocking(&request.id)
                }),
                Err(e) => self.reply_err(peer, id, &e),
            },
            api::METHOD_SHUTDOWN_ZONE => match Self::parse::<api::ZoneId>(payload) {
                Ok(request) => self.offload(peer, id, move |manager| {
                    manager.stop_zone_blocking(&request.id)
                }),
                Err(e) => self.reply_err(peer, id, &e),
            },
            api::METHOD_LOCK_ZONE => {
                let result = Self::parse::<api::ZoneId>(payload)
                    .and_then(|request| self.manager.lock_zone(&request.id))
                    .map(|()| Void {});
                self.reply(peer, id, result);
            }
            api::METHOD_UNLOCK_ZONE => {
                let result = Self::parse::<api::ZoneId>(payload)
                    .and_then(|request| self.manager.unlock_zone(&request.id))
                    .map(|()| Void {});
                self.reply(peer, id, result);
            }
            api::METHOD_SET_ACTIVE_ZONE => {
                let result = Self::parse::<api::ZoneId>(payload)
                    .and_then(|request| self.manager.set_active_zone(&request.id))
                    .map(|()| Void {});
                self.reply(peer, id, result);
            }
            api::METHOD_SWITCH_TO_DEFAULT => {
                let result = self.manager.switch_to_default().map(|()| Void {});
                self.reply(peer, id, result);
            }
            api::METHOD_GRANT_DEVICE => {
                let result = Self::parse::<api::GrantDevice>(payload).and_then(|request| {
                    self.manager
                        .grant_device(&request.zone, &request.device, request.flags)
                });
                self.reply(peer, id, result.map(|()| Void {}));
            }
            api::METHOD_REVOKE_DEVICE => {
                let result = Self::parse::<api::RevokeDevice>(payload).and_then(|request| {
                    self.manager.revoke_device(&request.zone, &request.device)
                });
                self.reply(peer, id, result.map(|()| Void {}));
            }
            api::METHOD_DECLARE_FILE => {
                let result = Self::parse::<api::DeclareFile>(payload).and_then(|request| {
                    self.manager.declare(
                        &request.zone,
                        Declaration::File {
                            path: request.path.into(),
                            flags: request.flags,
                            mode: request.mode,
                        },
                    )
                });
                self.reply(peer, id, result.map(|id| api::DeclarationId { id }));
            }
            api::METHOD_DECLARE_MOUNT => {
                let result = Self::parse::<api::DeclareMount>(payload).and_then(|request| {
                    self.manager.declare(
                        &request.zone,
                        Declaration::Mount {
                            source: request.source.into(),
                            target: request.target.into(),
                            fs_type: request.fs_type,
                            flags: request.flags,
                            data: request.data,
                        },
                    )
                });
                self.reply(peer, id, result.map(|id| api::DeclarationId { id }));
            }
            api::METHOD_DECLARE_LINK => {
                let result = Self::parse::<api::DeclareLink>(payload).and_then(|request| {
                    self.manager.declare(
                        &request.zone,
                        Declaration::Link {
                            source: request.source.into(),
                            target: request.target.into(),
                        },
                    )
                });
                self.reply(peer, id, result.map(|id| api::DeclarationId { id }));
            }
            api::METHOD_GET_DECLARATIONS => {
                let result = Self::parse::<api::ZoneId>(payload)
                    .and_then(|request| self.manager.declarations(&request.id));
                self.reply(peer, id, result.map(|ids| api::Declarations { ids }));
            }
            api::METHOD_REMOVE_DECLARATION => {
                let result = Self::parse::<api::RemoveDeclaration>(payload).and_then(|request| {
                    self.manager
                        .remove_declaration(&request.zone, &request.declaration)
                });
                self.reply(peer, id, result.map(|()| Void {}));
            }
            api::METHOD_CREATE_FILE => {
                let result = Self::parse::<api::CreateFile>(payload).and_then(|request| {
                    self.manager
                        .create_file(&request.zone, &request.path, request.flags, request.mode)
                });
                match result {
                    Ok((fd, handle)) => {
                        self.reply(peer, id, Ok(handle));
                        use std::os::fd::AsFd;
                        if let Err(e) = self.service.send_fd(peer, fd.as_fd()) {
                            warn!("cannot pass created descriptor: {e}");
                        }
                        // The zone-side copy travelled; ours closes here.
                        drop(fd);
                    }
                    Err(e) => self.reply_err(peer, id, &e),
                }
            }
            api::METHOD_CREATE_NETDEV_VETH => {
                let result = Self::parse::<api::CreateNetdevVeth>(payload).and_then(|request| {
                    let init_pid = self.manager.init_pid(&request.zone)?;
                    crate::netdev::create_veth(init_pid, &request.zone_dev, &request.host_dev)
                });
                self.reply(peer, id, result.map(|()| Void {}));
            }
            api::METHOD_CREATE_NETDEV_MACVLAN => {
                let result = Self::parse::<api::CreateNetdevMacvlan>(payload).and_then(|request| {
                    let init_pid = self.manager.init_pid(&request.zone)?;
                    crate::netdev::create_macvlan(
                        init_pid,
                        &request.zone_dev,
                        &request.host_dev,
                        request.mode,
                    )
                });
                self.reply(peer, id, result.map(|()| Void {}));
            }
            api::METHOD_CREATE_NETDEV_PHYS => {
                let result = Self::parse::<api::CreateNetdevPhys>(payload).and_then(|request| {
                    let init_pid = self.manager.init_pid(&request.zone)?;
                    crate::netdev::move_phys(init_pid, &request.dev)
                });
                self.reply(peer, id, result.map(|()| Void {}));
            }
            api::METHOD_GET_NETDEV_LIST => {
                let result = Self::parse::<api::ZoneId>(payload).and_then(|request| {
                    let init_pid = self.manager.init_pid(&request.id)?;
                    crate::netdev::list(init_pid)
                });
                self.reply(peer, id, result.map(|devs| api::NetdevList { devs }));
            }
            api::METHOD_GET_NETDEV_ATTRS => {
                let result = Self::parse::<api::NetdevRef>(payload).and_then(|request| {
                    let init_pid = self.manager.init_pid(&request.zone)?;
                    crate::netdev::get_attrs(init_pid, &request.dev)
                });
                self.reply(peer, id, result.map(|attrs| api::NetdevAttrs { attrs }));
            }
            api::METHOD_SET_NETDEV_ATTRS => {
                let result = Self::parse::<api::SetNetdevAttrs>(payload).and_then(|request| {
                    let init_pid = self.manager.init_pid(&request.zone)?;
                    crate::netdev::set_attrs(init_pid, &request.dev, request.attrs)
                });
                self.reply(peer, id, result.map(|()| Void {}));
            }
            api::METHOD_DESTROY_NETDEV => {
                let result = Self::parse::<api::NetdevRef>(payload).and_then(|request| {
                    let init_pid = self.manager.init_pid(&request.zone)?;
                    crate::netdev::destroy(init_pid, &request.dev)
                });
                self.reply(peer, id, result.map(|()| Void {}));
            }
            api::METHOD_DELETE_NETDEV_IP_ADDRESS => {
                let result = Self::parse::<api::NetdevRef>(payload).and_then(|request| {
                    let init_pid = self.manager.init_pid(&request.zone)?;
                    crate::netdev::delete_ip_addresses(init_pid, &request.dev)
                });
                self.reply(peer, id, result.map(|()| Void {}));
            }
            api::METHOD_REGISTER_ZONE_AGENT => {
                match Self::parse::<api::RegisterZoneAgent>(payload) {
                    Ok(request) => self.register_agent(peer, id, request.zone),
                    Err(e) => self.reply_err(peer, id, &e),
                }
            }
            api::METHOD_NOTIFY_ACTIVE_ZONE => {
                match Self::parse::<api::NotifyActiveZone>(payload) {
                    Ok(request) => self.notify_active_zone(peer, id, request),
                    Err(e) => self.reply_err(peer, id, &e),
                }
            }
            api::METHOD_FILE_MOVE_REQUEST => {
                match Self::parse::<api::FileMoveRequest>(payload) {
                    Ok(request) => self.file_move(peer, id, request),
                    Err(e) => self.reply_err(peer, id, &e),
                }
            }
            api::METHOD_PROXY_CALL => match Self::parse::<api::ProxyCall>(payload) {
                Ok(request) => self.proxy_call(peer, id, request),
                Err(e) => self.reply_err(peer, id, &e),
            },
            other => {
                warn!("unknown host method {other} from {peer}");
                let _ = self.service.reply_error(
                    peer,
                    id,
                    ErrorCode::Internal as i32,
                    "unknown method",
                );
            }
        }
    }

    fn register_agent(&mut self, peer: PeerId, id: u64, zone: String) {
        // The reserved host id marks a host-side service endpoint; any
        // other name must be a known zone.
        if zone != HOST_ID {
            if let Err(e) = self.manager.zone_info(&zone) {
                self.reply_err(peer, id, &e);
                return;
            }
        }
        info!("peer {peer} registered as agent for {zone}");
        self.agents.insert(peer, zone.clone());
        self.agents_by_zone.insert(zone.clone(), peer);
        self.reply(peer, id, Ok(Void {}));
        self.service.broadcast(
            api::SIGNAL_CONNECTION_STATE,
            &api::ConnectionState {
                zone,
                connected: true,
            },
        );
    }

    /// The caller identity used for policy decisions: the registered
    /// agent zone, or `host` for unregistered (host-side) peers.
    fn caller_id(&self, peer: PeerId) -> String {
        self.agents
            .get(&peer)
            .cloned()
            .unwrap_or_else(|| HOST_ID.to_string())
    }

    fn notify_active_zone(&mut self, peer: PeerId, id: u64, request: api::NotifyActiveZone) {
        let caller = match self.agents.get(&peer) {
            Some(zone) if zone != HOST_ID => zone.clone(),
            _ => {
                self.reply_err(
                    peer,
                    id,
                    &Error::Forbidden("only zone agents may notify".to_string()),
                );
                return;
            }
        };
        if let Some(target) = self.manager.route_notification(&caller) {
            self.signal_zone(
                &target,
                api::SIGNAL_NOTIFICATION,
                &api::Notification {
                    zone: caller,
                    application: request.application,
                    message: request.message,
                },
            );
        }
        self.reply(peer, id, Ok(Void {}));
    }

    fn file_move(&mut self, peer: PeerId, id: u64, request: api::FileMoveRequest) {
        // Agents can only move their own files.
        let source = match self.agents.get(&peer) {
            Some(zone) if zone != HOST_ID => zone.clone(),
            _ => request.source.clone(),
        };
        let (status, notification) =
            self.manager
                .file_move(&source, &request.destination, &request.path);
        if let Some(notification) = notification {
            self.signal_zone(&request.destination, api::SIGNAL_NOTIFICATION, &notification);
        }
        self.reply(peer, id, Ok(api::FileMoveResult { status }));
    }

    fn signal_zone<T: Serialize>(&mut self, zone: &str, method: u32, value: &T) {
        if let Some(agent) = self.agents_by_zone.get(zone).copied() {
            if let Err(e) = self.service.signal(agent, method, value) {
                warn!("cannot signal agent of {zone}: {e}");
            }
        } else {
            debug!("no agent connected for {zone}; signal {method} dropped");
        }
    }

    fn proxy_call(&mut self, peer: PeerId, id: u64, mut request: api::ProxyCall) {
        // The transport knows who is calling; never trust the payload.
        request.caller = self.caller_id(peer);

        if !self.policy.is_allowed(
            &request.caller,
            &request.target,
            &request.target_bus_name,
            &request.target_object_path,
            &request.target_interface,
            &request.target_method,
        ) {
            warn!(
                "forbidden proxy call; {} -> {}; {}; {}; {}; {}",
                request.caller,
                request.target,
                request.target_bus_name,
                request.target_object_path,
                request.target_interface,
                request.target_method
            );
            self.reply_err(
                peer,
                id,
                &Error::Forbidden("proxy call forbidden".to_string()),
            );
            return;
        }

        // Host targets dispatch to the host-side service endpoint; zone
        // targets require a running zone with its guard connected.
        if request.target != HOST_ID {
            if let Err(e) = self.manager.proxy_target_ready(&request.target) {
                self.reply_err(peer, id, &e);
                return;
            }
        }
        let Some(agent) = self.agents_by_zone.get(&request.target).copied() else {
            self.reply_err(
                peer,
                id,
                &Error::Ipc(zoned_ipc::Error::Disconnected),
            );
            return;
        };

        match self.service.call(
            agent,
            api::METHOD_PROXY_CALL,
            &request,
            Some(DEFAULT_CALL_TIMEOUT),
        ) {
            Ok(out_id) => {
                self.pending_proxies.insert(out_id, (peer, id));
            }
            Err(e) => self.reply_err(peer, id, &Error::Ipc(e)),
        }
    }

    fn handle_reply(&mut self, peer: PeerId, id: u64, result: zoned_ipc::Result<Vec<u8>>) {
        let Some((caller, caller_msg)) = self.pending_proxies.remove(&id) else {
            debug!("unsolicited reply {id} from {peer}");
            return;
        };
        match result {
            Ok(payload) => {
                let _ = self.service.reply_raw(caller, caller_msg, payload);
            }
            Err(zoned_ipc::Error::Remote { message, .. }) => {
                // The destination answered with an error; preserve its
                // message under the Forwarded code.
                let _ = self.service.reply_error(
                    caller,
                    caller_msg,
                    ErrorCode::Forwarded as i32,
                    &message,
                );
            }
            Err(e) => {
                let _ = self.service.reply_error(
                    caller,
                    caller_msg,
                    ErrorCode::Io as i32,
                    &e.to_string(),
                );
            }
        }
    }
}
