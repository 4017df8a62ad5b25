/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The guard process proper: a single-peer RPC server around the zone's
//! lifecycle. The supervisor connects, pushes the config, and drives
//! start/stop; SIGCHLD arrives through the signalfd and completes the
//! pending stop reply when the init is reaped.

use std::ffi::CString;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use zoned_api::guard as api;
use zoned_api::ErrorCode;
use zoned_api::Void;
use zoned_ipc::PeerId;
use zoned_ipc::Service;
use zoned_ipc::ServiceEvent;
use zoned_ipc::SignalWatch;
use zoned_ns::proc;
use zoned_ns::NsKind;
use zoned_ns::NsSet;
use zoned_pty::Pty;
use zoned_pty::TerminalsConfig;
use zoned_rootfs::devfs::DevFs;
use zoned_rootfs::mount;
use zoned_rootfs::MsFlags;

use crate::config::ContainerConfig;
use crate::start;
use crate::start::Barrier;
use crate::start::InitPlan;
use crate::Error;
use crate::Result;

const GUARD_READY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Guard {
    service: Service,
    sigchld: SignalWatch,
    config: Option<ContainerConfig>,
    terminals: Vec<Pty>,
    devfs: Option<DevFs>,
    init_pid: Option<Pid>,
    init_status: Option<i32>,
    pending_stop: Option<(PeerId, u64)>,
}

impl Guard {
    /// Bind the guard socket and route SIGCHLD through the signalfd.
    /// At most one peer - the supervisor - is accepted.
    pub fn new(socket_path: &Path) -> Result<Self> {
        zoned_ipc::sigfd::block_sigpipe()?;
        let service = Service::new(socket_path, 1)?;
        let sigchld = SignalWatch::new(&[Signal::SIGCHLD])?;
        service.add_fd(
            std::os::fd::AsFd::as_fd(&sigchld),
            nix::sys::epoll::EpollFlags::EPOLLIN,
        )?;
        Ok(Self {
            service,
            sigchld,
            config: None,
            terminals: Vec::new(),
            devfs: None,
            init_pid: None,
            init_status: None,
            pending_stop: None,
        })
    }

    /// Serve until the init has been reaped (or the supervisor never
    /// started one and the socket went away). Returns init's exit code.
    pub fn execute(&mut self) -> Result<i32> {
        loop {
            let events = self.service.poll(None)?;
            for event in events {
                self.dispatch(event);
            }
            if let Some(status) = self.init_status {
                self.cleanup();
                return Ok(status);
            }
        }
    }

    fn dispatch(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::PeerConnected(peer) => {
                info!("supervisor connected as {peer}");
                if let Err(e) = self.service.call(
                    peer,
                    api::METHOD_GUARD_READY,
                    &Void {},
                    Some(GUARD_READY_TIMEOUT),
                ) {
                    warn!("failed to announce readiness: {e}");
                }
            }
            ServiceEvent::PeerDisconnected(peer) => {
                // Not fatal; the supervisor may reconnect.
                info!("supervisor {peer} disconnected");
            }
            ServiceEvent::Request {
                peer,
                method,
                id,
                payload,
            } => self.handle_request(peer, method, id, &payload),
            ServiceEvent::Reply { result, .. } => {
                if let Err(e) = result {
                    warn!("ready call not acknowledged: {e}");
                }
            }
            ServiceEvent::Signal { method, .. } => {
                warn!("unexpected signal {method} on guard socket");
            }
            ServiceEvent::Fd(ready) => {
                if ready.fd == self.sigchld.raw_fd() {
                    self.drain_sigchld();
                }
            }
        }
    }

    fn handle_request(&mut self, peer: PeerId, method: u32, id: u64, payload: &[u8]) {
        let outcome: Result<()> = match method {
            api::METHOD_SET_CONFIG => self.on_set_config(peer, id, payload),
            api::METHOD_GET_CONFIG => self.on_get_config(peer, id),
            api::METHOD_START => self.on_start(peer, id),
            api::METHOD_STOP => self.on_stop(peer, id),
            api::METHOD_RESIZE_TERM => self.on_resize_term(peer, id, payload),
            _ => {
                warn!("unknown guard method {method}");
                let _ = self.service.reply_error(
                    peer,
                    id,
                    ErrorCode::Internal as i32,
                    "unknown method",
                );
                Ok(())
            }
        };
        if let Err(e) = outcome {
            error!("guard method {method} failed: {e}");
            let _ = self
                .service
                .reply_error(peer, id, ErrorCode::Internal as i32, &e.to_string());
        }
    }

    fn on_set_config(&mut self, peer: PeerId, id: u64, payload: &[u8]) -> Result<()> {
        let config: ContainerConfig = serde_json::from_slice(payload).map_err(|e| {
            Error::Ipc(zoned_ipc::Error::Codec(e))
        })?;
        if let Err(reason) = config.validate() {
            warn!("rejecting config: {reason}");
            self.service
                .reply_error(peer, id, ErrorCode::Internal as i32, &reason)?;
            return Ok(());
        }

        // The guard lost its inherited descriptors at daemonization;
        // bring logging back per the supervisor's wishes.
        if let Err(e) = config.logger.install() {
            warn!("could not reinitialize logging: {e}");
        }
        debug!("config restored for zone {}", config.name);

        // Best effort: a recognizable name in the process list.
        let title = format!("zoned-guard {}", config.name);
        if let Ok(title) = CString::new(title) {
            // Safety: PR_SET_NAME copies at most 16 bytes from the
            // NUL-terminated buffer.
            unsafe {
                libc::prctl(libc::PR_SET_NAME, title.as_ptr(), 0, 0, 0);
            }
        }

        self.config = Some(config);
        self.service.reply_ok(peer, id, &Void {})?;
        Ok(())
    }

    fn on_get_config(&mut self, peer: PeerId, id: u64) -> Result<()> {
        match &self.config {
            Some(config) => {
                let config = config.clone();
                self.service.reply_ok(peer, id, &config)?;
            }
            None => {
                self.service.reply_error(
                    peer,
                    id,
                    ErrorCode::Internal as i32,
                    "no configuration received",
                )?;
            }
        }
        Ok(())
    }

    fn on_start(&mut self, peer: PeerId, id: u64) -> Result<()> {
        if let Some(pid) = self.init_pid {
            return Err(Error::AlreadyRunning(pid.as_raw()));
        }
        let init_pid = self.start_container()?;
        self.init_pid = Some(init_pid);
        if let Some(config) = &mut self.config {
            config.init_pid = Some(init_pid.as_raw());
            config.guard_pid = Some(std::process::id() as i32);
        }
        info!("init started with pid {init_pid}");
        self.service.reply_ok(
            peer,
            id,
            &api::InitPid {
                pid: init_pid.as_raw(),
            },
        )?;
        Ok(())
    }

    fn start_container(&mut self) -> Result<Pid> {
        let config = self
            .config
            .as_ref()
            .ok_or(Error::NotConfigured("start"))?
            .clone();

        // Stage /dev and /dev/pts in a private mount namespace so the
        // host never sees them.
        proc::unshare(NsSet::empty().with(NsKind::Mnt))?;
        mount::mount(
            None,
            Path::new("/"),
            None,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            None,
        )?;
        let devfs = DevFs::new(
            &config.name,
            &config.work_path,
            config.uid_map.clone(),
            config.gid_map.clone(),
        );
        devfs.execute()?;

        // Guest terminals come from the staged devpts so their slave
        // names are valid inside the zone.
        let container_root_uid = if config.uid_map.is_empty() {
            0
        } else {
            config.uid_map.host_id(0).unwrap_or(0)
        };
        let terminals = zoned_pty::prepare_terminals(&TerminalsConfig {
            count: config.terminals.count,
            devpts_path: Some(devfs.devpts_path.clone()),
            uid: container_root_uid,
        })?;

        let barrier = Barrier::new()?;
        let first_pts = start::guest_pts_path(&terminals[0].pts_name);
        let plan = InitPlan::build(&config, &barrier, &first_pts)?;

        let init_pid = proc::clone_child(|| plan.run(), config.namespaces.clone_flags())?;

        // Map writes must land before the barrier byte: the child's
        // first privileged operations depend on them.
        start::setup_userns(init_pid, &config.uid_map, &config.gid_map)?;
        barrier.release()?;

        self.devfs = Some(devfs);
        self.terminals = terminals;
        Ok(init_pid)
    }

    fn on_stop(&mut self, peer: PeerId, id: u64) -> Result<()> {
        let init_pid = self.init_pid.ok_or(Error::NotRunning)?;
        info!("stopping init {init_pid}");
        kill(init_pid, Signal::SIGTERM).map_err(Error::Kill)?;
        // The reply completes from the SIGCHLD handler once init is
        // reaped.
        self.pending_stop = Some((peer, id));
        Ok(())
    }

    fn on_resize_term(&mut self, peer: PeerId, id: u64, payload: &[u8]) -> Result<()> {
        let resize: api::ResizeTerm =
            serde_json::from_slice(payload).map_err(|e| Error::Ipc(zoned_ipc::Error::Codec(e)))?;
        let terminal = self
            .terminals
            .get(resize.terminal as usize)
            .ok_or(Error::NoSuchTerminal(resize.terminal))?;
        let ws = nix::pty::Winsize {
            ws_row: resize.rows,
            ws_col: resize.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // Safety: ioctl on a live pty master with a properly sized arg.
        let rc = unsafe {
            libc::ioctl(
                std::os::fd::AsRawFd::as_raw_fd(&terminal.master),
                libc::TIOCSWINSZ,
                &ws,
            )
        };
        if rc != 0 {
            return Err(Error::Resize(nix::errno::Errno::last()));
        }
        self.service.reply_ok(peer, id, &Void {})?;
        Ok(())
    }

    fn drain_sigchld(&mut self) {
        loop {
            match self.sigchld.read() {
                Ok(Some(Signal::SIGCHLD)) => self.reap_init(),
                Ok(Some(_)) | Ok(None) => break,
                Err(e) => {
                    warn!("signalfd read failed: {e}");
                    break;
                }
            }
        }
    }

    fn reap_init(&mut self) {
        let Some(init_pid) = self.init_pid else {
            return;
        };
        match waitpid(init_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                let code = proc::exit_code(status);
                info!("init exited with status {code}");
                self.init_status = Some(code);
                if let Some((peer, id)) = self.pending_stop.take() {
                    let _ = self
                        .service
                        .reply_ok(peer, id, &api::ExitStatus { status: code });
                }
            }
            Ok(_) => {}
            Err(e) => warn!("waitpid({init_pid}) failed: {e}"),
        }
    }

    fn cleanup(&mut self) {
        if let Some(config) = &self.config {
            if !config.provisions.is_empty() {
                config.provisions.rebased(&config.root_path).revert();
            }
        }
        self.terminals.clear();
        if let Some(devfs) = self.devfs.take() {
            if let Err(e) = devfs.revert() {
                warn!("failed to tear down staged dev trees: {e}");
            }
        }
    }
}
