/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! One entry of the zone registry plus the guard-side plumbing: spawning
//! the daemonized guard process and the typed RPC channel to it.

use std::ffi::CString;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use nix::unistd::fork;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use tracing::debug;
use tracing::info;
use tracing::warn;
use zoned_api::guard as guard_api;
use zoned_api::Void;
use zoned_api::ZoneState;
use zoned_guard::ContainerConfig;
use zoned_ipc::client::DEFAULT_CALL_TIMEOUT;
use zoned_ipc::Client;
use zoned_pty::TerminalsConfig;

use crate::config::DaemonConfig;
use crate::config::ZoneConfig;
use crate::Error;
use crate::Result;

pub struct Zone {
    pub config: ZoneConfig,
    /// Rendered config file backing this zone.
    pub config_path: PathBuf,
    pub root_path: PathBuf,
    pub guard_socket: PathBuf,
    pub state: ZoneState,
    pub guard_pid: Option<Pid>,
    pub init_pid: Option<Pid>,
    pub guard: Option<GuardChannel>,
    pub foreground: bool,
    send_patterns: Vec<regex::Regex>,
    recv_patterns: Vec<regex::Regex>,
}

impl Zone {
    pub fn new(config: ZoneConfig, config_path: PathBuf, daemon: &DaemonConfig) -> Self {
        let root_path = daemon.zone_root(&config.id);
        let guard_socket = daemon.guard_socket(&config.id);
        let send_patterns = compile_patterns(&config.permitted_to_send);
        let recv_patterns = compile_patterns(&config.permitted_to_recv);
        Self {
            config,
            config_path,
            root_path,
            guard_socket,
            state: ZoneState::Stopped,
            guard_pid: None,
            init_pid: None,
            guard: None,
            foreground: false,
            send_patterns,
            recv_patterns,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn is_running(&self) -> bool {
        self.state == ZoneState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ZoneState::Stopped
    }

    pub fn is_paused(&self) -> bool {
        self.state == ZoneState::Paused
    }

    /// RUNNING requires a live init and a connected guard channel.
    pub fn guard_connected(&self) -> bool {
        self.guard.is_some()
    }

    pub fn go_foreground(&mut self) {
        if !self.foreground {
            debug!("{}: being sent to foreground", self.id());
            self.foreground = true;
        }
    }

    pub fn go_background(&mut self) {
        if self.foreground {
            debug!("{}: being sent to background", self.id());
            self.foreground = false;
        }
    }

    /// Bring the zone's VT to the host console. With VT handling
    /// disabled this always succeeds so focus can still be tracked on
    /// headless hosts.
    pub fn activate_vt(&self, enabled: bool) -> bool {
        if !enabled {
            return true;
        }
        match activate_console_vt(self.config.vt) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: cannot activate VT {}: {e}", self.id(), self.config.vt);
                false
            }
        }
    }

    /// Regex allow-list for paths this zone may send.
    pub fn permitted_to_send(&self, path: &str) -> bool {
        self.send_patterns.iter().any(|re| re.is_match(path))
    }

    pub fn permitted_to_recv(&self, path: &str) -> bool {
        self.recv_patterns.iter().any(|re| re.is_match(path))
    }
}

/// Compile transfer patterns, anchored: the whole path must match, not a
/// substring. Broken patterns are logged and never match.
fn compile_patterns(patterns: &[String]) -> Vec<regex::Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match regex::Regex::new(&format!("^(?:{pattern})$")) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("invalid transfer pattern '{pattern}': {e}");
                None
            }
        })
        .collect()
}

const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_WAITACTIVE: libc::c_ulong = 0x5607;

fn activate_console_vt(vt: i32) -> std::io::Result<()> {
    let console = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/tty0")?;
    use std::os::fd::AsRawFd;
    // Safety: plain integer ioctls on the console fd.
    unsafe {
        if libc::ioctl(console.as_raw_fd(), VT_ACTIVATE, vt as libc::c_long) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::ioctl(console.as_raw_fd(), VT_WAITACTIVE, vt as libc::c_long) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The typed RPC channel to a zone's guard.
pub struct GuardChannel {
    client: Client,
}

impl GuardChannel {
    pub fn set_config(&mut self, config: &ContainerConfig) -> Result<()> {
        let _: Void = self
            .client
            .call(guard_api::METHOD_SET_CONFIG, config, Some(DEFAULT_CALL_TIMEOUT))?;
        Ok(())
    }

    /// Infinite timeout: start must run to completion or fail explicitly.
    pub fn start(&mut self) -> Result<Pid> {
        let reply: guard_api::InitPid = self.client.call(guard_api::METHOD_START, &Void {}, None)?;
        Ok(Pid::from_raw(reply.pid))
    }

    /// Infinite timeout; the reply arrives when the guard reaps init.
    pub fn stop(&mut self) -> Result<i32> {
        let reply: guard_api::ExitStatus =
            self.client.call(guard_api::METHOD_STOP, &Void {}, None)?;
        Ok(reply.status)
    }

    pub fn get_config(&mut self) -> Result<ContainerConfig> {
        Ok(self
            .client
            .call(guard_api::METHOD_GET_CONFIG, &Void {}, Some(DEFAULT_CALL_TIMEOUT))?)
    }

    pub fn resize_term(&mut self, terminal: u32, rows: u16, cols: u16) -> Result<()> {
        let _: Void = self.client.call(
            guard_api::METHOD_RESIZE_TERM,
            &guard_api::ResizeTerm {
                terminal,
                rows,
                cols,
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(())
    }
}

/// Everything `start_zone` produces, applied to the registry under the
/// manager lock afterwards.
pub struct StartedZone {
    pub guard: GuardChannel,
    pub guard_pid: Option<Pid>,
    pub init_pid: Pid,
}

/// Build the guard's view of a zone from its host-side config.
pub fn container_config(daemon: &DaemonConfig, zone: &ZoneConfig) -> ContainerConfig {
    ContainerConfig {
        name: zone.id.clone(),
        root_path: daemon.zone_root(&zone.id),
        work_path: daemon.work_path.clone(),
        guard_pid: None,
        init_pid: None,
        init_argv: zone.init_argv.clone(),
        namespaces: zone.namespaces,
        uid_map: zone.uid_map.clone(),
        gid_map: zone.gid_map.clone(),
        terminals: TerminalsConfig {
            count: zone.terminal_count,
            devpts_path: None,
            uid: 0,
        },
        provisions: zone.provisions.clone(),
        logger: daemon.guard_logger.clone(),
    }
}

/// Spawn the guard executable, daemonized: a throwaway child calls
/// setsid and forks again so the guard reattaches under init with no
/// controlling terminal, stdio on /dev/null and argv carrying the zone
/// id for the process list. Everything after the first fork is
/// async-signal-safe; the strings are prepared up front.
pub fn spawn_guard(daemon: &DaemonConfig, zone: &ZoneConfig, guard_socket: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let to_cstring = |bytes: &[u8]| {
        CString::new(bytes).map_err(|_| Error::internal("NUL byte in guard argv"))
    };
    let program = to_cstring(daemon.guard_path.as_os_str().as_bytes())?;
    let argv = [
        program.clone(),
        to_cstring(guard_socket.as_os_str().as_bytes())?,
        to_cstring(zone.id.as_bytes())?,
        to_cstring(daemon.zone_root(&zone.id).as_os_str().as_bytes())?,
    ];
    let dev_null = to_cstring(b"/dev/null")?;
    let root_dir = to_cstring(b"/")?;

    info!("spawning guard for {} on {}", zone.id, guard_socket.display());

    // Safety: the child branch runs only async-signal-safe calls and
    // always _exits.
    let helper = match unsafe { fork() }.map_err(|e| Error::internal(e))? {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            unsafe {
                if libc::setsid() < 0 {
                    libc::_exit(libc::EXIT_FAILURE);
                }
                // Second fork: the guard must not be a session leader or
                // it could reacquire a controlling terminal.
                match libc::fork() {
                    -1 => libc::_exit(libc::EXIT_FAILURE),
                    0 => {}
                    _ => libc::_exit(libc::EXIT_SUCCESS),
                }
                if libc::chdir(root_dir.as_ptr()) < 0 {
                    libc::_exit(libc::EXIT_FAILURE);
                }
                let null_fd = libc::open(dev_null.as_ptr(), libc::O_RDWR);
                if null_fd < 0 {
                    libc::_exit(libc::EXIT_FAILURE);
                }
                for stdio in 0..=2 {
                    if libc::dup2(null_fd, stdio) < 0 {
                        libc::_exit(libc::EXIT_FAILURE);
                    }
                }
                if null_fd > 2 {
                    libc::close(null_fd);
                }
                let argv_ptrs: [*const libc::c_char; 5] = [
                    argv[0].as_ptr(),
                    argv[1].as_ptr(),
                    argv[2].as_ptr(),
                    argv[3].as_ptr(),
                    std::ptr::null(),
                ];
                libc::execv(program.as_ptr(), argv_ptrs.as_ptr());
                libc::_exit(libc::EXIT_FAILURE);
            }
        }
    };

    let status = zoned_ns::proc::wait_exit(helper)
        .map_err(|e| Error::internal(format!("daemonize helper failed: {e}")))?;
    if zoned_ns::proc::exit_code(status) != 0 {
        return Err(Error::internal("daemonize helper exited with failure"));
    }
    Ok(())
}

/// Full start sequence against a fresh guard: connect, handshake, push
/// the config, start the init. Runs on a worker thread; the caller
/// applies the result to the registry under its lock.
pub fn start_zone(daemon: &DaemonConfig, zone: &ZoneConfig, guard_socket: &Path) -> Result<StartedZone> {
    spawn_guard(daemon, zone, guard_socket)?;

    let mut client = Client::connect_with_retry(guard_socket, Duration::from_secs(5))?;

    // The guard announces itself as soon as we connect.
    let ready = client.wait_incoming(guard_api::METHOD_GUARD_READY, Some(DEFAULT_CALL_TIMEOUT))?;
    client.reply_ok(ready.id, &Void {})?;

    let mut guard = GuardChannel { client };
    guard.set_config(&container_config(daemon, zone))?;
    let init_pid = guard.start()?;
    if init_pid.as_raw() <= 0 {
        return Err(Error::internal(format!("bad init pid {init_pid}")));
    }

    // The guard daemonized away from us; it knows its own pid.
    let guard_pid = guard
        .get_config()
        .ok()
        .and_then(|config| config.guard_pid)
        .map(Pid::from_raw);

    info!("zone {} started, init pid {init_pid}", zone.id);
    Ok(StartedZone {
        guard,
        guard_pid,
        init_pid,
    })
}

#[cfg(test)]
mod tests {
    use zoned_ns::NsSet;
    use zoned_rootfs::provision::Provisions;

    use super::*;

    fn zone_config() -> ZoneConfig {
        ZoneConfig {
            id: "z1".into(),
            template_name: "default".into(),
            init_argv: vec!["/sbin/init".into()],
            namespaces: NsSet::all(),
            uid_map: Default::default(),
            gid_map: Default::default(),
            terminal_count: 2,
            vt: 3,
            ip_third_octet: 101,
            priority: 0,
            permitted_to_send: vec!["/tmp/shared/.*".into()],
            permitted_to_recv: vec![],
            switch_to_default_after_timeout: false,
            provisions: Provisions::default(),
        }
    }

    #[test]
    fn send_patterns_match_whole_paths() {
        let daemon = daemon_config();
        let zone = Zone::new(zone_config(), "/tmp/z1.conf".into(), &daemon);
        assert!(zone.permitted_to_send("/tmp/shared/file"));
        // substring matches are not enough
        assert!(!zone.permitted_to_send("/other/tmp/shared/file"));
        assert!(!zone.permitted_to_send("/tmp/shared"));
        assert!(!zone.permitted_to_recv("/tmp/shared/file"));
    }

    #[test]
    fn fresh_zone_is_stopped_background() {
        let daemon = daemon_config();
        let zone = Zone::new(zone_config(), "/tmp/z1.conf".into(), &daemon);
        assert!(zone.is_stopped());
        assert!(!zone.foreground);
        assert!(!zone.guard_connected());
        assert_eq!(zone.root_path, PathBuf::from("/var/lib/zoned/zones/z1"));
    }

    #[test]
    fn container_config_mirrors_zone_config() {
        let daemon = daemon_config();
        let config = container_config(&daemon, &zone_config());
        assert_eq!(config.name, "z1");
        assert_eq!(config.terminals.count, 2);
        assert_eq!(config.root_path, PathBuf::from("/var/lib/zoned/zones/z1"));
        config.validate().unwrap();
    }

    fn daemon_config() -> DaemonConfig {
        DaemonConfig {
            zones_path: "/var/lib/zoned/zones".into(),
            work_path: "/run/zoned".into(),
            socket_path: "/run/zoned/host.socket".into(),
            db_path: "/var/lib/zoned/db.json".into(),
            zone_config_dir: "/etc/zoned/zones".into(),
            template_dir: "/etc/zoned/templates".into(),
            zone_image_path: None,
            default_id: String::new(),
            foreground_id: String::new(),
            proxy_call_rules: Vec::new(),
            cgroup_root: "/sys/fs/cgroup".into(),
            activate_vt: false,
            guard_path: "/usr/libexec/zoned/zoned-guard".into(),
            guard_logger: Default::default(),
        }
    }
}
