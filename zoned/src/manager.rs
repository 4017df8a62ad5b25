/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The zone registry and every operation over it. One mutex protects the
//! whole state; handlers hold it briefly and never across blocking guard
//! RPCs - the long flows (start, stop, destroy) split into begin/finish
//! steps with the guard traffic in between, executed on worker threads.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;

use nix::unistd::Pid;
use tracing::debug;
use tracing::info;
use tracing::warn;
use zoned_api::host as api;
use zoned_api::ZoneState;
use zoned_api::HOST_ID;
use zoned_rootfs::provision::Declaration;

use crate::cgroup;
use crate::cgroup::CgroupDriver;
use crate::config::DaemonConfig;
use crate::config::ZoneConfig;
use crate::dynconf;
use crate::dynconf::DynamicConfig;
use crate::fsutil;
use crate::template;
use crate::template::Allocator;
use crate::zone;
use crate::zone::GuardChannel;
use crate::zone::StartedZone;
use crate::zone::Zone;
use crate::Error;
use crate::Result;

/// Marker file signalling that at least one zone exists.
const ENABLED_FILE_NAME: &str = "enabled";

struct State {
    /// Creation order; GetZoneIds reports it verbatim.
    zones: Vec<Zone>,
    dynamic: DynamicConfig,
    foreground_id: String,
    allocator: Allocator,
}

impl State {
    fn find(&self, id: &str) -> Result<&Zone> {
        self.zones
            .iter()
            .find(|z| z.id() == id)
            .ok_or_else(|| Error::InvalidId(id.to_string()))
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut Zone> {
        self.zones
            .iter_mut()
            .find(|z| z.id() == id)
            .ok_or_else(|| Error::InvalidId(id.to_string()))
    }
}

pub struct ZonesManager {
    pub daemon: DaemonConfig,
    cgroup: CgroupDriver,
    state: Mutex<State>,
}

impl ZonesManager {
    /// Load the persisted registry: every config named by the dynamic
    /// config becomes a stopped zone.
    pub fn load(daemon: DaemonConfig) -> Result<Self> {
        let dynamic = DynamicConfig::load(&daemon.db_path)?;
        let mut zones = Vec::new();
        for config_name in &dynamic.zone_configs {
            let config_path = daemon.zone_config_dir.join(config_name);
            match ZoneConfig::load(&config_path) {
                Ok(config) => {
                    debug!("loaded zone {} from {}", config.id, config_path.display());
                    zones.push(Zone::new(config, config_path, &daemon));
                }
                Err(e) => warn!("skipping unreadable config {config_name}: {e}"),
            }
        }

        let default_id = if dynamic.default_id.is_empty() {
            daemon.default_id.clone()
        } else {
            dynamic.default_id.clone()
        };
        if !default_id.is_empty() && !zones.iter().any(|z| z.id() == default_id) {
            return Err(Error::internal(format!(
                "provided default zone id {default_id} is invalid"
            )));
        }

        let allocator = Allocator::new(zones.len() as u32);
        let cgroup = CgroupDriver::new(&daemon.cgroup_root);
        Ok(Self {
            daemon,
            cgroup,
            state: Mutex::new(State {
                zones,
                dynamic,
                foreground_id: String::new(),
                allocator,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("manager state poisoned")
    }

    fn default_id(&self) -> String {
        let state = self.lock();
        if state.dynamic.default_id.is_empty() {
            self.daemon.default_id.clone()
        } else {
            state.dynamic.default_id.clone()
        }
    }

    // ---- queries ----------------------------------------------------

    pub fn zone_ids(&self) -> Vec<String> {
        self.lock().zones.iter().map(|z| z.id().to_string()).collect()
    }

    /// The foreground zone when it is actually running; empty otherwise.
    pub fn active_zone_id(&self) -> String {
        let state = self.lock();
        let id = &state.foreground_id;
        if !id.is_empty() && state.find(id).map(Zone::is_running).unwrap_or(false) {
            id.clone()
        } else {
            String::new()
        }
    }

    pub fn zone_info(&self, id: &str) -> Result<api::ZoneInfo> {
        let state = self.lock();
        let zone = state.find(id)?;
        Ok(api::ZoneInfo {
            id: zone.id().to_string(),
            vt: zone.config.vt,
            state: zone.state.as_wire().to_string(),
            root_path: zone.root_path.display().to_string(),
        })
    }

    pub fn init_pid(&self, id: &str) -> Result<Pid> {
        let state = self.lock();
        let zone = state.find(id)?;
        if !zone.is_running() && !zone.is_paused() {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: zone.state,
                required: "RUNNING",
            });
        }
        zone.init_pid
            .ok_or_else(|| Error::internal(format!("zone {id} has no init pid")))
    }

    // ---- create / destroy -------------------------------------------

    pub fn create_zone(&self, id: &str, template_name: &str) -> Result<()> {
        validate_zone_id(id)?;

        let mut state = self.lock();
        if state.zones.iter().any(|z| z.id() == id) {
            return Err(Error::MalformedId(format!("{id} already exists")));
        }

        let zone_root = self.daemon.zone_root(id);
        if let Some(image) = &self.daemon.zone_image_path {
            debug!("copying image {} to {}", image.display(), zone_root.display());
            fsutil::copy_dir_contents(image, &zone_root)
                .map_err(|e| Error::internal(format!("failed to copy zone image: {e}")))?;
        }

        let (ip_third_octet, vt) = state.allocator.next();
        let config = match self.render_config(id, template_name, ip_third_octet, vt) {
            Ok(config) => config,
            Err(e) => {
                let _ = fsutil::remove_tree(&zone_root);
                return Err(e);
            }
        };
        let config_path = self.daemon.zone_config_dir.join(dynconf::config_name(id));
        if let Err(e) = config.save(&config_path) {
            let _ = fsutil::remove_tree(&zone_root);
            return Err(e);
        }

        info!("created zone {id} from template {template_name} (vt {vt})");
        state
            .zones
            .push(Zone::new(config, config_path, &self.daemon));

        if state.zones.len() == 1 {
            if let Err(e) = std::fs::write(self.daemon.zones_path.join(ENABLED_FILE_NAME), "") {
                warn!("cannot create enabled marker: {e}");
            }
        }

        state.dynamic.add(&dynconf::config_name(id));
        state.dynamic.save(&self.daemon.db_path)
    }

    fn render_config(
        &self,
        id: &str,
        template_name: &str,
        ip_third_octet: u32,
        vt: i32,
    ) -> Result<ZoneConfig> {
        let template_path = self
            .daemon
            .template_dir
            .join(format!("{template_name}.conf"));
        let template_text = std::fs::read_to_string(&template_path).map_err(|e| {
            Error::internal(format!("cannot read template {}: {e}", template_path.display()))
        })?;
        let rendered = template::render(&template_text, id, ip_third_octet, vt);
        let mut config: ZoneConfig = serde_json::from_str(&rendered)
            .map_err(|e| Error::internal(format!("rendered config does not parse: {e}")))?;
        config.template_name = template_name.to_string();
        if config.id != id {
            return Err(Error::internal(format!(
                "template produced id {} for zone {id}",
                config.id
            )));
        }
        Ok(config)
    }

    /// The destructive tail of DestroyZone, run after the zone was
    /// stopped. Never leaves a half-removed entry in the persisted list:
    /// the dynamic config is saved before the rootfs goes away.
    pub fn finalize_destroy(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let position = state
            .zones
            .iter()
            .position(|z| z.id() == id)
            .ok_or_else(|| Error::InvalidId(id.to_string()))?;
        let zone = state.zones.remove(position);
        if state.foreground_id == id {
            state.foreground_id.clear();
        }

        state.dynamic.remove(&dynconf::config_name(id));
        state.dynamic.save(&self.daemon.db_path)?;

        if let Err(e) = std::fs::remove_file(&zone.config_path) {
            warn!("cannot remove config {}: {e}", zone.config_path.display());
        }
        fsutil::remove_tree(&zone.root_path)?;
        self.cgroup.remove(id);

        if state.zones.is_empty() {
            if let Err(e) = std::fs::remove_file(self.daemon.zones_path.join(ENABLED_FILE_NAME)) {
                warn!("cannot remove enabled marker: {e}");
            }
        }
        info!("destroyed zone {id}");
        Ok(())
    }

    // ---- start / stop (worker-thread flows) -------------------------

    /// Validate and mark STARTING; returns what the worker needs to run
    /// the blocking start outside the lock.
    pub fn begin_start(&self, id: &str) -> Result<(ZoneConfig, PathBuf)> {
        let mut state = self.lock();
        let zone = state.find_mut(id)?;
        if zone.state != ZoneState::Stopped {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: zone.state,
                required: "STOPPED",
            });
        }
        zone.state = ZoneState::Starting;
        Ok((zone.config.clone(), zone.guard_socket.clone()))
    }

    pub fn finish_start(&self, id: &str, outcome: Result<StartedZone>) -> Result<()> {
        let mut state = self.lock();
        let zone = state.find_mut(id)?;
        match outcome {
            Ok(started) => {
                zone.guard_pid = started.guard_pid;
                zone.init_pid = Some(started.init_pid);
                zone.guard = Some(started.guard);
                zone.state = ZoneState::Running;
                if let Err(e) = self.cgroup.assign(id, started.init_pid.as_raw()) {
                    warn!("cannot assign {id} to its cgroups: {e}");
                }
                Ok(())
            }
            Err(e) => {
                zone.state = ZoneState::Stopped;
                zone.guard = None;
                zone.guard_pid = None;
                zone.init_pid = None;
                Err(e)
            }
        }
    }

    /// Mark STOPPING and surrender the guard channel for the blocking
    /// stop call. `Ok(None)` means the zone was already stopped.
    pub fn begin_stop(&self, id: &str) -> Result<Option<GuardChannel>> {
        let mut state = self.lock();
        let zone = state.find_mut(id)?;
        if zone.is_stopped() {
            return Ok(None);
        }
        zone.state = ZoneState::Stopping;
        Ok(zone.guard.take())
    }

    pub fn finish_stop(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.foreground_id == id {
            state.foreground_id.clear();
        }
        let zone = state.find_mut(id)?;
        zone.state = ZoneState::Stopped;
        zone.guard = None;
        zone.guard_pid = None;
        zone.init_pid = None;
        zone.go_background();
        info!("zone {id} stopped");
        Ok(())
    }

    /// The whole blocking start flow; worker-thread entry point.
    pub fn start_zone_blocking(&self, id: &str) -> Result<()> {
        let (config, guard_socket) = self.begin_start(id)?;
        let outcome = zone::start_zone(&self.daemon, &config, &guard_socket);
        self.finish_start(id, outcome)?;
        self.focus(id)?;
        Ok(())
    }

    /// The whole blocking stop flow; worker-thread entry point.
    pub fn stop_zone_blocking(&self, id: &str) -> Result<()> {
        let guard = self.begin_stop(id)?;
        if let Some(mut guard) = guard {
            match guard.stop() {
                Ok(status) => debug!("zone {id} init exited with status {status}"),
                Err(e) => warn!("guard stop for {id} failed: {e}"),
            }
        }
        self.finish_stop(id)
    }

    pub fn destroy_zone_blocking(&self, id: &str) -> Result<()> {
        // Ensure the id exists before doing anything destructive.
        self.lock().find(id).map(|_| ())?;
        self.stop_zone_blocking(id)?;
        self.finalize_destroy(id)
    }

    /// Start every zone and elect a foreground: the configured one, or
    /// the lowest priority value when none is configured.
    pub fn start_all(&self) -> Result<()> {
        info!("starting all zones");
        let ids = self.zone_ids();
        for id in &ids {
            if let Err(e) = self.start_zone_blocking(id) {
                warn!("cannot start zone {id}: {e}");
            }
        }

        let configured = self.daemon.foreground_id.clone();
        let mut state = self.lock();
        let mut foreground = None;
        if !configured.is_empty() && state.zones.iter().any(|z| z.id() == configured) {
            foreground = Some(configured);
        } else {
            let min = state
                .zones
                .iter()
                .filter(|z| z.is_running())
                .min_by_key(|z| z.config.priority);
            if let Some(zone) = min {
                info!(
                    "{}: no foreground zone configured, electing by priority",
                    zone.id()
                );
                foreground = Some(zone.id().to_string());
            }
        }
        if let Some(id) = foreground {
            state.foreground_id = id.clone();
            for zone in &mut state.zones {
                if zone.id() == id {
                    zone.go_foreground();
                } else {
                    zone.go_background();
                }
            }
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for id in self.zone_ids() {
            if let Err(e) = self.stop_zone_blocking(&id) {
                warn!("cannot stop zone {id}: {e}");
            }
        }
    }

    // ---- focus ------------------------------------------------------

    /// Switch the foreground zone: activate its VT, background everyone
    /// else.
    pub fn focus(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let enabled = self.daemon.activate_vt;
        let target = state.find(id)?;
        if !target.activate_vt(enabled) {
            warn!("failed to activate zone VT, aborting focus");
            return Ok(());
        }
        for zone in &mut state.zones {
            zone.go_background();
        }
        state.foreground_id = id.to_string();
        state.find_mut(id)?.go_foreground();
        Ok(())
    }

    pub fn set_active_zone(&self, id: &str) -> Result<()> {
        {
            let state = self.lock();
            let zone = state.find(id)?;
            if zone.is_stopped() {
                return Err(Error::ZoneStopped);
            }
        }
        self.focus(id)
    }

    pub fn switch_to_default(&self) -> Result<()> {
        let default_id = self.default_id();
        if default_id.is_empty() {
            return Err(Error::internal("no default zone configured"));
        }
        self.focus(&default_id)
    }

    /// Display-off escalation: focus the default zone when the current
    /// foreground opted in.
    pub fn on_display_off(&self) -> Result<()> {
        let switch = {
            let state = self.lock();
            let id = state.foreground_id.clone();
            !id.is_empty()
                && state
                    .find(&id)
                    .map(|z| z.is_running() && z.config.switch_to_default_after_timeout)
                    .unwrap_or(false)
        };
        if switch {
            self.switch_to_default()
        } else {
            Ok(())
        }
    }

    // ---- lock / unlock ----------------------------------------------

    pub fn lock_zone(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let zone = state.find_mut(id)?;
        if !zone.is_running() {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: zone.state,
                required: "RUNNING",
            });
        }
        self.cgroup.freeze(id)?;
        zone.state = ZoneState::Paused;
        Ok(())
    }

    pub fn unlock_zone(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let zone = state.find_mut(id)?;
        if !zone.is_paused() {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: zone.state,
                required: "FROZEN",
            });
        }
        self.cgroup.thaw(id)?;
        zone.state = ZoneState::Running;
        Ok(())
    }

    // ---- devices ----------------------------------------------------

    pub fn grant_device(&self, id: &str, device: &str, flags: u32) -> Result<()> {
        self.device_access(id, device, true, flags)
    }

    pub fn revoke_device(&self, id: &str, device: &str) -> Result<()> {
        self.device_access(id, device, false, 0)
    }

    fn device_access(&self, id: &str, device: &str, grant: bool, flags: u32) -> Result<()> {
        let state = self.lock();
        let zone = state.find(id)?;
        if !zone.is_running() && !zone.is_paused() {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: zone.state,
                required: "RUNNING",
            });
        }
        let device_path = PathBuf::from("/dev").join(device);
        if !cgroup::is_device(&device_path) {
            return Err(Error::Forbidden(format!(
                "cannot access device: {device}"
            )));
        }
        self.cgroup
            .set_device_access(id, &device_path, grant, flags)
    }

    // ---- declarations -----------------------------------------------

    pub fn declare(&self, id: &str, declaration: Declaration) -> Result<String> {
        let mut state = self.lock();
        let zone = state.find_mut(id)?;
        let declaration_id = zone.config.provisions.declare(declaration);
        zone.config.save(&zone.config_path)?;
        Ok(declaration_id)
    }

    pub fn declarations(&self, id: &str) -> Result<Vec<String>> {
        let state = self.lock();
        Ok(state.find(id)?.config.provisions.ids())
    }

    pub fn remove_declaration(&self, id: &str, declaration_id: &str) -> Result<()> {
        let mut state = self.lock();
        let zone = state.find_mut(id)?;
        if zone.config.provisions.remove(declaration_id) {
            zone.config.save(&zone.config_path)?;
        }
        Ok(())
    }

    // ---- file transfer ----------------------------------------------

    /// Move a file between two zones' rootfs trees, honoring the
    /// per-zone transfer allow-lists. Returns the wire status plus the
    /// notification to deliver to the destination on success.
    pub fn file_move(
        &self,
        src_id: &str,
        dst_id: &str,
        path: &str,
    ) -> (String, Option<api::Notification>) {
        let state = self.lock();
        let Ok(src) = state.find(src_id) else {
            return (api::FILE_MOVE_FAILED.to_string(), None);
        };
        let Ok(dst) = state.find(dst_id) else {
            return (api::FILE_MOVE_DESTINATION_NOT_FOUND.to_string(), None);
        };
        if src_id == dst_id {
            return (api::FILE_MOVE_WRONG_DESTINATION.to_string(), None);
        }
        if !src.permitted_to_send(path) {
            return (api::FILE_MOVE_NO_PERMISSIONS_SEND.to_string(), None);
        }
        if !dst.permitted_to_recv(path) {
            return (api::FILE_MOVE_NO_PERMISSIONS_RECEIVE.to_string(), None);
        }

        let relative = path.trim_start_matches('/');
        let src_path = src.root_path.join(relative);
        let dst_path = dst.root_path.join(relative);
        match fsutil::move_file(&src_path, &dst_path) {
            Ok(()) => (
                api::FILE_MOVE_SUCCEEDED.to_string(),
                Some(api::Notification {
                    zone: src_id.to_string(),
                    application: path.to_string(),
                    message: api::FILE_MOVE_SUCCEEDED.to_string(),
                }),
            ),
            Err(e) => {
                warn!("failed to move {path} from {src_id} to {dst_id}: {e}");
                (api::FILE_MOVE_FAILED.to_string(), None)
            }
        }
    }

    // ---- notifications ----------------------------------------------

    /// Route a zone's notification to the active zone, unless the caller
    /// is the active zone itself. Returns the target zone id.
    pub fn route_notification(&self, caller: &str) -> Option<String> {
        let active = self.active_zone_id();
        if active.is_empty() || active == caller {
            None
        } else {
            Some(active)
        }
    }

    // ---- create file ------------------------------------------------

    pub fn create_file(
        &self,
        id: &str,
        path: &str,
        flags: i32,
        mode: u32,
    ) -> Result<(OwnedFd, api::FileHandle)> {
        use std::os::unix::fs::OpenOptionsExt;
        let host_path = {
            let state = self.lock();
            let zone = state.find(id)?;
            zone.root_path.join(path.trim_start_matches('/'))
        };
        if let Some(parent) = host_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .custom_flags(flags)
            .mode(mode)
            .open(&host_path)
            .map_err(|e| Error::internal(format!("cannot create {}: {e}", host_path.display())))?;
        Ok((
            file.into(),
            api::FileHandle {
                path: path.to_string(),
            },
        ))
    }

    // ---- proxy-call precondition ------------------------------------

    /// A proxy target must be a running zone with its guard connected.
    pub fn proxy_target_ready(&self, target: &str) -> Result<()> {
        let state = self.lock();
        let zone = state.find(target)?;
        if !zone.is_running() || !zone.guard_connected() {
            return Err(Error::InvalidState {
                id: target.to_string(),
                state: zone.state,
                required: "RUNNING",
            });
        }
        Ok(())
    }
}

/// Reserved or malformed ids are rejected before anything is created.
fn validate_zone_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::MalformedId("empty zone id".to_string()));
    }
    if id == HOST_ID {
        return Err(Error::MalformedId("cannot use reserved zone id".to_string()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::MalformedId(format!("invalid zone id: {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: ZonesManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("zones")).unwrap();
        std::fs::create_dir_all(root.join("templates")).unwrap();
        std::fs::create_dir_all(root.join("run")).unwrap();
        std::fs::write(
            root.join("templates/default.conf"),
            r#"{
                "id": "~NAME~",
                "template_name": "default",
                "init_argv": ["/sbin/init"],
                "namespaces": ["Mnt", "Pid", "Uts", "Ipc", "Net"],
                "vt": ~VT~,
                "ip_third_octet": ~IP~,
                "priority": 10,
                "permitted_to_send": ["/tmp/ut-zones/.*"],
                "permitted_to_recv": ["/tmp/ut-zones/.*"]
            }"#,
        )
        .unwrap();

        let daemon = DaemonConfig {
            zones_path: root.join("zones"),
            work_path: root.join("run"),
            socket_path: root.join("run/host.socket"),
            db_path: root.join("db.json"),
            zone_config_dir: root.join("zone-configs"),
            template_dir: root.join("templates"),
            zone_image_path: None,
            default_id: String::new(),
            foreground_id: String::new(),
            proxy_call_rules: Vec::new(),
            cgroup_root: root.join("cgroup"),
            activate_vt: false,
            guard_path: "/nonexistent/zoned-guard".into(),
            guard_logger: Default::default(),
        };
        let manager = ZonesManager::load(daemon).unwrap();
        Fixture { _dir: dir, manager }
    }

    #[test]
    fn create_registers_in_creation_order() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        fx.manager.create_zone("z2", "default").unwrap();
        assert_eq!(fx.manager.zone_ids(), vec!["z1", "z2"]);

        // Every listed id has info.
        for id in fx.manager.zone_ids() {
            let info = fx.manager.zone_info(&id).unwrap();
            assert_eq!(info.id, id);
            assert_eq!(info.state, "STOPPED");
        }
    }

    #[test]
    fn create_persists_dynamic_config_before_returning() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        let dynamic = DynamicConfig::load(&fx.manager.daemon.db_path).unwrap();
        assert_eq!(dynamic.zone_configs, vec!["z1.conf"]);
    }

    #[test]
    fn create_rejects_reserved_and_duplicate_ids() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.create_zone("host", "default"),
            Err(Error::MalformedId(_))
        ));
        assert!(matches!(
            fx.manager.create_zone("", "default"),
            Err(Error::MalformedId(_))
        ));
        assert!(matches!(
            fx.manager.create_zone("../evil", "default"),
            Err(Error::MalformedId(_))
        ));
        fx.manager.create_zone("z1", "default").unwrap();
        assert!(matches!(
            fx.manager.create_zone("z1", "default"),
            Err(Error::MalformedId(_))
        ));
    }

    #[test]
    fn create_renders_template_tokens() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        let info = fx.manager.zone_info("z1").unwrap();
        // First allocation: octet 101, vt 2.
        assert_eq!(info.vt, 2);
        fx.manager.create_zone("z2", "default").unwrap();
        assert_eq!(fx.manager.zone_info("z2").unwrap().vt, 3);
    }

    #[test]
    fn unknown_template_unwinds_cleanly() {
        let fx = fixture();
        let err = fx.manager.create_zone("z1", "missing");
        assert!(matches!(err, Err(Error::Internal(_))));
        assert!(fx.manager.zone_ids().is_empty());
    }

    #[test]
    fn destroy_removes_registry_entry_and_config() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        let config_path = fx.manager.daemon.zone_config_dir.join("z1.conf");
        assert!(config_path.exists());

        fx.manager.destroy_zone_blocking("z1").unwrap();
        assert!(fx.manager.zone_ids().is_empty());
        assert!(!config_path.exists());
        let dynamic = DynamicConfig::load(&fx.manager.daemon.db_path).unwrap();
        assert!(dynamic.zone_configs.is_empty());
    }

    #[test]
    fn destroy_unknown_zone_is_invalid_id() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.destroy_zone_blocking("ghost"),
            Err(Error::InvalidId(_))
        ));
    }

    #[test]
    fn enabled_marker_follows_zone_count() {
        let fx = fixture();
        let marker = fx.manager.daemon.zones_path.join("enabled");
        fx.manager.create_zone("z1", "default").unwrap();
        assert!(marker.exists());
        fx.manager.destroy_zone_blocking("z1").unwrap();
        assert!(!marker.exists());
    }

    #[test]
    fn lock_requires_running() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        assert!(matches!(
            fx.manager.lock_zone("z1"),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            fx.manager.unlock_zone("z1"),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn set_active_refuses_stopped_zone() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        assert!(matches!(
            fx.manager.set_active_zone("z1"),
            Err(Error::ZoneStopped)
        ));
        assert!(matches!(
            fx.manager.set_active_zone("ghost"),
            Err(Error::InvalidId(_))
        ));
        assert_eq!(fx.manager.active_zone_id(), "");
    }

    #[test]
    fn declarations_round_trip() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        let declaration_id = fx
            .manager
            .declare(
                "z1",
                Declaration::Link {
                    source: "/etc/hosts".into(),
                    target: "/tmp/hosts".into(),
                },
            )
            .unwrap();
        assert_eq!(fx.manager.declarations("z1").unwrap(), vec![declaration_id.clone()]);

        // Declarations persist in the zone config.
        let config_path = fx.manager.daemon.zone_config_dir.join("z1.conf");
        let reloaded = ZoneConfig::load(&config_path).unwrap();
        assert_eq!(reloaded.provisions.ids(), vec![declaration_id.clone()]);

        fx.manager.remove_declaration("z1", &declaration_id).unwrap();
        assert!(fx.manager.declarations("z1").unwrap().is_empty());
        let reloaded = ZoneConfig::load(&config_path).unwrap();
        assert!(reloaded.provisions.ids().is_empty());
    }

    #[test]
    fn file_move_enforces_allow_lists() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        fx.manager.create_zone("z2", "default").unwrap();

        // Path outside the allow-list.
        let (status, _) = fx.manager.file_move("z1", "z2", "/etc/passwd");
        assert_eq!(status, api::FILE_MOVE_NO_PERMISSIONS_SEND);

        // Self-move.
        let (status, _) = fx.manager.file_move("z1", "z1", "/tmp/ut-zones/f");
        assert_eq!(status, api::FILE_MOVE_WRONG_DESTINATION);

        // Unknown destination.
        let (status, _) = fx.manager.file_move("z1", "ghost", "/tmp/ut-zones/f");
        assert_eq!(status, api::FILE_MOVE_DESTINATION_NOT_FOUND);

        // Allowed and existing.
        let src_file = fx
            .manager
            .daemon
            .zone_root("z1")
            .join("tmp/ut-zones/file");
        std::fs::create_dir_all(src_file.parent().unwrap()).unwrap();
        std::fs::write(&src_file, b"payload").unwrap();
        let (status, notification) = fx.manager.file_move("z1", "z2", "/tmp/ut-zones/file");
        assert_eq!(status, api::FILE_MOVE_SUCCEEDED);
        let notification = notification.unwrap();
        assert_eq!(notification.zone, "z1");
        assert_eq!(notification.message, api::FILE_MOVE_SUCCEEDED);
        assert!(!src_file.exists());
        let dst_file = fx
            .manager
            .daemon
            .zone_root("z2")
            .join("tmp/ut-zones/file");
        assert_eq!(std::fs::read(&dst_file).unwrap(), b"payload");
    }

    #[test]
    fn create_file_returns_descriptor_into_zone() {
        use std::io::Write;
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        let (fd, handle) = fx
            .manager
            .create_file("z1", "/tmp/created", 0, 0o600)
            .unwrap();
        assert_eq!(handle.path, "/tmp/created");
        let mut file = std::fs::File::from(fd);
        file.write_all(b"hello").unwrap();
        let host_path = fx.manager.daemon.zone_root("z1").join("tmp/created");
        assert_eq!(std::fs::read(&host_path).unwrap(), b"hello");
    }

    #[test]
    fn proxy_target_must_be_running() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        assert!(matches!(
            fx.manager.proxy_target_ready("z1"),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            fx.manager.proxy_target_ready("ghost"),
            Err(Error::InvalidId(_))
        ));
    }

    #[test]
    fn display_off_without_foreground_is_a_no_op() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        fx.manager.on_display_off().unwrap();
        assert_eq!(fx.manager.active_zone_id(), "");
    }

    #[test]
    fn switch_to_default_requires_a_default() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.switch_to_default(),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn registry_reloads_from_disk() {
        let fx = fixture();
        fx.manager.create_zone("z1", "default").unwrap();
        fx.manager.create_zone("z2", "default").unwrap();

        let reloaded = ZonesManager::load(fx.manager.daemon.clone()).unwrap();
        assert_eq!(reloaded.zone_ids(), vec!["z1", "z2"]);
        // Counters resume beyond existing zones.
        reloaded.create_zone("z3", "default").unwrap();
        assert_eq!(reloaded.zone_info("z3").unwrap().vt, 4);
    }
}
