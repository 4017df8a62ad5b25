/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Daemon and per-zone configuration. The daemon config is read once at
//! startup; per-zone configs are rendered from the template at creation
//! time and live as individual JSON files referenced by name from the
//! dynamic config.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use zoned_guard::LoggerConfig;
use zoned_ns::IdMap;
use zoned_ns::NsSet;
use zoned_rootfs::provision::Provisions;

use crate::policy::ProxyCallRule;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding one rootfs per zone, `<zones_path>/<id>/`.
    pub zones_path: PathBuf,
    /// Host-side staging directory for pre-prepared /dev trees.
    pub work_path: PathBuf,
    /// The host control socket.
    pub socket_path: PathBuf,
    /// Persisted dynamic configuration.
    pub db_path: PathBuf,
    /// Directory where rendered zone configs are written.
    pub zone_config_dir: PathBuf,
    /// Directory holding config templates, `<dir>/<template>.conf`.
    pub template_dir: PathBuf,
    /// Rootfs image copied for each new zone; empty disables the copy.
    #[serde(default)]
    pub zone_image_path: Option<PathBuf>,
    /// Zone focused by SwitchToDefault and display-off escalation.
    #[serde(default)]
    pub default_id: String,
    /// Initial foreground zone; lowest priority wins when empty.
    #[serde(default)]
    pub foreground_id: String,
    #[serde(default)]
    pub proxy_call_rules: Vec<ProxyCallRule>,
    /// Root of the cgroup v1 hierarchy.
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
    /// Whether focus changes drive the console VT.
    #[serde(default)]
    pub activate_vt: bool,
    /// Path of the guard executable.
    #[serde(default = "default_guard_path")]
    pub guard_path: PathBuf,
    /// Logger configuration handed to every guard.
    #[serde(default)]
    pub guard_logger: LoggerConfig,
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_guard_path() -> PathBuf {
    PathBuf::from("/usr/libexec/zoned/zoned-guard")
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::internal(format!("cannot parse {}: {e}", path.display())))
    }

    pub fn zone_root(&self, id: &str) -> PathBuf {
        self.zones_path.join(id)
    }

    pub fn guard_socket(&self, id: &str) -> PathBuf {
        self.work_path.join(format!("{id}.guard.socket"))
    }
}

/// One zone's rendered configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: String,
    /// Name of the template this config was rendered from.
    pub template_name: String,
    pub init_argv: Vec<String>,
    pub namespaces: NsSet,
    #[serde(default)]
    pub uid_map: IdMap,
    #[serde(default)]
    pub gid_map: IdMap,
    #[serde(default = "default_terminal_count")]
    pub terminal_count: u32,
    /// Virtual terminal bound to this zone on the host console.
    pub vt: i32,
    /// Third octet of the zone's /24 network.
    pub ip_third_octet: u32,
    /// Election key for the initial foreground zone; lowest wins.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub permitted_to_send: Vec<String>,
    #[serde(default)]
    pub permitted_to_recv: Vec<String>,
    #[serde(default)]
    pub switch_to_default_after_timeout: bool,
    #[serde(default)]
    pub provisions: Provisions,
}

fn default_terminal_count() -> u32 {
    1
}

impl ZoneConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::internal(format!("cannot parse {}: {e}", path.display())))
    }

    /// Write the config with restrictive permissions: owner read/write,
    /// group and others read.
    pub fn save(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::internal(format!("cannot serialize zone config: {e}")))?;
        std::fs::write(path, text)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_zone_config() -> ZoneConfig {
        ZoneConfig {
            id: "z1".into(),
            template_name: "default".into(),
            init_argv: vec!["/sbin/init".into()],
            namespaces: NsSet::all(),
            uid_map: IdMap::default(),
            gid_map: IdMap::default(),
            terminal_count: 1,
            vt: 2,
            ip_third_octet: 101,
            priority: 10,
            permitted_to_send: vec!["/tmp/shared/.*".into()],
            permitted_to_recv: vec![".*".into()],
            switch_to_default_after_timeout: true,
            provisions: Provisions::default(),
        }
    }

    #[test]
    fn zone_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones").join("z1.conf");
        let config = minimal_zone_config();
        config.save(&path).unwrap();
        let back = ZoneConfig::load(&path).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn saved_config_is_world_readable_owner_writable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("z1.conf");
        minimal_zone_config().save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn guard_socket_is_per_zone() {
        let config = DaemonConfig {
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
            cgroup_root: default_cgroup_root(),
            activate_vt: false,
            guard_path: default_guard_path(),
            guard_logger: LoggerConfig::default(),
        };
        assert_eq!(
            config.guard_socket("z1"),
            PathBuf::from("/run/zoned/z1.guard.socket")
        );
        assert_eq!(
            config.zone_root("z1"),
            PathBuf::from("/var/lib/zoned/zones/z1")
        );
    }
}
