/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The persisted subset of manager state: the ordered list of per-zone
//! config names plus the default zone id. Writes are atomic - temp file,
//! fsync, rename - so a crash never leaves a half-written registry.

use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConfig {
    /// Config file names relative to the zone config directory, in zone
    /// creation order.
    pub zone_configs: Vec<String>,
    #[serde(default)]
    pub default_id: String,
}

impl DynamicConfig {
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| Error::internal(format!("cannot parse {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::internal(format!("cannot serialize dynamic config: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(text.as_bytes())?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn add(&mut self, config_name: &str) {
        if !self.zone_configs.iter().any(|c| c == config_name) {
            self.zone_configs.push(config_name.to_string());
        }
    }

    pub fn remove(&mut self, config_name: &str) {
        self.zone_configs.retain(|c| c != config_name);
    }
}

/// Name of a zone's config file inside the zone config directory.
pub fn config_name(zone_id: &str) -> String {
    format!("{zone_id}.conf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = DynamicConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, DynamicConfig::default());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let mut config = DynamicConfig::default();
        config.add("z1.conf");
        config.add("z2.conf");
        config.default_id = "z1".to_string();
        config.save(&path).unwrap();
        assert_eq!(DynamicConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        DynamicConfig::default().save(&path).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("db.json")]);
    }

    #[test]
    fn add_is_idempotent_and_ordered() {
        let mut config = DynamicConfig::default();
        config.add("a.conf");
        config.add("b.conf");
        config.add("a.conf");
        assert_eq!(config.zone_configs, vec!["a.conf", "b.conf"]);
        config.remove("a.conf");
        assert_eq!(config.zone_configs, vec!["b.conf"]);
    }
}
