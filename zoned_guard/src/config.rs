/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The typed snapshot the supervisor serializes to the guard in the
//! `SetConfig` handshake. The guard has lost its inherited descriptors by
//! the time it runs, so the snapshot carries everything it needs to
//! reinitialize logging and to build the zone.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;

use zoned_ns::IdMap;
use zoned_ns::NsSet;
use zoned_pty::TerminalsConfig;
use zoned_rootfs::provision::Provisions;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoggerLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LoggerLevel> for tracing::Level {
    fn from(level: LoggerLevel) -> Self {
        match level {
            LoggerLevel::Error => tracing::Level::ERROR,
            LoggerLevel::Warn => tracing::Level::WARN,
            LoggerLevel::Info => tracing::Level::INFO,
            LoggerLevel::Debug => tracing::Level::DEBUG,
            LoggerLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoggerBackend {
    Stderr,
    /// Append to a file that survives the guard's mount namespace games.
    File(PathBuf),
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub backend: LoggerBackend,
    pub level: LoggerLevel,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            backend: LoggerBackend::Stderr,
            level: LoggerLevel::Info,
        }
    }
}

impl LoggerConfig {
    /// Install a fresh global subscriber per this config. Only callable
    /// once per process; the guard does it when the config arrives.
    pub fn install(&self) -> std::result::Result<(), std::io::Error> {
        let targets = filter::Targets::new().with_default(tracing::Level::from(self.level));
        match &self.backend {
            LoggerBackend::Stderr => {
                let layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .with_filter(targets);
                let _ = tracing_subscriber::registry().with(layer).try_init();
            }
            LoggerBackend::File(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                let layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(targets);
                let _ = tracing_subscriber::registry().with(layer).try_init();
            }
            LoggerBackend::Null => {
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::sink)
                    .with_filter(filter::Targets::new().with_default(filter::LevelFilter::OFF));
                let _ = tracing_subscriber::registry().with(layer).try_init();
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Zone id; also becomes the UTS hostname when requested.
    pub name: String,
    /// Host directory backing the zone's `/`.
    pub root_path: PathBuf,
    /// Host-side staging directory for the pre-prepared /dev trees.
    pub work_path: PathBuf,
    pub guard_pid: Option<i32>,
    pub init_pid: Option<i32>,
    /// Init argv, paths relative to the pivoted root.
    pub init_argv: Vec<String>,
    pub namespaces: NsSet,
    pub uid_map: IdMap,
    pub gid_map: IdMap,
    pub terminals: TerminalsConfig,
    pub provisions: Provisions,
    pub logger: LoggerConfig,
}

impl ContainerConfig {
    /// Basic shape checks the supervisor applies before handing the
    /// config over.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() {
            return Err("zone name must not be empty".into());
        }
        if self.init_argv.is_empty() {
            return Err("init argv must not be empty".into());
        }
        if self.terminals.count == 0 {
            return Err("terminal count must be positive".into());
        }
        if self.namespaces.contains(zoned_ns::NsKind::User) {
            if self.uid_map.is_empty() || self.gid_map.is_empty() {
                return Err("user namespace requires non-empty uid and gid maps".into());
            }
            if self.root_path == std::path::Path::new("/") {
                return Err("user namespace cannot reuse the host root".into());
            }
        }
        Ok(())
    }
}
