/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! zoned_guard
//! ===========
//!
//! The per-zone guard: a daemonized child of the supervisor that owns the
//! zone's configuration, clones the in-zone init and supervises it until
//! exit. The supervisor talks to it over a unix socket whose path is the
//! guard's only command-line argument.

pub mod config;
pub mod guard;
pub mod start;

pub use config::ContainerConfig;
pub use config::LoggerBackend;
pub use config::LoggerConfig;
pub use guard::Guard;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no configuration received before {0}")]
    NotConfigured(&'static str),
    #[error("zone is already running (init pid {0})")]
    AlreadyRunning(i32),
    #[error("zone is not running")]
    NotRunning,
    #[error("cannot write {path}: {error}")]
    MapWrite {
        path: std::path::PathBuf,
        error: std::io::Error,
    },
    #[error("start barrier failed: {0}")]
    Barrier(nix::errno::Errno),
    #[error("NUL byte in configured string")]
    NulByte,
    #[error("signal delivery failed: {0}")]
    Kill(nix::errno::Errno),
    #[error("terminal resize failed: {0}")]
    Resize(nix::errno::Errno),
    #[error("no such terminal: {0}")]
    NoSuchTerminal(u32),
    #[error(transparent)]
    Ns(#[from] zoned_ns::Error),
    #[error(transparent)]
    Rootfs(#[from] zoned_rootfs::Error),
    #[error(transparent)]
    Pty(#[from] zoned_pty::Error),
    #[error(transparent)]
    Ipc(#[from] zoned_ipc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
