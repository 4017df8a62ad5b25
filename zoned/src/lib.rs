/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! zoned
//! =====
//!
//! The host supervisor: sole authority over the zone registry. Serves the
//! host RPC socket, spawns one guard per started zone, polices proxy
//! calls, and persists the dynamic configuration.

pub mod cgroup;
pub mod config;
pub mod dynconf;
pub mod fsutil;
pub mod manager;
pub mod netdev;
pub mod policy;
pub mod server;
pub mod template;
pub mod worker;
pub mod zone;

use zoned_api::ApiError;
use zoned_api::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such zone id: {0}")]
    InvalidId(String),
    #[error("invalid zone id: {0}")]
    MalformedId(String),
    #[error("zone {id} is {state}, operation requires {required}")]
    InvalidState {
        id: String,
        state: zoned_api::ZoneState,
        required: &'static str,
    },
    #[error("{0}")]
    Forbidden(String),
    #[error("could not activate a stopped zone")]
    ZoneStopped,
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ipc(#[from] zoned_ipc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal(message.to_string())
    }

    /// Translation to the wire taxonomy, applied at serialization and
    /// nowhere else.
    pub fn to_api(&self) -> ApiError {
        let code = match self {
            Error::InvalidId(_) | Error::MalformedId(_) => ErrorCode::InvalidId,
            Error::InvalidState { .. } => ErrorCode::InvalidState,
            Error::Forbidden(_) => ErrorCode::Forbidden,
            Error::ZoneStopped => ErrorCode::ZoneStopped,
            Error::Internal(_) => ErrorCode::Internal,
            Error::Io(_) => ErrorCode::Internal,
            Error::Ipc(zoned_ipc::Error::Remote { .. }) => ErrorCode::Forwarded,
            Error::Ipc(_) => ErrorCode::Io,
        };
        ApiError::new(code, self.to_string())
    }
}
