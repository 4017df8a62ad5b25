/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! zoned_api
//! =========
//!
//! Wire-level definitions shared by the supervisor, the per-zone guard and
//! the client library: method ids, request/reply payload structs and the
//! closed error taxonomy. Payloads are serialized as JSON inside the
//! length-prefixed frames implemented in `zoned_ipc`.

use serde::Deserialize;
use serde::Serialize;

pub mod guard;
pub mod host;

/// Zone id that no real zone may use. Calls originating on the host side
/// carry it as their caller id.
pub const HOST_ID: &str = "host";

/// Stable wire codes for the error taxonomy. These never change once
/// released; clients match on them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    InvalidId = 1,
    InvalidState = 2,
    Forbidden = 3,
    Internal = 4,
    Forwarded = 5,
    Io = 6,
    ZoneStopped = 7,
}

impl ErrorCode {
    pub fn from_wire(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::InvalidId),
            2 => Some(Self::InvalidState),
            3 => Some(Self::Forbidden),
            4 => Some(Self::Internal),
            5 => Some(Self::Forwarded),
            6 => Some(Self::Io),
            7 => Some(Self::ZoneStopped),
            _ => None,
        }
    }
}

/// An error as it travels over the wire: a stable code plus the
/// human-readable message produced at the point of failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidId, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Lifecycle states of a zone as reported by the supervisor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Paused,
    Aborting,
}

impl ZoneState {
    /// The wire spelling. A paused zone reports `FROZEN`, after the
    /// freezer cgroup state that backs it.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Paused => "FROZEN",
            Self::Aborting => "ABORTING",
        }
    }
}

impl std::fmt::Display for ZoneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Empty payload for methods that take or return nothing.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Void {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip() {
        for code in [
            ErrorCode::InvalidId,
            ErrorCode::InvalidState,
            ErrorCode::Forbidden,
            ErrorCode::Internal,
            ErrorCode::Forwarded,
            ErrorCode::Io,
            ErrorCode::ZoneStopped,
        ] {
            assert_eq!(ErrorCode::from_wire(code as i32), Some(code));
        }
        assert_eq!(ErrorCode::from_wire(0), None);
        assert_eq!(ErrorCode::from_wire(8), None);
    }

    #[test]
    fn paused_is_frozen_on_the_wire() {
        assert_eq!(ZoneState::Paused.as_wire(), "FROZEN");
        assert_eq!(ZoneState::Running.as_wire(), "RUNNING");
    }
}
