/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! zoned_ipc
//! =========
//!
//! The transport layer shared by the supervisor and the guards: an epoll
//! event loop, signalfd integration, length-prefixed message framing over
//! unix-domain stream sockets, a multi-peer [Service] endpoint, a blocking
//! [Client], and SCM_RIGHTS descriptor transfer.
//!
//! Replies are keyed by message id and may arrive out of request order;
//! requests addressed to the same peer are executed in the order received.

use std::io;

pub mod client;
pub mod event;
pub mod fdpass;
pub mod service;
pub mod sigfd;
pub mod wire;

pub use client::Client;
pub use event::EventLoop;
pub use service::PeerId;
pub use service::Service;
pub use service::ServiceEvent;
pub use sigfd::SignalWatch;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("peer disconnected")]
    Disconnected,
    #[error("call timed out")]
    Timeout,
    #[error("peer returned error {code}: {message}")]
    Remote { code: i32, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
