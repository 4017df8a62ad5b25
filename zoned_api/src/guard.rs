/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Method ids and payloads of the per-zone guard socket. The supervisor is
//! the only legitimate peer; the guard announces itself with `GuardReady`
//! as soon as the supervisor connects.

use serde::Deserialize;
use serde::Serialize;

pub const METHOD_GUARD_READY: u32 = 2;
pub const METHOD_SET_CONFIG: u32 = 3;
pub const METHOD_GET_CONFIG: u32 = 4;
pub const METHOD_START: u32 = 5;
pub const METHOD_STOP: u32 = 6;
pub const METHOD_RESIZE_TERM: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPid {
    pub pid: i32,
}

/// Wait status of the init process, delivered as the asynchronous reply
/// to `Stop` once the guard reaps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub status: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeTerm {
    pub terminal: u32,
    pub rows: u16,
    pub cols: u16,
}
