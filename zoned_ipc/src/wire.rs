/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Message framing. Every message on a socket is:
//!
//! ```text
//! [ len: u32 LE ][ method: u32 LE ][ message id: u64 LE ][ payload ... ]
//! ```
//!
//! where `len` counts everything after itself (12 header bytes plus the
//! payload). Three method ids at the top of the range are reserved for the
//! transport; application tables start at 2.

use std::io;
use std::io::Read;
use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Reply carrying the result of an earlier request.
pub const RETURN_METHOD_ID: u32 = u32::MAX;
/// A peer announces the set of signal methods it will emit.
pub const REGISTER_SIGNAL_METHOD_ID: u32 = u32::MAX - 1;
/// Reply carrying an error code and a UTF-8 message.
pub const ERROR_METHOD_ID: u32 = u32::MAX - 2;

/// Refuse anything larger; a peer sending such a frame is broken or
/// hostile and gets disconnected.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

const HEADER_LEN: u32 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub method: u32,
    pub id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new<T: Serialize>(method: u32, id: u64, payload: &T) -> Result<Self> {
        Ok(Self {
            method,
            id,
            payload: serde_json::to_vec(payload)?,
        })
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Payload of an [ERROR_METHOD_ID] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

/// Payload of a [REGISTER_SIGNAL_METHOD_ID] frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSet {
    pub methods: Vec<u32>,
}

pub fn write_frame<W: Write>(mut w: W, frame: &Frame) -> Result<()> {
    let len = HEADER_LEN + frame.payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(Error::Malformed(format!("frame too large: {len} bytes")));
    }
    let mut buf = Vec::with_capacity(4 + len as usize);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&frame.method.to_le_bytes());
    buf.extend_from_slice(&frame.id.to_le_bytes());
    buf.extend_from_slice(&frame.payload);
    w.write_all(&buf)?;
    Ok(())
}

/// Blocking read of one complete frame. Returns [Error::Disconnected] on
/// clean EOF at a frame boundary.
pub fn read_frame<R: Read>(mut r: R) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(Error::Disconnected),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len < HEADER_LEN {
        return Err(Error::Malformed(format!("frame length {len} below header")));
    }
    if len > MAX_FRAME_LEN {
        return Err(Error::Malformed(format!("frame too large: {len} bytes")));
    }
    let mut head = [0u8; 12];
    r.read_exact(&mut head)?;
    let method = u32::from_le_bytes(head[0..4].try_into().expect("slice is 4 bytes"));
    let id = u64::from_le_bytes(head[4..12].try_into().expect("slice is 8 bytes"));
    let mut payload = vec![0u8; (len - HEADER_LEN) as usize];
    r.read_exact(&mut payload)?;
    Ok(Frame {
        method,
        id,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::new(7, 42, &serde_json::json!({"id": "z1"})).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        let back = read_frame(buf.as_slice()).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn empty_payload_frame() {
        let frame = Frame {
            method: RETURN_METHOD_ID,
            id: 1,
            payload: Vec::new(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(read_frame(buf.as_slice()).unwrap(), frame);
    }

    #[test]
    fn eof_reports_disconnect() {
        let buf: &[u8] = &[];
        assert!(matches!(read_frame(buf), Err(Error::Disconnected)));
    }

    #[test]
    fn oversized_length_is_malformed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        assert!(matches!(read_frame(buf.as_slice()), Err(Error::Malformed(_))));
    }

    #[test]
    fn undersized_length_is_malformed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_le_bytes());
        assert!(matches!(read_frame(buf.as_slice()), Err(Error::Malformed(_))));
    }

    #[test]
    fn reserved_ids_do_not_collide() {
        assert_ne!(RETURN_METHOD_ID, REGISTER_SIGNAL_METHOD_ID);
        assert_ne!(RETURN_METHOD_ID, ERROR_METHOD_ID);
        assert_ne!(REGISTER_SIGNAL_METHOD_ID, ERROR_METHOD_ID);
    }
}
