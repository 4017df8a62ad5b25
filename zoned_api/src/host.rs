/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Method ids and payloads of the supervisor's host socket. The numbering
//! is a stable enumeration starting at 2 (0 and 1 are never used; the
//! reserved transport ids live at the top of the u32 range, see
//! `zoned_ipc::wire`).

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

pub const METHOD_GET_ZONE_ID_LIST: u32 = 2;
pub const METHOD_GET_ACTIVE_ZONE_ID: u32 = 3;
pub const METHOD_GET_ZONE_INFO: u32 = 4;
pub const METHOD_SET_NETDEV_ATTRS: u32 = 5;
pub const METHOD_GET_NETDEV_ATTRS: u32 = 6;
pub const METHOD_GET_NETDEV_LIST: u32 = 7;
pub const METHOD_CREATE_NETDEV_VETH: u32 = 8;
pub const METHOD_CREATE_NETDEV_MACVLAN: u32 = 9;
pub const METHOD_CREATE_NETDEV_PHYS: u32 = 10;
pub const METHOD_DELETE_NETDEV_IP_ADDRESS: u32 = 11;
pub const METHOD_DESTROY_NETDEV: u32 = 12;
pub const METHOD_DECLARE_FILE: u32 = 13;
pub const METHOD_DECLARE_MOUNT: u32 = 14;
pub const METHOD_DECLARE_LINK: u32 = 15;
pub const METHOD_GET_DECLARATIONS: u32 = 16;
pub const METHOD_REMOVE_DECLARATION: u32 = 17;
pub const METHOD_SET_ACTIVE_ZONE: u32 = 18;
pub const METHOD_CREATE_ZONE: u32 = 19;
pub const METHOD_DESTROY_ZONE: u32 = 20;
pub const METHOD_SHUTDOWN_ZONE: u32 = 21;
pub const METHOD_START_ZONE: u32 = 22;
pub const METHOD_LOCK_ZONE: u32 = 23;
pub const METHOD_UNLOCK_ZONE: u32 = 24;
pub const METHOD_GRANT_DEVICE: u32 = 25;
pub const METHOD_REVOKE_DEVICE: u32 = 26;
pub const METHOD_CREATE_FILE: u32 = 27;
pub const METHOD_LOCK_QUEUE: u32 = 28;
pub const METHOD_UNLOCK_QUEUE: u32 = 29;
pub const METHOD_SWITCH_TO_DEFAULT: u32 = 30;
pub const METHOD_PROXY_CALL: u32 = 31;
pub const METHOD_REGISTER_ZONE_AGENT: u32 = 32;

pub const METHOD_NOTIFY_ACTIVE_ZONE: u32 = 100;
pub const METHOD_FILE_MOVE_REQUEST: u32 = 101;
pub const SIGNAL_NOTIFICATION: u32 = 102;
pub const SIGNAL_CONNECTION_STATE: u32 = 103;

pub const FILE_MOVE_DESTINATION_NOT_FOUND: &str = "FILE_MOVE_DESTINATION_NOT_FOUND";
pub const FILE_MOVE_WRONG_DESTINATION: &str = "FILE_MOVE_WRONG_DESTINATION";
pub const FILE_MOVE_NO_PERMISSIONS_SEND: &str = "FILE_MOVE_NO_PERMISSIONS_SEND";
pub const FILE_MOVE_NO_PERMISSIONS_RECEIVE: &str = "FILE_MOVE_NO_PERMISSIONS_RECEIVE";
pub const FILE_MOVE_FAILED: &str = "FILE_MOVE_FAILED";
pub const FILE_MOVE_SUCCEEDED: &str = "FILE_MOVE_SUCCEEDED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneId {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneIds {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneInfo {
    pub id: String,
    pub vt: i32,
    pub state: String,
    pub root_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateZone {
    pub id: String,
    pub template_name: String,
}

/// What kind of object a declaration provisions inside the zone rootfs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclarationKind {
    File,
    Mount,
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclareFile {
    pub zone: String,
    pub path: String,
    pub flags: i32,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclareMount {
    pub zone: String,
    pub source: String,
    pub target: String,
    pub fs_type: String,
    pub flags: u64,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclareLink {
    pub zone: String,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationId {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declarations {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDeclaration {
    pub zone: String,
    pub declaration: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantDevice {
    pub zone: String,
    /// Path relative to `/dev`, e.g. `tty10`.
    pub device: String,
    /// Open flags (`O_RDONLY`/`O_WRONLY`/`O_RDWR`) selecting permissions.
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeDevice {
    pub zone: String,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFile {
    pub zone: String,
    /// Path inside the zone rootfs.
    pub path: String,
    pub flags: i32,
    pub mode: u32,
}

/// Reply to [CreateFile]; the descriptor itself travels out of band as an
/// SCM_RIGHTS control message on the same socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHandle {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCall {
    pub caller: String,
    pub target: String,
    pub target_bus_name: String,
    pub target_object_path: String,
    pub target_interface: String,
    pub target_method: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterZoneAgent {
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyActiveZone {
    pub application: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMoveRequest {
    pub source: String,
    pub destination: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMoveResult {
    pub status: String,
}

/// Broadcast to the active zone's agent (and any subscribed host peers)
/// when another zone posts a notification or completes a file move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub zone: String,
    pub application: String,
    pub message: String,
}

/// Broadcast whenever a peer registers as a zone agent or disconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub zone: String,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNetdevVeth {
    pub zone: String,
    pub zone_dev: String,
    pub host_dev: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNetdevMacvlan {
    pub zone: String,
    pub zone_dev: String,
    pub host_dev: String,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNetdevPhys {
    pub zone: String,
    pub dev: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetdevRef {
    pub zone: String,
    pub dev: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetdevList {
    pub devs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetdevAttrs {
    pub attrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNetdevAttrs {
    pub zone: String,
    pub dev: String,
    pub attrs: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn method_ids_are_stable() {
        // The low table starts at 2 and the zone-originated table at 100.
        // Shifting any of these breaks every deployed client.
        assert_eq!(METHOD_GET_ZONE_ID_LIST, 2);
        assert_eq!(METHOD_SWITCH_TO_DEFAULT, 30);
        assert_eq!(METHOD_NOTIFY_ACTIVE_ZONE, 100);
        assert_eq!(SIGNAL_CONNECTION_STATE, 103);
    }

    #[test]
    fn payloads_round_trip_through_json() {
        let call = ProxyCall {
            caller: "host".into(),
            target: "z1".into(),
            target_bus_name: "org.example".into(),
            target_object_path: "/org/example".into(),
            target_interface: "org.example.Iface".into(),
            target_method: "Ping".into(),
            args: serde_json::json!({"n": 1}),
        };
        let bytes = serde_json::to_vec(&call).unwrap();
        let back: ProxyCall = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(call, back);
    }
}
