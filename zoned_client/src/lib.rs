/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! zoned_client
//! ============
//!
//! Typed client for the supervisor's host socket. Every call resolves to
//! a [CallStatus] carrying the wire error taxonomy and the human-readable
//! message; transport failures map to [Status::Io].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use zoned_api::host as api;
use zoned_api::ErrorCode;
use zoned_api::Void;
use zoned_ipc::client::DEFAULT_CALL_TIMEOUT;
use zoned_ipc::Client;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    InvalidId,
    InvalidState,
    Forbidden,
    Internal,
    Forwarded,
    Io,
    ZoneStopped,
    /// The peer returned a code outside the known taxonomy.
    Unknown,
}

impl From<ErrorCode> for Status {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidId => Status::InvalidId,
            ErrorCode::InvalidState => Status::InvalidState,
            ErrorCode::Forbidden => Status::Forbidden,
            ErrorCode::Internal => Status::Internal,
            ErrorCode::Forwarded => Status::Forwarded,
            ErrorCode::Io => Status::Io,
            ErrorCode::ZoneStopped => Status::ZoneStopped,
        }
    }
}

/// What a failed call looks like to a user of this library.
#[derive(Debug, thiserror::Error)]
#[error("{status:?}: {message}")]
pub struct CallStatus {
    pub status: Status,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, CallStatus>;

impl From<zoned_ipc::Error> for CallStatus {
    fn from(error: zoned_ipc::Error) -> Self {
        match error {
            zoned_ipc::Error::Remote { code, message } => CallStatus {
                status: ErrorCode::from_wire(code)
                    .map(Status::from)
                    .unwrap_or(Status::Unknown),
                message,
            },
            other => CallStatus {
                status: Status::Io,
                message: other.to_string(),
            },
        }
    }
}

pub struct ZonedClient {
    client: Client,
}

impl ZonedClient {
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let client = Client::connect(socket_path)?;
        Ok(Self { client })
    }

    fn call<Req: Serialize, Rep: DeserializeOwned>(
        &mut self,
        method: u32,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Rep> {
        Ok(self.client.call(method, request, timeout)?)
    }

    fn zone_call<Rep: DeserializeOwned>(
        &mut self,
        method: u32,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<Rep> {
        self.call(method, &api::ZoneId { id: id.to_string() }, timeout)
    }

    pub fn lock_queue(&mut self) -> Result<()> {
        let _: Void = self.call(api::METHOD_LOCK_QUEUE, &Void {}, Some(DEFAULT_CALL_TIMEOUT))?;
        Ok(())
    }

    pub fn unlock_queue(&mut self) -> Result<()> {
        let _: Void = self.call(
            api::METHOD_UNLOCK_QUEUE,
            &Void {},
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(())
    }

    /// Zone ids in creation order.
    pub fn get_zone_ids(&mut self) -> Result<Vec<String>> {
        let reply: api::ZoneIds = self.call(
            api::METHOD_GET_ZONE_ID_LIST,
            &Void {},
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(reply.ids)
    }

    /// The focused zone id, or empty when none is running.
    pub fn get_active_zone_id(&mut self) -> Result<String> {
        let reply: api::ZoneId = self.call(
            api::METHOD_GET_ACTIVE_ZONE_ID,
            &Void {},
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(reply.id)
    }

    pub fn get_zone_info(&mut self, id: &str) -> Result<api::ZoneInfo> {
        self.zone_call(api::METHOD_GET_ZONE_INFO, id, Some(DEFAULT_CALL_TIMEOUT))
    }

    /// Infinite timeout: creation copies the rootfs image.
    pub fn create_zone(&mut self, id: &str, template_name: &str) -> Result<()> {
        let _: Void = self.call(
            api::METHOD_CREATE_ZONE,
            &api::CreateZone {
                id: id.to_string(),
                template_name: template_name.to_string(),
            },
            None,
        )?;
        Ok(())
    }

    pub fn destroy_zone(&mut self, id: &str) -> Result<()> {
        let _: Void = self.zone_call(api::METHOD_DESTROY_ZONE, id, None)?;
        Ok(())
    }

    pub fn start_zone(&mut self, id: &str) -> Result<()> {
        let _: Void = self.zone_call(api::METHOD_START_ZONE, id, None)?;
        Ok(())
    }

    pub fn shutdown_zone(&mut self, id: &str) -> Result<()> {
        let _: Void = self.zone_call(api::METHOD_SHUTDOWN_ZONE, id, None)?;
        Ok(())
    }

    pub fn lock_zone(&mut self, id: &str) -> Result<()> {
        let _: Void = self.zone_call(api::METHOD_LOCK_ZONE, id, Some(DEFAULT_CALL_TIMEOUT))?;
        Ok(())
    }

    pub fn unlock_zone(&mut self, id: &str) -> Result<()> {
        let _: Void = self.zone_call(api::METHOD_UNLOCK_ZONE, id, Some(DEFAULT_CALL_TIMEOUT))?;
        Ok(())
    }

    pub fn set_active_zone(&mut self, id: &str) -> Result<()> {
        let _: Void = self.zone_call(api::METHOD_SET_ACTIVE_ZONE, id, Some(DEFAULT_CALL_TIMEOUT))?;
        Ok(())
    }

    pub fn switch_to_default(&mut self) -> Result<()> {
        let _: Void = self.call(
            api::METHOD_SWITCH_TO_DEFAULT,
            &Void {},
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(())
    }

    pub fn grant_device(&mut self, zone: &str, device: &str, flags: u32) -> Result<()> {
        let _: Void = self.call(
            api::METHOD_GRANT_DEVICE,
            &api::GrantDevice {
                zone: zone.to_string(),
                device: device.to_string(),
                flags,
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(())
    }

    pub fn revoke_device(&mut self, zone: &str, device: &str) -> Result<()> {
        let _: Void = self.call(
            api::METHOD_REVOKE_DEVICE,
            &api::RevokeDevice {
                zone: zone.to_string(),
                device: device.to_string(),
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(())
    }

    pub fn declare_file(&mut self, zone: &str, path: &str, flags: i32, mode: u32) -> Result<String> {
        let reply: api::DeclarationId = self.call(
            api::METHOD_DECLARE_FILE,
            &api::DeclareFile {
                zone: zone.to_string(),
                path: path.to_string(),
                flags,
                mode,
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(reply.id)
    }

    pub fn declare_mount(
        &mut self,
        zone: &str,
        source: &str,
        target: &str,
        fs_type: &str,
        flags: u64,
        data: &str,
    ) -> Result<String> {
        let reply: api::DeclarationId = self.call(
            api::METHOD_DECLARE_MOUNT,
            &api::DeclareMount {
                zone: zone.to_string(),
                source: source.to_string(),
                target: target.to_string(),
                fs_type: fs_type.to_string(),
                flags,
                data: data.to_string(),
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(reply.id)
    }

    pub fn declare_link(&mut self, zone: &str, source: &str, target: &str) -> Result<String> {
        let reply: api::DeclarationId = self.call(
            api::METHOD_DECLARE_LINK,
            &api::DeclareLink {
                zone: zone.to_string(),
                source: source.to_string(),
                target: target.to_string(),
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(reply.id)
    }

    pub fn get_declarations(&mut self, zone: &str) -> Result<Vec<String>> {
        let reply: api::Declarations =
            self.zone_call(api::METHOD_GET_DECLARATIONS, zone, Some(DEFAULT_CALL_TIMEOUT))?;
        Ok(reply.ids)
    }

    pub fn remove_declaration(&mut self, zone: &str, declaration: &str) -> Result<()> {
        let _: Void = self.call(
            api::METHOD_REMOVE_DECLARATION,
            &api::RemoveDeclaration {
                zone: zone.to_string(),
                declaration: declaration.to_string(),
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(())
    }

    /// Create a file inside a zone; the open descriptor arrives over the
    /// socket.
    pub fn create_file(
        &mut self,
        zone: &str,
        path: &str,
        flags: i32,
        mode: u32,
    ) -> Result<std::os::fd::OwnedFd> {
        let _: api::FileHandle = self.call(
            api::METHOD_CREATE_FILE,
            &api::CreateFile {
                zone: zone.to_string(),
                path: path.to_string(),
                flags,
                mode,
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(self.client.recv_fd()?)
    }

    pub fn create_netdev_veth(&mut self, zone: &str, zone_dev: &str, host_dev: &str) -> Result<()> {
        let _: Void = self.call(
            api::METHOD_CREATE_NETDEV_VETH,
            &api::CreateNetdevVeth {
                zone: zone.to_string(),
                zone_dev: zone_dev.to_string(),
                host_dev: host_dev.to_string(),
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(())
    }

    pub fn get_netdev_list(&mut self, zone: &str) -> Result<Vec<String>> {
        let reply: api::NetdevList =
            self.zone_call(api::METHOD_GET_NETDEV_LIST, zone, Some(DEFAULT_CALL_TIMEOUT))?;
        Ok(reply.devs)
    }

    pub fn get_netdev_attrs(
        &mut self,
        zone: &str,
        dev: &str,
    ) -> Result<BTreeMap<String, String>> {
        let reply: api::NetdevAttrs = self.call(
            api::METHOD_GET_NETDEV_ATTRS,
            &api::NetdevRef {
                zone: zone.to_string(),
                dev: dev.to_string(),
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(reply.attrs)
    }

    /// Register this connection as a zone agent; notifications for the
    /// zone are delivered here from now on.
    pub fn register_zone_agent(&mut self, zone: &str) -> Result<()> {
        let _: Void = self.call(
            api::METHOD_REGISTER_ZONE_AGENT,
            &api::RegisterZoneAgent {
                zone: zone.to_string(),
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(())
    }

    pub fn notify_active_zone(&mut self, application: &str, message: &str) -> Result<()> {
        let _: Void = self.call(
            api::METHOD_NOTIFY_ACTIVE_ZONE,
            &api::NotifyActiveZone {
                application: application.to_string(),
                message: message.to_string(),
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(())
    }

    pub fn file_move_request(
        &mut self,
        source: &str,
        destination: &str,
        path: &str,
    ) -> Result<String> {
        let reply: api::FileMoveResult = self.call(
            api::METHOD_FILE_MOVE_REQUEST,
            &api::FileMoveRequest {
                source: source.to_string(),
                destination: destination.to_string(),
                path: path.to_string(),
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )?;
        Ok(reply.status)
    }

    pub fn proxy_call(
        &mut self,
        target: &str,
        bus_name: &str,
        object_path: &str,
        interface: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.call(
            api::METHOD_PROXY_CALL,
            &api::ProxyCall {
                caller: String::new(),
                target: target.to_string(),
                target_bus_name: bus_name.to_string(),
                target_object_path: object_path.to_string(),
                target_interface: interface.to_string(),
                target_method: method.to_string(),
                args,
            },
            Some(DEFAULT_CALL_TIMEOUT),
        )
    }

    /// Block until a Notification signal arrives.
    pub fn wait_notification(&mut self, timeout: Duration) -> Result<api::Notification> {
        let frame = self
            .client
            .wait_incoming(api::SIGNAL_NOTIFICATION, Some(timeout))?;
        frame.parse().map_err(CallStatus::from)
    }

    /// For registered service endpoints: answer the next forwarded proxy
    /// call with `handler`'s value.
    pub fn serve_one_proxy_call<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnOnce(api::ProxyCall) -> serde_json::Value,
    {
        let frame = self
            .client
            .wait_incoming(api::METHOD_PROXY_CALL, Some(DEFAULT_CALL_TIMEOUT))?;
        let request: api::ProxyCall = frame.parse().map_err(CallStatus::from)?;
        let value = handler(request);
        self.client.reply_ok(frame.id, &value)?;
        Ok(())
    }

    /// GetZoneIds with an explicit client-side timeout; the default is
    /// [DEFAULT_CALL_TIMEOUT].
    pub fn get_zone_ids_with_timeout(&mut self, timeout: Duration) -> Result<Vec<String>> {
        let reply: api::ZoneIds =
            self.call(api::METHOD_GET_ZONE_ID_LIST, &Void {}, Some(timeout))?;
        Ok(reply.ids)
    }
}
