/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Virtual network device management. rtnetlink needs an async reactor,
//! so every operation runs on a short-lived thread that optionally
//! enters the zone's network namespace first (setns with CLONE_NEWNET is
//! per-thread) and drives a current-thread tokio runtime to completion.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use futures_util::TryStreamExt;
use netlink_packet_route::link::LinkFlag;
use nix::unistd::Pid;
use tracing::debug;

use zoned_ns::NsKind;

use crate::Error;
use crate::Result;

fn netns_file(init_pid: Pid) -> Result<File> {
    let path = zoned_ns::ns_path(init_pid, NsKind::Net);
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(&path)
        .map_err(|e| Error::internal(format!("cannot open {}: {e}", path.display())))
}

/// Run `f` against an rtnetlink handle, inside the network namespace of
/// `init_pid` when given.
fn with_handle<T, F, Fut>(init_pid: Option<Pid>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(rtnetlink::Handle) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<T>>,
{
    let netns = init_pid.map(netns_file).transpose()?;
    let worker = std::thread::Builder::new()
        .name("zoned-netdev".to_string())
        .spawn(move || -> Result<T> {
            if let Some(netns) = netns {
                nix::sched::setns(&netns, nix::sched::CloneFlags::CLONE_NEWNET)
                    .map_err(|e| Error::internal(format!("setns into zone netns failed: {e}")))?;
            }
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
                .map_err(|e| Error::internal(format!("cannot build netlink runtime: {e}")))?;
            runtime.block_on(async move {
                let (connection, handle, _) = rtnetlink::new_connection()
                    .map_err(|e| Error::internal(format!("netlink connection failed: {e}")))?;
                tokio::spawn(connection);
                f(handle).await
            })
        })
        .map_err(Error::Io)?;
    worker
        .join()
        .map_err(|_| Error::internal("netdev worker panicked"))?
}

async fn link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32> {
    let link = handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute()
        .try_next()
        .await
        .map_err(|e| Error::internal(format!("cannot look up link {name}: {e}")))?
        .ok_or_else(|| Error::internal(format!("no such network device: {name}")))?;
    Ok(link.header.index)
}

/// Create a veth pair; the host end stays, the zone end moves into the
/// zone's network namespace.
pub fn create_veth(init_pid: Pid, zone_dev: &str, host_dev: &str) -> Result<()> {
    let zone_dev = zone_dev.to_string();
    let host_dev = host_dev.to_string();
    let netns = netns_file(init_pid)?;
    with_handle(None, move |handle| async move {
        debug!("creating veth pair {zone_dev} <-> {host_dev}");
        handle
            .link()
            .add()
            .veth(zone_dev.clone(), host_dev.clone())
            .execute()
            .await
            .map_err(|e| Error::internal(format!("cannot create veth pair: {e}")))?;
        let index = link_index(&handle, &zone_dev).await?;
        handle
            .link()
            .set(index)
            .setns_by_fd(netns.as_raw_fd())
            .execute()
            .await
            .map_err(|e| Error::internal(format!("cannot move {zone_dev} into zone: {e}")))?;
        Ok(())
    })
}

/// Create a macvlan on top of a host device and move it into the zone.
pub fn create_macvlan(init_pid: Pid, zone_dev: &str, host_dev: &str, mode: u32) -> Result<()> {
    let zone_dev = zone_dev.to_string();
    let host_dev = host_dev.to_string();
    let netns = netns_file(init_pid)?;
    with_handle(None, move |handle| async move {
        let parent = link_index(&handle, &host_dev).await?;
        handle
            .link()
            .add()
            .macvlan(zone_dev.clone(), parent, mode)
            .execute()
            .await
            .map_err(|e| Error::internal(format!("cannot create macvlan: {e}")))?;
        let index = link_index(&handle, &zone_dev).await?;
        handle
            .link()
            .set(index)
            .setns_by_fd(netns.as_raw_fd())
            .execute()
            .await
            .map_err(|e| Error::internal(format!("cannot move {zone_dev} into zone: {e}")))?;
        Ok(())
    })
}

/// Move an existing physical device into the zone.
pub fn move_phys(init_pid: Pid, dev: &str) -> Result<()> {
    let dev = dev.to_string();
    let netns = netns_file(init_pid)?;
    with_handle(None, move |handle| async move {
        let index = link_index(&handle, &dev).await?;
        handle
            .link()
            .set(index)
            .setns_by_fd(netns.as_raw_fd())
            .execute()
            .await
            .map_err(|e| Error::internal(format!("cannot move {dev} into zone: {e}")))?;
        Ok(())
    })
}

/// Names of the links visible inside the zone.
pub fn list(init_pid: Pid) -> Result<Vec<String>> {
    with_handle(Some(init_pid), |handle| async move {
        let mut names = Vec::new();
        let mut links = handle.link().get().execute();
        while let Some(link) = links
            .try_next()
            .await
            .map_err(|e| Error::internal(format!("cannot list links: {e}")))?
        {
            use netlink_packet_route::link::LinkAttribute;
            for attr in &link.attributes {
                if let LinkAttribute::IfName(name) = attr {
                    names.push(name.clone());
                }
            }
        }
        Ok(names)
    })
}

/// A snapshot of the interesting attributes of one zone device.
pub fn get_attrs(init_pid: Pid, dev: &str) -> Result<BTreeMap<String, String>> {
    let dev = dev.to_string();
    with_handle(Some(init_pid), move |handle| async move {
        let link = handle
            .link()
            .get()
            .match_name(dev.clone())
            .execute()
            .try_next()
            .await
            .map_err(|e| Error::internal(format!("cannot look up link {dev}: {e}")))?
            .ok_or_else(|| Error::internal(format!("no such network device: {dev}")))?;

        let mut attrs = BTreeMap::new();
        attrs.insert("index".to_string(), link.header.index.to_string());
        attrs.insert(
            "flags".to_string(),
            if link.header.flags.contains(&LinkFlag::Up) {
                "up".to_string()
            } else {
                "down".to_string()
            },
        );
        use netlink_packet_route::link::LinkAttribute;
        for attr in &link.attributes {
            match attr {
                LinkAttribute::Mtu(mtu) => {
                    attrs.insert("mtu".to_string(), mtu.to_string());
                }
                LinkAttribute::Address(mac) => {
                    let mac = mac
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<Vec<_>>()
                        .join(":");
                    attrs.insert("address".to_string(), mac);
                }
                _ => {}
            }
        }
        Ok(attrs)
    })
}

/// Apply settable attributes: `mtu` and `flags` (`up`/`down`).
pub fn set_attrs(init_pid: Pid, dev: &str, attrs: BTreeMap<String, String>) -> Result<()> {
    let dev = dev.to_string();
    with_handle(Some(init_pid), move |handle| async move {
        let index = link_index(&handle, &dev).await?;
        for (key, value) in &attrs {
            match key.as_str() {
                "mtu" => {
                    let mtu: u32 = value
                        .parse()
                        .map_err(|_| Error::internal(format!("bad mtu value: {value}")))?;
                    handle
                        .link()
                        .set(index)
                        .mtu(mtu)
                        .execute()
                        .await
                        .map_err(|e| Error::internal(format!("cannot set mtu: {e}")))?;
                }
                "flags" => {
                    let request = handle.link().set(index);
                    let request = match value.as_str() {
                        "up" => request.up(),
                        "down" => request.down(),
                        other => {
                            return Err(Error::internal(format!("bad flags value: {other}")));
                        }
                    };
                    request
                        .execute()
                        .await
                        .map_err(|e| Error::internal(format!("cannot set flags: {e}")))?;
                }
                other => {
                    return Err(Error::internal(format!("unknown attribute: {other}")));
                }
            }
        }
        Ok(())
    })
}

/// Delete a link inside the zone.
pub fn destroy(init_pid: Pid, dev: &str) -> Result<()> {
    let dev = dev.to_string();
    with_handle(Some(init_pid), move |handle| async move {
        let index = link_index(&handle, &dev).await?;
        handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| Error::internal(format!("cannot delete {dev}: {e}")))?;
        Ok(())
    })
}

/// Remove every IP address from a link inside the zone.
pub fn delete_ip_addresses(init_pid: Pid, dev: &str) -> Result<()> {
    let dev = dev.to_string();
    with_handle(Some(init_pid), move |handle| async move {
        let index = link_index(&handle, &dev).await?;
        let mut addresses = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut pending = Vec::new();
        while let Some(message) = addresses
            .try_next()
            .await
            .map_err(|e| Error::internal(format!("cannot list addresses: {e}")))?
        {
            pending.push(message);
        }
        for message in pending {
            handle
                .address()
                .del(message)
                .execute()
                .await
                .map_err(|e| Error::internal(format!("cannot delete address: {e}")))?;
        }
        Ok(())
    })
}
