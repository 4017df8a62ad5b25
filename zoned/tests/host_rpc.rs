/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end exercises of the host RPC surface: a real server thread on
//! a real unix socket, driven through the typed client library. Zones
//! are never started (that needs root and a kernel), so the lifecycle
//! assertions stop at the STOPPED-state behaviors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use zoned::config::DaemonConfig;
use zoned::manager::ZonesManager;
use zoned::policy::ProxyCallRule;
use zoned::server::Server;
use zoned_client::Status;
use zoned_client::ZonedClient;

struct TestDaemon {
    _dir: tempfile::TempDir,
    socket_path: PathBuf,
}

fn spawn_daemon(rules: Vec<ProxyCallRule>) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("zones")).unwrap();
    std::fs::create_dir_all(root.join("templates")).unwrap();
    std::fs::create_dir_all(root.join("run")).unwrap();
    std::fs::write(
        root.join("templates/default.conf"),
        r#"{
            "id": "~NAME~",
            "template_name": "default",
            "init_argv": ["/sbin/init"],
            "namespaces": ["Mnt", "Pid", "Uts", "Ipc", "Net"],
            "vt": ~VT~,
            "ip_third_octet": ~IP~,
            "priority": 10,
            "permitted_to_send": ["/tmp/ut-zones/.*"],
            "permitted_to_recv": ["/tmp/ut-zones/.*"]
        }"#,
    )
    .unwrap();

    let config = DaemonConfig {
        zones_path: root.join("zones"),
        work_path: root.join("run"),
        socket_path: root.join("run/host.socket"),
        db_path: root.join("db.json"),
        zone_config_dir: root.join("zone-configs"),
        template_dir: root.join("templates"),
        zone_image_path: None,
        default_id: String::new(),
        foreground_id: String::new(),
        proxy_call_rules: rules,
        cgroup_root: root.join("cgroup"),
        activate_vt: false,
        guard_path: "/nonexistent/zoned-guard".into(),
        guard_logger: Default::default(),
    };
    let socket_path = config.socket_path.clone();

    let manager = Arc::new(ZonesManager::load(config).unwrap());
    let mut server = Server::new(manager).unwrap();
    std::thread::spawn(move || {
        let _ = server.run();
    });

    // Wait for the socket to come up.
    for _ in 0..100 {
        if socket_path.exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    TestDaemon {
        _dir: dir,
        socket_path,
    }
}

fn allow_all_rule() -> ProxyCallRule {
    ProxyCallRule {
        caller: "*".into(),
        target: "*".into(),
        target_bus_name: "*".into(),
        target_object_path: "*".into(),
        target_interface: "*".into(),
        target_method: "*".into(),
    }
}

#[test]
fn create_list_info_destroy() {
    let daemon = spawn_daemon(Vec::new());
    let mut client = ZonedClient::connect(&daemon.socket_path).unwrap();

    assert!(client.get_zone_ids().unwrap().is_empty());
    client.create_zone("z1", "default").unwrap();
    client.create_zone("z2", "default").unwrap();
    assert_eq!(client.get_zone_ids().unwrap(), vec!["z1", "z2"]);

    for id in client.get_zone_ids().unwrap() {
        let info = client.get_zone_info(&id).unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.state, "STOPPED");
    }

    // No running zone, so nothing is active.
    assert_eq!(client.get_active_zone_id().unwrap(), "");

    client.destroy_zone("z1").unwrap();
    assert_eq!(client.get_zone_ids().unwrap(), vec!["z2"]);
    client.destroy_zone("z2").unwrap();
    assert!(client.get_zone_ids().unwrap().is_empty());
}

#[test]
fn invalid_ids_surface_as_invalid_id_status() {
    let daemon = spawn_daemon(Vec::new());
    let mut client = ZonedClient::connect(&daemon.socket_path).unwrap();

    let err = client.get_zone_info("ghost").unwrap_err();
    assert_eq!(err.status, Status::InvalidId);

    let err = client.create_zone("host", "default").unwrap_err();
    assert_eq!(err.status, Status::InvalidId);

    client.create_zone("z1", "default").unwrap();
    let err = client.create_zone("z1", "default").unwrap_err();
    assert_eq!(err.status, Status::InvalidId);
}

#[test]
fn lock_and_activate_respect_zone_state() {
    let daemon = spawn_daemon(Vec::new());
    let mut client = ZonedClient::connect(&daemon.socket_path).unwrap();
    client.create_zone("z1", "default").unwrap();

    let err = client.lock_zone("z1").unwrap_err();
    assert_eq!(err.status, Status::InvalidState);
    let err = client.unlock_zone("z1").unwrap_err();
    assert_eq!(err.status, Status::InvalidState);

    let err = client.set_active_zone("z1").unwrap_err();
    assert_eq!(err.status, Status::ZoneStopped);
}

#[test]
fn declarations_round_trip_over_the_wire() {
    let daemon = spawn_daemon(Vec::new());
    let mut client = ZonedClient::connect(&daemon.socket_path).unwrap();
    client.create_zone("z1", "default").unwrap();

    let file_id = client.declare_file("z1", "/tmp/f", 0, 0o644).unwrap();
    let link_id = client.declare_link("z1", "/etc/hosts", "/tmp/hosts").unwrap();
    let mount_id = client
        .declare_mount("z1", "tmpfs", "/tmp/m", "tmpfs", 0, "")
        .unwrap();

    let ids = client.get_declarations("z1").unwrap();
    assert_eq!(ids, vec![file_id.clone(), link_id.clone(), mount_id.clone()]);

    client.remove_declaration("z1", &link_id).unwrap();
    assert_eq!(client.get_declarations("z1").unwrap(), vec![file_id, mount_id]);
}

#[test]
fn proxy_call_policy_gates_forwarding() {
    let rules = vec![ProxyCallRule {
        caller: "host".into(),
        target: "z1".into(),
        target_bus_name: "*".into(),
        target_object_path: "*".into(),
        target_interface: "*".into(),
        target_method: "*".into(),
    }];
    let daemon = spawn_daemon(rules);
    let mut client = ZonedClient::connect(&daemon.socket_path).unwrap();
    client.create_zone("z1", "default").unwrap();
    client.create_zone("z2", "default").unwrap();

    // Not covered by any rule.
    let err = client
        .proxy_call("z2", "bus", "/path", "iface", "method", serde_json::json!({}))
        .unwrap_err();
    assert_eq!(err.status, Status::Forbidden);

    // Allowed by policy, but the zone is not running.
    let err = client
        .proxy_call("z1", "bus", "/path", "iface", "method", serde_json::json!({}))
        .unwrap_err();
    assert_eq!(err.status, Status::InvalidState);
}

#[test]
fn proxy_call_reaches_a_host_service_and_relays_its_reply() {
    let daemon = spawn_daemon(vec![allow_all_rule()]);

    // A host-side service endpoint registers under the reserved id.
    let service_socket = daemon.socket_path.clone();
    let service = std::thread::spawn(move || {
        let mut endpoint = ZonedClient::connect(&service_socket).unwrap();
        endpoint.register_zone_agent("host").unwrap();
        endpoint.serve_one_proxy_call(|request| {
            assert_eq!(request.target_method, "Echo");
            serde_json::json!({"echo": request.args})
        })
    });

    // Give the service time to register before calling.
    std::thread::sleep(Duration::from_millis(100));

    let mut client = ZonedClient::connect(&daemon.socket_path).unwrap();
    let reply = client
        .proxy_call(
            "host",
            "bus",
            "/obj",
            "iface",
            "Echo",
            serde_json::json!({"n": 1}),
        )
        .unwrap();
    assert_eq!(reply, serde_json::json!({"echo": {"n": 1}}));
    service.join().unwrap().unwrap();
}

#[test]
fn proxy_call_to_unknown_target_is_invalid_id() {
    let daemon = spawn_daemon(vec![allow_all_rule()]);
    let mut client = ZonedClient::connect(&daemon.socket_path).unwrap();
    let err = client
        .proxy_call("ghost", "b", "/p", "i", "m", serde_json::json!({}))
        .unwrap_err();
    assert_eq!(err.status, Status::InvalidId);
}

#[test]
fn file_move_notifies_the_destination_agent() {
    let daemon = spawn_daemon(Vec::new());
    let mut client = ZonedClient::connect(&daemon.socket_path).unwrap();
    client.create_zone("z1", "default").unwrap();
    client.create_zone("z2", "default").unwrap();

    // Put a file into z1's rootfs at an allow-listed path.
    let info = client.get_zone_info("z1").unwrap();
    let src = PathBuf::from(&info.root_path).join("tmp/ut-zones/file");
    std::fs::create_dir_all(src.parent().unwrap()).unwrap();
    std::fs::write(&src, b"payload").unwrap();

    // z2's agent listens for the notification.
    let mut agent = ZonedClient::connect(&daemon.socket_path).unwrap();
    agent.register_zone_agent("z2").unwrap();

    let status = client
        .file_move_request("z1", "z2", "/tmp/ut-zones/file")
        .unwrap();
    assert_eq!(status, "FILE_MOVE_SUCCEEDED");

    let dst_info = client.get_zone_info("z2").unwrap();
    let dst = PathBuf::from(&dst_info.root_path).join("tmp/ut-zones/file");
    assert!(dst.exists());
    assert!(!src.exists());

    let notification = agent.wait_notification(Duration::from_secs(5)).unwrap();
    assert_eq!(notification.zone, "z1");
    assert_eq!(notification.message, "FILE_MOVE_SUCCEEDED");
}

#[test]
fn file_move_rejects_paths_outside_the_allow_lists() {
    let daemon = spawn_daemon(Vec::new());
    let mut client = ZonedClient::connect(&daemon.socket_path).unwrap();
    client.create_zone("z1", "default").unwrap();
    client.create_zone("z2", "default").unwrap();

    let status = client
        .file_move_request("z1", "z2", "/etc/passwd")
        .unwrap();
    assert_eq!(status, "FILE_MOVE_NO_PERMISSIONS_SEND");

    let status = client
        .file_move_request("z1", "z1", "/tmp/ut-zones/file")
        .unwrap();
    assert_eq!(status, "FILE_MOVE_WRONG_DESTINATION");

    let status = client
        .file_move_request("z1", "ghost", "/tmp/ut-zones/file")
        .unwrap();
    assert_eq!(status, "FILE_MOVE_DESTINATION_NOT_FOUND");
}

#[test]
fn create_file_hands_back_a_working_descriptor() {
    use std::io::Write;
    let daemon = spawn_daemon(Vec::new());
    let mut client = ZonedClient::connect(&daemon.socket_path).unwrap();
    client.create_zone("z1", "default").unwrap();

    let fd = client.create_file("z1", "/tmp/made", 0, 0o600).unwrap();
    let mut file = std::fs::File::from(fd);
    file.write_all(b"through the wire").unwrap();

    let info = client.get_zone_info("z1").unwrap();
    let host_path = PathBuf::from(&info.root_path).join("tmp/made");
    assert_eq!(std::fs::read(&host_path).unwrap(), b"through the wire");
}

#[test]
fn queue_lock_defers_requests_until_unlock() {
    let daemon = spawn_daemon(Vec::new());
    let mut locker = ZonedClient::connect(&daemon.socket_path).unwrap();
    locker.lock_queue().unwrap();

    // Another client's request sits in the queue; with a short timeout
    // the call errors out client-side while the server keeps it queued.
    let mut other = ZonedClient::connect(&daemon.socket_path).unwrap();
    let err = other.get_zone_ids_with_timeout(Duration::from_millis(50));
    assert_eq!(err.unwrap_err().status, Status::Io);

    locker.unlock_queue().unwrap();
    // The queue drained; fresh calls flow again.
    assert!(locker.get_zone_ids().unwrap().is_empty());
}
