/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Drives the full three-process attach pipeline without namespaces:
//! with an empty namespace set the intermediary degenerates to
//! chdir + clone, which works unprivileged, so the credential, TTY and
//! environment handling can be observed end to end.

use nix::sys::wait::WaitStatus;
use nix::unistd::Gid;
use nix::unistd::Pid;
use nix::unistd::Uid;
use zoned_attach::attach;
use zoned_attach::AttachOptions;
use zoned_ns::NsSet;

fn options(argv: Vec<String>, tty: &std::path::Path) -> AttachOptions {
    AttachOptions {
        init_pid: Pid::this(),
        namespaces: NsSet::empty(),
        uid: Uid::current(),
        gid: Gid::current(),
        supplementary_gids: Vec::new(),
        // Keep everything; dropping bounding caps needs privilege.
        caps_to_keep: u64::MAX,
        work_dir: "/".into(),
        tty_path: tty.to_path_buf(),
        env_to_keep: vec!["PATH".to_string()],
        env_to_set: vec![("FOO".to_string(), "bar".to_string())],
        remount_proc_sys: false,
        argv,
    }
}

fn slave_path() -> std::path::PathBuf {
    let pty = zoned_pty::open_pty().unwrap();
    let path = std::path::PathBuf::from(&pty.pts_name);
    // Keep the master alive for the duration of the test process;
    // closing it would hang up the slave.
    std::mem::forget(pty.master);
    path
}

#[test]
fn environment_is_exactly_keep_plus_set() {
    let tty = slave_path();
    // The child sees PATH (kept) and FOO=bar (set); HOME was neither
    // kept nor set, so it must be gone.
    let script = r#"[ "$FOO" = bar ] && [ -n "$PATH" ] && [ -z "$HOME" ]"#;
    let result = attach(&options(
        vec!["/bin/sh".into(), "-c".into(), script.into()],
        &tty,
    ))
    .unwrap();

    assert!(matches!(result.intermediary, WaitStatus::Exited(_, 0)));
    assert!(matches!(result.child, WaitStatus::Exited(_, 0)));
}

#[test]
fn child_runs_with_requested_working_directory() {
    let tty = slave_path();
    let mut options = options(
        vec!["/bin/sh".into(), "-c".into(), r#"[ "$PWD" = /tmp ]"#.into()],
        &tty,
    );
    options.work_dir = "/tmp".into();
    // PWD comes from the shell itself, not the environment we build.
    let result = attach(&options).unwrap();
    assert!(matches!(result.child, WaitStatus::Exited(_, 0)));
}

#[test]
fn child_controls_the_attach_tty() {
    let tty = slave_path();
    // stdin/stdout/stderr must all be the tty.
    let script = "tty_dev=$(tty) && [ -c \"$tty_dev\" ]";
    let result = attach(&options(
        vec!["/bin/sh".into(), "-c".into(), script.into()],
        &tty,
    ))
    .unwrap();
    assert!(matches!(result.child, WaitStatus::Exited(_, 0)));
}

#[test]
fn failing_payload_propagates_exit_status() {
    let tty = slave_path();
    let result = attach(&options(
        vec!["/bin/sh".into(), "-c".into(), "exit 3".into()],
        &tty,
    ))
    .unwrap();
    assert!(matches!(result.child, WaitStatus::Exited(_, 3)));
}
