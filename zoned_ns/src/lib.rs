/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! zoned_ns
//! ========
//!
//! Namespace, process and credential primitives: the [NsSet] namespace-set
//! type, clone onto a fresh stack, ordered setns, unshare, wait wrappers,
//! uid/gid/groups/session switching and bounding-set capability drops.
//! Every wrapper returns a typed error carrying the underlying system
//! error; nothing here reports failure through a return code.

use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Pid;
use serde::Deserialize;
use serde::Serialize;

pub mod caps;
pub mod creds;
pub mod idmap;
pub mod proc;

pub use idmap::IdMap;
pub use idmap::IdRange;
pub use nix::sched::CloneFlags;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("clone failed: {0}")]
    Clone(Errno),
    #[error("unshare failed: {0}")]
    Unshare(Errno),
    #[error("setns to {ns} of pid {pid} failed: {errno}")]
    Setns { pid: Pid, ns: &'static str, errno: Errno },
    #[error("cannot open {path}: {errno}")]
    NsOpen { path: PathBuf, errno: Errno },
    #[error("waitpid({0}) failed: {1}")]
    Wait(Pid, Errno),
    #[error("{call} failed: {errno}")]
    Credentials { call: &'static str, errno: Errno },
    #[error("cannot drop capability {cap} from bounding set: {errno}")]
    CapDrop { cap: u32, errno: Errno },
    #[error("cannot read cap_last_cap: {0}")]
    CapLastCap(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One kind of kernel namespace a zone may request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NsKind {
    User,
    Mnt,
    Pid,
    Uts,
    Ipc,
    Net,
}

impl NsKind {
    pub const ALL: [NsKind; 6] = [
        NsKind::User,
        NsKind::Mnt,
        NsKind::Pid,
        NsKind::Uts,
        NsKind::Ipc,
        NsKind::Net,
    ];

    /// Name of the namespace link under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            NsKind::User => "user",
            NsKind::Mnt => "mnt",
            NsKind::Pid => "pid",
            NsKind::Uts => "uts",
            NsKind::Ipc => "ipc",
            NsKind::Net => "net",
        }
    }

    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NsKind::User => CloneFlags::CLONE_NEWUSER,
            NsKind::Mnt => CloneFlags::CLONE_NEWNS,
            NsKind::Pid => CloneFlags::CLONE_NEWPID,
            NsKind::Uts => CloneFlags::CLONE_NEWUTS,
            NsKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NsKind::Net => CloneFlags::CLONE_NEWNET,
        }
    }
}

/// A set of namespaces, serialized as the list of kinds so that configs
/// stay readable.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<NsKind>", into = "Vec<NsKind>")]
pub struct NsSet {
    user: bool,
    mnt: bool,
    pid: bool,
    uts: bool,
    ipc: bool,
    net: bool,
}

impl NsSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        NsKind::ALL.into_iter().collect()
    }

    pub fn with(mut self, kind: NsKind) -> Self {
        self.set(kind, true);
        self
    }

    pub fn set(&mut self, kind: NsKind, value: bool) {
        match kind {
            NsKind::User => self.user = value,
            NsKind::Mnt => self.mnt = value,
            NsKind::Pid => self.pid = value,
            NsKind::Uts => self.uts = value,
            NsKind::Ipc => self.ipc = value,
            NsKind::Net => self.net = value,
        }
    }

    pub fn contains(&self, kind: NsKind) -> bool {
        match kind {
            NsKind::User => self.user,
            NsKind::Mnt => self.mnt,
            NsKind::Pid => self.pid,
            NsKind::Uts => self.uts,
            NsKind::Ipc => self.ipc,
            NsKind::Net => self.net,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Kinds in setns order: USER first (to acquire privileges in the
    /// target user namespace), then the rest.
    pub fn iter(&self) -> impl Iterator<Item = NsKind> + '_ {
        NsKind::ALL.into_iter().filter(|k| self.contains(*k))
    }

    pub fn clone_flags(&self) -> CloneFlags {
        self.iter()
            .fold(CloneFlags::empty(), |acc, k| acc | k.clone_flag())
    }
}

impl FromIterator<NsKind> for NsSet {
    fn from_iter<I: IntoIterator<Item = NsKind>>(iter: I) -> Self {
        let mut set = Self::empty();
        for kind in iter {
            set.set(kind, true);
        }
        set
    }
}

impl From<Vec<NsKind>> for NsSet {
    fn from(kinds: Vec<NsKind>) -> Self {
        kinds.into_iter().collect()
    }
}

impl From<NsSet> for Vec<NsKind> {
    fn from(set: NsSet) -> Self {
        set.iter().collect()
    }
}

/// Path of one namespace link of a process.
pub fn ns_path(pid: Pid, kind: NsKind) -> PathBuf {
    PathBuf::from(format!("/proc/{}/ns/{}", pid, kind.proc_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_round_trips_through_serde() {
        let set = NsSet::empty().with(NsKind::User).with(NsKind::Net);
        let json = serde_json::to_string(&set).unwrap();
        let back: NsSet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, back);
    }

    #[test]
    fn user_namespace_comes_first() {
        let set = NsSet::all();
        assert_eq!(set.iter().next(), Some(NsKind::User));
    }

    #[test]
    fn clone_flags_cover_requested_kinds() {
        let set = NsSet::empty().with(NsKind::Mnt).with(NsKind::Pid);
        let flags = set.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn ns_paths_use_proc_names() {
        assert_eq!(
            ns_path(Pid::from_raw(42), NsKind::Mnt),
            PathBuf::from("/proc/42/ns/mnt")
        );
    }
}
