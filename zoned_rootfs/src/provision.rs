/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Declared provisions: files, mounts and links a zone wants recreated
//! inside its rootfs on every start. Declarations live in the zone's
//! config on the host; the guard replays them during the init bootstrap
//! and reverts them when the zone goes down.

use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::mount;
use crate::mount::MsFlags;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Declaration {
    File {
        path: PathBuf,
        flags: i32,
        mode: u32,
    },
    Mount {
        source: PathBuf,
        target: PathBuf,
        fs_type: String,
        flags: u64,
        data: String,
    },
    Link {
        source: PathBuf,
        target: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    pub id: String,
    pub declaration: Declaration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Provisions {
    entries: Vec<Provision>,
}

impl Provisions {
    pub fn declare(&mut self, declaration: Declaration) -> String {
        let id = Uuid::new_v4().to_string();
        self.entries.push(Provision {
            id: id.clone(),
            declaration,
        });
        id
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The same declarations with every path re-anchored under `root`.
    /// The guard reverts through the host-side view of the zone rootfs
    /// once the init is gone.
    pub fn rebased(&self, root: &Path) -> Provisions {
        let rebase = |p: &Path| -> PathBuf {
            match p.strip_prefix("/") {
                Ok(rel) => root.join(rel),
                Err(_) => root.join(p),
            }
        };
        Provisions {
            entries: self
                .entries
                .iter()
                .map(|e| Provision {
                    id: e.id.clone(),
                    declaration: match &e.declaration {
                        Declaration::File { path, flags, mode } => Declaration::File {
                            path: rebase(path),
                            flags: *flags,
                            mode: *mode,
                        },
                        Declaration::Mount {
                            source,
                            target,
                            fs_type,
                            flags,
                            data,
                        } => Declaration::Mount {
                            source: source.clone(),
                            target: rebase(target),
                            fs_type: fs_type.clone(),
                            flags: *flags,
                            data: data.clone(),
                        },
                        Declaration::Link { source, target } => Declaration::Link {
                            source: source.clone(),
                            target: rebase(target),
                        },
                    },
                })
                .collect(),
        }
    }

    /// Replay every declaration. Paths are absolute in-zone paths; this
    /// runs after the pivot, so they resolve inside the zone.
    pub fn execute(&self) -> Result<()> {
        for entry in &self.entries {
            match &entry.declaration {
                Declaration::File { path, flags, mode } => {
                    std::fs::OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(false)
                        .custom_flags(*flags)
                        .mode(*mode)
                        .open(path)
                        .map_err(|e| Error::CreateFile(path.clone(), e))?;
                }
                Declaration::Mount {
                    source,
                    target,
                    fs_type,
                    flags,
                    data,
                } => {
                    let fstype: Option<&str> = if fs_type.is_empty() {
                        None
                    } else {
                        Some(fs_type.as_str())
                    };
                    let data: Option<&str> = if data.is_empty() {
                        None
                    } else {
                        Some(data.as_str())
                    };
                    nix::mount::mount(
                        Some(source.as_path()),
                        target.as_path(),
                        fstype,
                        MsFlags::from_bits_truncate(*flags),
                        data,
                    )
                    .map_err(|errno| Error::Mount {
                        source_path: Some(source.clone()),
                        target: target.clone(),
                        fstype: "declared",
                        errno,
                    })?;
                }
                Declaration::Link { source, target } => {
                    std::os::unix::fs::symlink(source, target)
                        .map_err(|e| Error::Symlink(target.clone(), e))?;
                }
            }
        }
        Ok(())
    }

    /// Undo in reverse declaration order. Individual failures are logged
    /// and skipped; teardown keeps going.
    pub fn revert(&self) {
        for entry in self.entries.iter().rev() {
            let result: Result<()> = match &entry.declaration {
                Declaration::File { path, .. } => std::fs::remove_file(path)
                    .map_err(|e| Error::CreateFile(path.clone(), e)),
                Declaration::Mount { target, .. } => mount::umount_detach(target),
                Declaration::Link { target, .. } => std::fs::remove_file(target)
                    .map_err(|e| Error::Symlink(target.clone(), e)),
            };
            if let Err(e) = result {
                warn!("failed to revert provision {}: {}", entry.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_then_remove_is_inverse() {
        let mut provisions = Provisions::default();
        let id = provisions.declare(Declaration::Link {
            source: "/etc/hosts".into(),
            target: "/tmp/hosts".into(),
        });
        assert_eq!(provisions.ids(), vec![id.clone()]);
        assert!(provisions.remove(&id));
        assert!(provisions.ids().is_empty());
        assert!(!provisions.remove(&id));
    }

    #[test]
    fn declaration_ids_are_unique() {
        let mut provisions = Provisions::default();
        let a = provisions.declare(Declaration::File {
            path: "/tmp/a".into(),
            flags: 0,
            mode: 0o644,
        });
        let b = provisions.declare(Declaration::File {
            path: "/tmp/a".into(),
            flags: 0,
            mode: 0o644,
        });
        assert_ne!(a, b);
    }

    #[test]
    fn file_and_link_provisions_replay_and_revert() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("provisioned");
        let link_path = dir.path().join("link");

        let mut provisions = Provisions::default();
        provisions.declare(Declaration::File {
            path: file_path.clone(),
            flags: 0,
            mode: 0o600,
        });
        provisions.declare(Declaration::Link {
            source: file_path.clone(),
            target: link_path.clone(),
        });

        provisions.execute().unwrap();
        assert!(file_path.exists());
        assert!(link_path.symlink_metadata().unwrap().file_type().is_symlink());

        provisions.revert();
        assert!(!file_path.exists());
        assert!(!link_path.exists());
    }

    #[test]
    fn rebasing_anchors_targets_under_root() {
        let mut provisions = Provisions::default();
        provisions.declare(Declaration::Link {
            source: "/etc/hosts".into(),
            target: "/tmp/hosts".into(),
        });
        let rebased = provisions.rebased(Path::new("/zones/z1"));
        match &rebased.entries[0].declaration {
            Declaration::Link { source, target } => {
                // Link contents stay zone-relative; only the target moves.
                assert_eq!(source, Path::new("/etc/hosts"));
                assert_eq!(target, Path::new("/zones/z1/tmp/hosts"));
            }
            other => panic!("unexpected declaration {other:?}"),
        }
    }

    #[test]
    fn provisions_survive_serialization() {
        let mut provisions = Provisions::default();
        provisions.declare(Declaration::Mount {
            source: "tmpfs".into(),
            target: "/tmp/m".into(),
            fs_type: "tmpfs".into(),
            flags: 0,
            data: String::new(),
        });
        let json = serde_json::to_string(&provisions).unwrap();
        let back: Provisions = serde_json::from_str(&json).unwrap();
        assert_eq!(provisions, back);
    }
}
