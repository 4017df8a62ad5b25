/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Filesystem helpers for rootfs provisioning and inter-zone file moves.

use std::path::Path;

use tracing::debug;

use crate::Error;
use crate::Result;

/// Copy a directory tree, preserving permissions. Symlinks are copied as
/// links, not followed; special files are skipped.
pub fn copy_dir_contents(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_contents(&entry.path(), &target)?;
            let perm = entry.metadata()?.permissions();
            std::fs::set_permissions(&target, perm)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        } else {
            debug!("skipping special file {}", entry.path().display());
        }
    }
    Ok(())
}

/// Move a file, falling back to copy-and-remove across filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove a directory tree if it exists.
pub fn remove_tree(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_nested_trees_with_links() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("a/b/file"), b"payload").unwrap();
        std::os::unix::fs::symlink("b/file", src.path().join("a/link")).unwrap();

        let target = dst.path().join("copy");
        copy_dir_contents(src.path(), &target).unwrap();

        assert_eq!(
            std::fs::read(target.join("a/b/file")).unwrap(),
            b"payload"
        );
        assert_eq!(
            std::fs::read_link(target.join("a/link")).unwrap(),
            std::path::PathBuf::from("b/file")
        );
    }

    #[test]
    fn move_file_creates_destination_directories() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("src/file");
        std::fs::create_dir_all(from.parent().unwrap()).unwrap();
        std::fs::write(&from, b"x").unwrap();
        let to = dir.path().join("dst/deep/file");
        move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"x");
    }

    #[test]
    fn remove_tree_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        remove_tree(&dir.path().join("nope")).unwrap();
    }
}
