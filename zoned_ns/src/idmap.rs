/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! UID/GID map handling for user namespaces. A map is an ordered list of
//! `(container id, host id, length)` ranges, written verbatim into
//! `/proc/<pid>/uid_map` / `gid_map` by the guard.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub container_id: u32,
    pub host_id: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMap {
    pub ranges: Vec<IdRange>,
}

impl IdMap {
    pub fn new(ranges: Vec<IdRange>) -> Self {
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The `/proc/<pid>/{uid,gid}_map` file format: one
    /// `container host length` line per range.
    pub fn to_proc_file(&self) -> String {
        let mut out = String::new();
        for r in &self.ranges {
            out.push_str(&format!("{} {} {}\n", r.container_id, r.host_id, r.length));
        }
        out
    }

    /// Translate a container-side id to its host-side value.
    pub fn host_id(&self, container_id: u32) -> Option<u32> {
        for r in &self.ranges {
            if container_id >= r.container_id && container_id - r.container_id < r.length {
                return Some(r.host_id + (container_id - r.container_id));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_file_concatenates_triples() {
        let map = IdMap::new(vec![
            IdRange {
                container_id: 0,
                host_id: 100000,
                length: 1000,
            },
            IdRange {
                container_id: 1000,
                host_id: 5000,
                length: 1,
            },
        ]);
        assert_eq!(map.to_proc_file(), "0 100000 1000\n1000 5000 1\n");
    }

    #[test]
    fn empty_map_renders_nothing() {
        assert_eq!(IdMap::default().to_proc_file(), "");
        assert!(IdMap::default().is_empty());
    }

    #[test]
    fn host_id_translates_within_ranges() {
        let map = IdMap::new(vec![IdRange {
            container_id: 0,
            host_id: 100000,
            length: 1000,
        }]);
        assert_eq!(map.host_id(0), Some(100000));
        assert_eq!(map.host_id(5), Some(100005));
        assert_eq!(map.host_id(999), Some(100999));
        assert_eq!(map.host_id(1000), None);
    }
}
