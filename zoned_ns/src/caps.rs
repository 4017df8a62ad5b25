/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bounding-set capability handling. A capability mask is a plain u64
//! with bit N set for capability number N; `keep == 0` drops everything.

use crate::Error;
use crate::Result;

/// Highest capability number supported by the running kernel.
pub fn last_cap() -> Result<u32> {
    let text = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap").map_err(Error::CapLastCap)?;
    text.trim()
        .parse()
        .map_err(|e| Error::CapLastCap(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// Drop every capability not present in `keep` from the bounding set.
/// `highest` must come from [last_cap], read before any fork when this
/// runs on a post-fork path.
pub fn drop_bounding_except(keep: u64, highest: u32) -> Result<()> {
    for cap in 0..=highest {
        if keep & (1u64 << cap) != 0 {
            continue;
        }
        // Safety: PR_CAPBSET_DROP takes a plain integer argument.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if rc != 0 {
            return Err(Error::CapDrop {
                cap,
                errno: nix::errno::Errno::last(),
            });
        }
    }
    Ok(())
}

/// Mask with a single capability bit set.
pub const fn cap_mask(cap: u32) -> u64 {
    1u64 << cap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_cap_is_sane() {
        let cap = last_cap().unwrap();
        // CAP_SYS_ADMIN is 21; every kernel this runs on has at least that.
        assert!(cap >= 21);
        assert!(cap < 64);
    }

    #[test]
    fn cap_masks_compose() {
        let keep = cap_mask(21) | cap_mask(0);
        assert_eq!(keep & (1 << 21), 1 << 21);
        assert_eq!(keep & (1 << 1), 0);
    }
}
