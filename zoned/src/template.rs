/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Template rendering for new zone configs. Substitution is literal
//! string replacement of three tokens - deliberately not a template
//! language, so the result is auditable by eye.

/// Replaced with the zone id.
pub const TOKEN_NAME: &str = "~NAME~";
/// Replaced with the third octet of the zone's /24 network.
pub const TOKEN_IP: &str = "~IP~";
/// Replaced with the zone's virtual terminal number.
pub const TOKEN_VT: &str = "~VT~";

/// First third-octet handed out.
pub const IP_BASE_THIRD_OCTET: u32 = 100;
/// First virtual terminal handed out.
pub const VT_BASE: i32 = 1;

pub fn render(template: &str, id: &str, ip_third_octet: u32, vt: i32) -> String {
    template
        .replace(TOKEN_NAME, id)
        .replace(TOKEN_IP, &ip_third_octet.to_string())
        .replace(TOKEN_VT, &vt.to_string())
}

/// Monotonic allocator for the per-zone IP third octet and VT number.
/// Counters never go backwards, so ids are not reused after destroy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Allocator {
    created: u32,
}

impl Allocator {
    /// Seed from the number of zones already present.
    pub fn new(existing_zones: u32) -> Self {
        Self {
            created: existing_zones,
        }
    }

    pub fn next(&mut self) -> (u32, i32) {
        self.created += 1;
        (
            IP_BASE_THIRD_OCTET + self.created,
            VT_BASE + self.created as i32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_replaced_literally() {
        let template = r#"{"id": "~NAME~", "ip": "192.168.~IP~.1", "vt": ~VT~}"#;
        let rendered = render(template, "z1", 101, 2);
        assert_eq!(rendered, r#"{"id": "z1", "ip": "192.168.101.1", "vt": 2}"#);
    }

    #[test]
    fn substitution_is_sequential() {
        // Passes run in a fixed order; later tokens introduced by earlier
        // replacements are rewritten too. Zone ids are validated not to
        // contain tokens, so this stays a curiosity.
        let rendered = render("~NAME~", "~IP~", 7, 1);
        assert_eq!(rendered, "7");
    }

    #[test]
    fn unknown_tokens_pass_through() {
        assert_eq!(render("~OTHER~", "z", 1, 1), "~OTHER~");
    }

    #[test]
    fn allocator_is_monotonic() {
        let mut alloc = Allocator::new(0);
        assert_eq!(alloc.next(), (101, 2));
        assert_eq!(alloc.next(), (102, 3));
        let mut seeded = Allocator::new(5);
        assert_eq!(seeded.next(), (106, 7));
    }
}
