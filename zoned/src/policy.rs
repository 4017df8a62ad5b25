/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Proxy-call policy: an ordered rule list evaluated first-match. A field
//! matches when it is the literal `*` or exactly equal to the request's
//! value - no regex, no prefix matching.

use serde::Deserialize;
use serde::Serialize;

const ANY: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCallRule {
    pub caller: String,
    pub target: String,
    pub target_bus_name: String,
    pub target_object_path: String,
    pub target_interface: String,
    pub target_method: String,
}

fn matches(rule: &str, value: &str) -> bool {
    rule == ANY || rule == value
}

#[derive(Debug, Default)]
pub struct ProxyCallPolicy {
    rules: Vec<ProxyCallRule>,
}

impl ProxyCallPolicy {
    pub fn new(rules: Vec<ProxyCallRule>) -> Self {
        Self { rules }
    }

    pub fn is_allowed(
        &self,
        caller: &str,
        target: &str,
        target_bus_name: &str,
        target_object_path: &str,
        target_interface: &str,
        target_method: &str,
    ) -> bool {
        self.rules.iter().any(|rule| {
            matches(&rule.caller, caller)
                && matches(&rule.target, target)
                && matches(&rule.target_bus_name, target_bus_name)
                && matches(&rule.target_object_path, target_object_path)
                && matches(&rule.target_interface, target_interface)
                && matches(&rule.target_method, target_method)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(caller: &str, target: &str) -> ProxyCallRule {
        ProxyCallRule {
            caller: caller.into(),
            target: target.into(),
            target_bus_name: ANY.into(),
            target_object_path: ANY.into(),
            target_interface: ANY.into(),
            target_method: ANY.into(),
        }
    }

    #[test]
    fn no_rules_deny_everything() {
        let policy = ProxyCallPolicy::default();
        assert!(!policy.is_allowed("host", "z1", "b", "p", "i", "m"));
    }

    #[test]
    fn first_matching_rule_permits() {
        let policy = ProxyCallPolicy::new(vec![rule("host", "z1")]);
        assert!(policy.is_allowed("host", "z1", "bus", "path", "iface", "method"));
        assert!(!policy.is_allowed("host", "z2", "bus", "path", "iface", "method"));
        assert!(!policy.is_allowed("z1", "z1", "bus", "path", "iface", "method"));
    }

    #[test]
    fn star_is_literal_not_a_glob() {
        let mut r = rule("host", "*");
        r.target_method = "Get*".into();
        let policy = ProxyCallPolicy::new(vec![r]);
        // "Get*" only matches the literal string "Get*".
        assert!(!policy.is_allowed("host", "z1", "b", "p", "i", "GetAll"));
        assert!(policy.is_allowed("host", "z1", "b", "p", "i", "Get*"));
    }

    #[test]
    fn any_caller_any_target() {
        let policy = ProxyCallPolicy::new(vec![rule("*", "*")]);
        assert!(policy.is_allowed("z3", "host", "b", "p", "i", "m"));
    }
}
