// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for COW group bookkeeping
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Shared sets never exceed capacity and never hold duplicates
//!   - Pages accepted once stay shared until teardown
//!   - Member counts track join/leave and teardown frees the slot

use super::{CowRegistry, Leave, SharedInsert};
use alloc::vec::Vec;
use proptest::prelude::*;

proptest! {
    #[test]
    fn shared_set_respects_capacity(capacity in 1usize..8, pages in proptest::collection::vec(0usize..16, 0..48)) {
        let mut registry = CowRegistry::new(2, capacity);
        let id = registry.create_group().expect("free slot");
        let mut accepted: Vec<usize> = Vec::new();
        for page in pages {
            let pa = page * 0x1000;
            match registry.add_shared_page(Some(id), pa) {
                SharedInsert::Inserted => {
                    prop_assert!(!accepted.contains(&pa));
                    accepted.push(pa);
                }
                SharedInsert::AlreadyShared => {
                    prop_assert!(accepted.contains(&pa));
                }
                SharedInsert::Full => {
                    prop_assert_eq!(accepted.len(), capacity);
                    prop_assert!(!accepted.contains(&pa));
                }
                SharedInsert::NoGroup => {
                    prop_assert!(false, "live group reported missing");
                }
            }
            prop_assert!(accepted.len() <= capacity);
            for pa in &accepted {
                prop_assert!(registry.is_shared(Some(id), *pa));
            }
        }
    }

    #[test]
    fn teardown_happens_on_last_leave(joins in 1usize..6) {
        let mut registry = CowRegistry::new(1, 4);
        let id = registry.create_group().expect("free slot");
        for _ in 0..joins {
            registry.join(id).expect("live group");
        }
        registry.add_shared_page(Some(id), 0x2000);
        for remaining in (0..joins).rev() {
            match registry.leave(id).expect("live group") {
                Leave::Remaining(left) => {
                    prop_assert_eq!(left, remaining);
                    prop_assert!(registry.is_shared(Some(id), 0x2000));
                }
                Leave::TornDown(orphans) => {
                    prop_assert_eq!(remaining, 0);
                    prop_assert_eq!(orphans, alloc::vec![0x2000]);
                }
            }
        }
        prop_assert_eq!(registry.groups_in_use(), 0);
        prop_assert_eq!(registry.create_group(), Ok(id));
    }
}
