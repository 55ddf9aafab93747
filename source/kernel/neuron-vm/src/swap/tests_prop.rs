// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the swap block allocator
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Live slots never overlap
//!   - Used-block accounting matches the number of live slots
//!   - Freed slots become allocatable again

use super::{SwapArea, SwapSlot};
use crate::config::SwapConfig;
use crate::hal::BLOCKS_PER_PAGE;
use alloc::vec::Vec;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Alloc,
    Free(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Alloc), (0usize..16).prop_map(Op::Free)]
}

proptest! {
    #[test]
    fn live_slots_stay_disjoint(pages in 1usize..12, ops in proptest::collection::vec(arb_op(), 1..64)) {
        let mut area = SwapArea::new(SwapConfig { start_block: 0, blocks: pages * BLOCKS_PER_PAGE });
        let mut live: Vec<SwapSlot> = Vec::new();
        for op in ops {
            match op {
                Op::Alloc => match area.alloc_page() {
                    Some(slot) => live.push(slot),
                    None => {
                        prop_assert_eq!(live.len(), pages);
                    }
                },
                Op::Free(index) if !live.is_empty() => {
                    let slot = live.remove(index % live.len());
                    prop_assert!(area.free(slot).is_ok());
                }
                Op::Free(_) => {}
            }
            prop_assert_eq!(area.used_blocks(), live.len() * BLOCKS_PER_PAGE);
            for (i, a) in live.iter().enumerate() {
                for b in live.iter().skip(i + 1) {
                    let (a, b) = (a.first_block(), b.first_block());
                    prop_assert!(a + BLOCKS_PER_PAGE <= b || b + BLOCKS_PER_PAGE <= a);
                }
            }
        }
    }
}
