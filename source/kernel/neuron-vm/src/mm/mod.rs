// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives consumed by the fault path.

pub mod frame;
pub mod guard;
pub mod page_table;

pub use frame::FrameAllocator;
pub use guard::MappingGuard;
pub use page_table::{MapError, PageFlags, PageMapper, Translation};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Rounds `addr` down to the containing page boundary.
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary, `None` on overflow.
pub const fn page_round_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(end) => Some(end & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Iterates the page-aligned addresses in `[start, end)`.
pub fn pages(start: usize, end: usize) -> impl Iterator<Item = usize> {
    (page_round_down(start)..end).step_by(PAGE_SIZE)
}
