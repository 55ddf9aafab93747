// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

use core::fmt;

use static_assertions::const_assert;

use crate::mm::PAGE_SIZE;

#[cfg(any(test, feature = "sim"))]
pub mod sim;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod virt;

/// Size of one storage block in bytes.
pub const BLOCK_SIZE: usize = 1024;
/// Number of consecutive blocks holding one page.
pub const BLOCKS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SIZE;

const_assert!(PAGE_SIZE % BLOCK_SIZE == 0);
const_assert!(BLOCKS_PER_PAGE > 0);

/// Abstraction for a monotonic timer.
pub trait Timer {
    /// Returns the current time in ticks; strictly increasing between calls is not required.
    fn now(&self) -> u64;
}

/// TLB management operations.
pub trait Tlb {
    /// Flushes the entire translation cache.
    fn flush_all(&self);

    /// Flushes any cached translation for the page at `va`.
    fn flush_page(&self, va: usize) {
        let _ = va;
        self.flush_all();
    }

    /// Flushes cached translations for `[va, va + len)`.
    fn flush_range(&self, va: usize, len: usize) {
        for page in crate::mm::pages(va, va.saturating_add(len)) {
            self.flush_page(page);
        }
    }
}

/// Error reported by block storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockError {
    /// Block number lies outside the device.
    OutOfRange,
    /// The device reported a transfer failure.
    Io,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::OutOfRange => f.write_str("block out of range"),
            BlockError::Io => f.write_str("block transfer failed"),
        }
    }
}

/// Synchronous block storage. Calls block the caller until the transfer completes.
pub trait BlockDevice {
    /// Reads block `block` into `buf`.
    fn read_block(&mut self, block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), BlockError>;

    /// Writes `buf` to block `block`.
    fn write_block(&mut self, block: u64, buf: &[u8; BLOCK_SIZE]) -> Result<(), BlockError>;
}
