// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Swap area block allocator and page transfer helpers
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SwapArea (alloc_page, free), SwapSlot, write_page, read_page
//! DEPENDS_ON: hal::BlockDevice
//! INVARIANTS: A slot's blocks stay marked used from eviction until retrieval;
//!             first-fit over fixed-size blocks, no compaction; nothing but page bytes is stored on disk

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::config::SwapConfig;
use crate::hal::{BlockDevice, BlockError, BLOCKS_PER_PAGE, BLOCK_SIZE};
use crate::mm::PAGE_SIZE;

const WORD_BITS: usize = u64::BITS as usize;

/// First block (relative to the swap area) of one swapped-out page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    /// Index of the first block inside the swap area.
    pub fn first_block(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error raised when releasing a slot that is not fully allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapError {
    NotAllocated(SwapSlot),
}

/// Bitmap over the swap area's blocks.
pub struct SwapArea {
    bitmap: Vec<u64>,
    blocks: usize,
    start_block: u64,
    used: usize,
}

impl SwapArea {
    /// Creates an area with every block free.
    pub fn new(config: SwapConfig) -> Self {
        let words = config.blocks.div_ceil(WORD_BITS);
        Self { bitmap: vec![0; words], blocks: config.blocks, start_block: config.start_block, used: 0 }
    }

    /// Total blocks in the area.
    pub fn capacity(&self) -> usize {
        self.blocks
    }

    /// Blocks currently claimed by swapped-out pages.
    pub fn used_blocks(&self) -> usize {
        self.used
    }

    pub fn is_used(&self, block: usize) -> bool {
        block < self.blocks && self.bitmap[block / WORD_BITS] & (1 << (block % WORD_BITS)) != 0
    }

    /// Claims the first run of free blocks large enough for one page.
    pub fn alloc_page(&mut self) -> Option<SwapSlot> {
        let mut run_start = 0;
        let mut run_len = 0;
        for block in 0..self.blocks {
            if self.is_used(block) {
                run_len = 0;
                run_start = block + 1;
                continue;
            }
            run_len += 1;
            if run_len == BLOCKS_PER_PAGE {
                for claimed in run_start..run_start + BLOCKS_PER_PAGE {
                    self.set(claimed, true);
                }
                self.used += BLOCKS_PER_PAGE;
                return Some(SwapSlot(run_start as u32));
            }
        }
        None
    }

    /// Returns the blocks of `slot` to the free pool.
    pub fn free(&mut self, slot: SwapSlot) -> Result<(), SwapError> {
        let first = slot.first_block();
        let end = first.checked_add(BLOCKS_PER_PAGE).ok_or(SwapError::NotAllocated(slot))?;
        if end > self.blocks || !(first..end).all(|block| self.is_used(block)) {
            return Err(SwapError::NotAllocated(slot));
        }
        for block in first..end {
            self.set(block, false);
        }
        self.used -= BLOCKS_PER_PAGE;
        Ok(())
    }

    /// Absolute device block holding chunk `chunk` of `slot`.
    pub fn device_block(&self, slot: SwapSlot, chunk: usize) -> u64 {
        self.start_block + (slot.first_block() + chunk) as u64
    }

    fn set(&mut self, block: usize, used: bool) {
        let word = block / WORD_BITS;
        let bit = 1u64 << (block % WORD_BITS);
        if used {
            self.bitmap[word] |= bit;
        } else {
            self.bitmap[word] &= !bit;
        }
    }
}

/// Device blocks backing one slot, in page order.
pub fn slot_blocks(area: &SwapArea, slot: SwapSlot) -> [u64; BLOCKS_PER_PAGE] {
    core::array::from_fn(|chunk| area.device_block(slot, chunk))
}

/// Writes one page to `blocks`, one block-sized chunk per transfer.
pub fn write_page<D: BlockDevice>(
    disk: &mut D,
    blocks: &[u64; BLOCKS_PER_PAGE],
    page: &[u8],
) -> Result<(), BlockError> {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    let mut chunk = [0u8; BLOCK_SIZE];
    for (index, block) in blocks.iter().enumerate() {
        chunk.copy_from_slice(&page[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE]);
        disk.write_block(*block, &chunk)?;
    }
    Ok(())
}

/// Reads one page from `blocks` into `page`.
pub fn read_page<D: BlockDevice>(
    disk: &mut D,
    blocks: &[u64; BLOCKS_PER_PAGE],
    page: &mut [u8],
) -> Result<(), BlockError> {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    let mut chunk = [0u8; BLOCK_SIZE];
    for (index, block) in blocks.iter().enumerate() {
        disk.read_block(*block, &mut chunk)?;
        page[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE].copy_from_slice(&chunk);
    }
    Ok(())
}


#[cfg(test)]
mod tests_prop;
