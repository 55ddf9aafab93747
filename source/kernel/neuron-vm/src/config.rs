// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-time sizing of the pager's tables.

use core::fmt;

use crate::hal::BLOCKS_PER_PAGE;

/// Process slots, and therefore COW group slots.
pub const DEFAULT_MAX_PROCS: usize = 64;
/// Shared pages a single COW group can record.
pub const DEFAULT_SHARED_PAGES_PER_GROUP: usize = 100;
/// Heap pages a process may grow to.
pub const DEFAULT_MAX_HEAP_PAGES: usize = 1024;
/// Heap pages a process may keep resident before eviction starts.
pub const DEFAULT_MAX_RESIDENT_HEAP_PAGES: usize = 100;
/// First disk block of the swap area.
pub const DEFAULT_SWAP_START_BLOCK: u64 = 2000;
/// Blocks in the swap area.
pub const DEFAULT_SWAP_BLOCKS: usize = 1024;

/// Location and size of the swap area on the block device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapConfig {
    pub start_block: u64,
    pub blocks: usize,
}

/// Limits applied by the pager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagerConfig {
    pub max_procs: usize,
    pub shared_pages_per_group: usize,
    pub max_heap_pages: usize,
    pub max_resident_heap_pages: usize,
    pub swap: SwapConfig,
}

/// Rejected configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// No process slots.
    NoProcessSlots,
    /// COW groups could not record any page.
    NoSharedPages,
    /// Resident ceiling of zero would evict before every map.
    NoResidentPages,
    /// Resident ceiling exceeds the heap limit.
    ResidentAboveHeap,
    /// Swap area cannot hold a single page.
    SwapTooSmall,
    /// Swap area end does not fit the block address space.
    SwapOutOfRange,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConfigError::NoProcessSlots => "max_procs must be non-zero",
            ConfigError::NoSharedPages => "shared_pages_per_group must be non-zero",
            ConfigError::NoResidentPages => "max_resident_heap_pages must be non-zero",
            ConfigError::ResidentAboveHeap => "max_resident_heap_pages exceeds max_heap_pages",
            ConfigError::SwapTooSmall => "swap area smaller than one page",
            ConfigError::SwapOutOfRange => "swap area overflows block numbering",
        };
        f.write_str(msg)
    }
}

impl PagerConfig {
    /// Defaults matching the stock kernel layout.
    pub const fn new() -> Self {
        Self {
            max_procs: DEFAULT_MAX_PROCS,
            shared_pages_per_group: DEFAULT_SHARED_PAGES_PER_GROUP,
            max_heap_pages: DEFAULT_MAX_HEAP_PAGES,
            max_resident_heap_pages: DEFAULT_MAX_RESIDENT_HEAP_PAGES,
            swap: SwapConfig { start_block: DEFAULT_SWAP_START_BLOCK, blocks: DEFAULT_SWAP_BLOCKS },
        }
    }

    pub const fn with_resident_ceiling(mut self, pages: usize) -> Self {
        self.max_resident_heap_pages = pages;
        self
    }

    pub const fn with_swap(mut self, start_block: u64, blocks: usize) -> Self {
        self.swap = SwapConfig { start_block, blocks };
        self
    }

    pub const fn with_group_capacity(mut self, pages: usize) -> Self {
        self.shared_pages_per_group = pages;
        self
    }

    pub const fn with_max_procs(mut self, procs: usize) -> Self {
        self.max_procs = procs;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_procs == 0 {
            return Err(ConfigError::NoProcessSlots);
        }
        if self.shared_pages_per_group == 0 {
            return Err(ConfigError::NoSharedPages);
        }
        if self.max_resident_heap_pages == 0 {
            return Err(ConfigError::NoResidentPages);
        }
        if self.max_resident_heap_pages > self.max_heap_pages {
            return Err(ConfigError::ResidentAboveHeap);
        }
        if self.swap.blocks < BLOCKS_PER_PAGE {
            return Err(ConfigError::SwapTooSmall);
        }
        if self.swap.start_block.checked_add(self.swap.blocks as u64).is_none() {
            return Err(ConfigError::SwapOutOfRange);
        }
        Ok(())
    }
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self::new()
    }
}
