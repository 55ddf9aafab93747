// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hosted HAL backends for host tests and bring-up
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FramePool, SoftPageTable, RamDisk, TickTimer, CountingTlb
//! DEPENDS_ON: alloc only (no MMIO, no CSRs)
//! INVARIANTS: Same contracts as the hardware backends; uninitialised frames are poisoned

extern crate alloc;

use alloc::{boxed::Box, collections::BTreeMap, vec, vec::Vec};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::{BlockDevice, BlockError, Timer, Tlb, BLOCK_SIZE};
use crate::mm::page_table::check_leaf;
use crate::mm::{page_round_down, FrameAllocator, MapError, PageFlags, PageMapper, Translation, PAGE_SIZE};

/// Byte pattern written into frames handed out by [`FramePool::alloc`].
pub const POISON: u8 = 0xa5;

/// Bounded pool of heap-backed frames addressed by fake physical addresses.
pub struct FramePool {
    cursor: usize,
    limit: usize,
    recycled: Vec<usize>,
    live: BTreeMap<usize, Box<[u8; PAGE_SIZE]>>,
}

impl FramePool {
    /// Creates a pool of `pages` frames starting at physical address `base`.
    pub fn new(base: usize, pages: usize) -> Self {
        Self {
            cursor: page_round_down(base),
            limit: page_round_down(base) + pages * PAGE_SIZE,
            recycled: Vec::new(),
            live: BTreeMap::new(),
        }
    }

    /// Number of frames currently allocated.
    pub fn live(&self) -> usize {
        self.live.len()
    }
}

impl FrameAllocator for FramePool {
    fn alloc(&mut self) -> Option<usize> {
        let pa = match self.recycled.pop() {
            Some(pa) => pa,
            None if self.cursor < self.limit => {
                let pa = self.cursor;
                self.cursor += PAGE_SIZE;
                pa
            }
            None => return None,
        };
        self.live.insert(pa, Box::new([POISON; PAGE_SIZE]));
        Some(pa)
    }

    fn free(&mut self, pa: usize) {
        if self.live.remove(&pa).is_some() {
            self.recycled.push(pa);
        } else {
            log_warn!(target: "sim", "free of unknown frame pa=0x{:x}", pa);
        }
    }

    fn page(&self, pa: usize) -> Option<&[u8]> {
        self.live.get(&pa).map(|frame| &frame[..])
    }

    fn page_mut(&mut self, pa: usize) -> Option<&mut [u8]> {
        self.live.get_mut(&pa).map(|frame| &mut frame[..])
    }
}

/// Flat software page table keyed by virtual page, entries encoded as `pa | flags`.
#[derive(Debug, Default)]
pub struct SoftPageTable {
    entries: BTreeMap<usize, usize>,
    #[cfg(feature = "failpoints")]
    deny_after: Option<usize>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of installed leaves.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lets `successes` more `map` calls through, then refuses the next one.
    #[cfg(feature = "failpoints")]
    pub fn deny_map_after(&mut self, successes: usize) {
        self.deny_after = Some(successes);
    }

    fn decode(entry: usize) -> Translation {
        Translation {
            pa: entry & !(PAGE_SIZE - 1),
            flags: PageFlags::from_bits_truncate(entry & (PAGE_SIZE - 1)),
        }
    }

    #[cfg(feature = "failpoints")]
    fn failpoint(&mut self) -> Result<(), MapError> {
        match self.deny_after {
            Some(0) => {
                self.deny_after = None;
                Err(MapError::PermissionDenied)
            }
            Some(left) => {
                self.deny_after = Some(left - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    #[cfg(not(feature = "failpoints"))]
    fn failpoint(&mut self) -> Result<(), MapError> {
        Ok(())
    }
}

impl PageMapper for SoftPageTable {
    fn map(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        check_leaf(va, pa, flags)?;
        if self.entries.contains_key(&va) {
            return Err(MapError::Overlap);
        }
        self.failpoint()?;
        self.entries.insert(va, pa | flags.bits());
        Ok(())
    }

    fn remap(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        check_leaf(va, pa, flags)?;
        match self.entries.get_mut(&va) {
            Some(entry) => {
                *entry = pa | flags.bits();
                Ok(())
            }
            None => Err(MapError::NotMapped),
        }
    }

    fn unmap(&mut self, va: usize) -> Result<Translation, MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        self.entries.remove(&va).map(Self::decode).ok_or(MapError::NotMapped)
    }

    fn translate(&self, va: usize) -> Option<Translation> {
        self.entries.get(&page_round_down(va)).copied().map(Self::decode)
    }
}

/// RAM-backed block device with injectable transfer failures.
pub struct RamDisk {
    blocks: Vec<[u8; BLOCK_SIZE]>,
    fail_reads: bool,
    fail_writes: bool,
    reads: usize,
    writes: usize,
}

impl RamDisk {
    pub fn new(blocks: usize) -> Self {
        Self {
            blocks: vec![[0u8; BLOCK_SIZE]; blocks],
            fail_reads: false,
            fail_writes: false,
            reads: 0,
            writes: 0,
        }
    }

    /// Makes every following read fail with [`BlockError::Io`].
    pub fn fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    /// Makes every following write fail with [`BlockError::Io`].
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Completed reads and writes so far.
    pub fn transfers(&self) -> (usize, usize) {
        (self.reads, self.writes)
    }

    /// Raw view of a block.
    pub fn block(&self, block: u64) -> Option<&[u8; BLOCK_SIZE]> {
        self.blocks.get(block as usize)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&mut self, block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), BlockError> {
        if self.fail_reads {
            return Err(BlockError::Io);
        }
        let src = self.blocks.get(block as usize).ok_or(BlockError::OutOfRange)?;
        buf.copy_from_slice(src);
        self.reads += 1;
        Ok(())
    }

    fn write_block(&mut self, block: u64, buf: &[u8; BLOCK_SIZE]) -> Result<(), BlockError> {
        if self.fail_writes {
            return Err(BlockError::Io);
        }
        let dst = self.blocks.get_mut(block as usize).ok_or(BlockError::OutOfRange)?;
        dst.copy_from_slice(buf);
        self.writes += 1;
        Ok(())
    }
}

/// Timer advancing by one tick per reading.
#[derive(Default)]
pub struct TickTimer {
    ticks: AtomicU64,
}

impl TickTimer {
    pub const fn new() -> Self {
        Self { ticks: AtomicU64::new(0) }
    }
}

impl Timer for TickTimer {
    fn now(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// TLB stand-in that counts invalidations.
#[derive(Default)]
pub struct CountingTlb {
    full: AtomicUsize,
    pages: AtomicUsize,
    last_page: AtomicUsize,
}

impl CountingTlb {
    pub const fn new() -> Self {
        Self { full: AtomicUsize::new(0), pages: AtomicUsize::new(0), last_page: AtomicUsize::new(0) }
    }

    /// Number of full flushes and single-page flushes so far.
    pub fn flushes(&self) -> (usize, usize) {
        (self.full.load(Ordering::SeqCst), self.pages.load(Ordering::SeqCst))
    }

    /// Most recent page passed to `flush_page`.
    pub fn last_page(&self) -> usize {
        self.last_page.load(Ordering::SeqCst)
    }
}

impl Tlb for CountingTlb {
    fn flush_all(&self) {
        self.full.fetch_add(1, Ordering::SeqCst);
    }

    fn flush_page(&self, va: usize) {
        self.pages.fetch_add(1, Ordering::SeqCst);
        self.last_page.store(va, Ordering::SeqCst);
    }
}
