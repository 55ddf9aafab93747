// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process heap residency tracker
//! OWNERS: @kernel-mm-team
//! PUBLIC API: HeapTracker (track, note_access, mark_loaded, mark_evicted, select_victim), HeapPage
//! INVARIANTS: Keyed by page-aligned virtual address; a resident page holds no swap slot;
//!             victim selection is FIFO by load time, ties broken by lowest address

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::mm::PAGE_SIZE;
use crate::swap::SwapSlot;

/// Bookkeeping for one demand-paged heap page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapPage {
    pub resident: bool,
    pub loaded_at: u64,
    pub accessed_at: u64,
    pub swap: Option<SwapSlot>,
}

/// Rejected tracker update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// Address is not page aligned.
    Unaligned,
    /// The tracker already holds its maximum number of pages.
    Full,
    /// Address is not tracked.
    Untracked,
}

/// Heap descriptors of one process.
#[derive(Clone, Debug)]
pub struct HeapTracker {
    pages: BTreeMap<usize, HeapPage>,
    capacity: usize,
}

impl HeapTracker {
    pub fn new(capacity: usize) -> Self {
        Self { pages: BTreeMap::new(), capacity }
    }

    /// Registers a heap page as not yet resident. Tracking an existing page is a no-op.
    pub fn track(&mut self, va: usize) -> Result<(), HeapError> {
        if va % PAGE_SIZE != 0 {
            return Err(HeapError::Unaligned);
        }
        if self.pages.contains_key(&va) {
            return Ok(());
        }
        if self.pages.len() >= self.capacity {
            return Err(HeapError::Full);
        }
        self.pages.insert(va, HeapPage::default());
        Ok(())
    }

    pub fn get(&self, va: usize) -> Option<&HeapPage> {
        self.pages.get(&va)
    }

    pub fn contains(&self, va: usize) -> bool {
        self.pages.contains_key(&va)
    }

    /// Updates the last-access timestamp.
    pub fn note_access(&mut self, va: usize, now: u64) -> Result<(), HeapError> {
        let page = self.pages.get_mut(&va).ok_or(HeapError::Untracked)?;
        page.accessed_at = now;
        Ok(())
    }

    /// Marks the page resident, stamping load and access time and dropping any swap slot.
    pub fn mark_loaded(&mut self, va: usize, now: u64) -> Result<(), HeapError> {
        let page = self.pages.get_mut(&va).ok_or(HeapError::Untracked)?;
        page.resident = true;
        page.loaded_at = now;
        page.accessed_at = now;
        page.swap = None;
        Ok(())
    }

    /// Marks the page swapped out to `slot`.
    pub fn mark_evicted(&mut self, va: usize, slot: SwapSlot) -> Result<(), HeapError> {
        let page = self.pages.get_mut(&va).ok_or(HeapError::Untracked)?;
        page.resident = false;
        page.swap = Some(slot);
        Ok(())
    }

    /// Detaches the swap slot of `va` once its contents have been read back.
    pub(crate) fn take_swap(&mut self, va: usize) -> Result<Option<SwapSlot>, HeapError> {
        let page = self.pages.get_mut(&va).ok_or(HeapError::Untracked)?;
        Ok(page.swap.take())
    }

    /// Resident page loaded the longest time ago.
    pub fn select_victim(&self) -> Option<usize> {
        self.pages
            .iter()
            .filter(|(_, page)| page.resident)
            .min_by_key(|(va, page)| (page.loaded_at, **va))
            .map(|(va, _)| *va)
    }

    pub fn resident_count(&self) -> usize {
        self.pages.values().filter(|page| page.resident).count()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &HeapPage)> + '_ {
        self.pages.iter().map(|(va, page)| (*va, page))
    }

    /// Installs a descriptor copied from another tracker.
    pub(crate) fn insert(&mut self, va: usize, page: HeapPage) -> Result<(), HeapError> {
        if !self.pages.contains_key(&va) && self.pages.len() >= self.capacity {
            return Err(HeapError::Full);
        }
        self.pages.insert(va, page);
        Ok(())
    }

    /// Forgets every page and hands back the swap slots that were still claimed.
    pub(crate) fn drain(&mut self) -> Vec<SwapSlot> {
        let slots = self.pages.values().filter_map(|page| page.swap).collect();
        self.pages.clear();
        slots
    }
}
