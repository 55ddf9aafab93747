// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Heap eviction to swap and retrieval back into memory.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use super::Pager;
use crate::error::FaultError;
use crate::hal::{BlockDevice, Timer, Tlb};
use crate::mm::{FrameAllocator, PageFlags, PageMapper, PAGE_SIZE};
use crate::process::ProcessVm;
use crate::swap::{read_page, slot_blocks, write_page};

impl<F, D, T, L> Pager<F, D, T, L>
where
    F: FrameAllocator,
    D: BlockDevice,
    T: Timer,
    L: Tlb,
{
    /// Writes the oldest-loaded resident heap page of `vm` to swap and unmaps it.
    ///
    /// Returns the evicted virtual address. The caller holds the fault lock.
    pub fn evict_one<M: PageMapper>(&self, vm: &mut ProcessVm<M>) -> Result<usize, FaultError> {
        let va = vm.tracker.select_victim().ok_or(FaultError::NoVictim)?;
        let leaf = vm.table.translate(va).ok_or(FaultError::MissingMapping { va })?;
        let (slot, blocks) = {
            let mut swap = self.swap.lock();
            let slot = swap.alloc_page().ok_or(FaultError::SwapExhausted)?;
            (slot, slot_blocks(&swap, slot))
        };

        let staged: Option<Vec<u8>> = self.frames.lock().page(leaf.pa).map(<[u8]>::to_vec);
        let written = match staged {
            Some(page) => write_page(&mut *self.disk.lock(), &blocks, &page).map_err(FaultError::from),
            None => Err(FaultError::UnknownFrame { pa: leaf.pa }),
        };
        if let Err(err) = written {
            self.free_slot(slot);
            return Err(err);
        }

        if let Err(err) = vm.table.unmap(va) {
            self.free_slot(slot);
            return Err(err.into());
        }
        // Frames still shared with other group members stay allocated.
        if !self.cow.lock().is_shared(vm.cow_group, leaf.pa) {
            self.frames.lock().free(leaf.pa);
        }
        vm.tracker.mark_evicted(va, slot)?;
        vm.resident_heap = vm.resident_heap.saturating_sub(1);
        self.tlb.flush_page(va);
        log_info!(target: "swap", "evict pid={} va=0x{:x} block={}", vm.pid, va, blocks[0]);
        Ok(va)
    }

    /// Reads the swapped-out heap page at `va` back into a new frame and maps it.
    ///
    /// The swap blocks are released as soon as they are read. Callers make room
    /// under the resident ceiling first.
    pub fn retrieve<M: PageMapper>(&self, vm: &mut ProcessVm<M>, va: usize) -> Result<usize, FaultError> {
        let staged = self.stage_swapped(vm, va)?;
        self.install_staged(vm, va, &staged)
    }

    /// Copies the swapped-out page at `va` into memory and frees its slot.
    ///
    /// The page stays unmapped and untied to swap until [`Self::install_staged`].
    pub(super) fn stage_swapped<M: PageMapper>(
        &self,
        vm: &mut ProcessVm<M>,
        va: usize,
    ) -> Result<Vec<u8>, FaultError> {
        let slot = vm
            .tracker
            .get(va)
            .ok_or(FaultError::UntrackedHeapPage { va })?
            .swap
            .ok_or(FaultError::SwapCorrupted)?;
        let blocks = slot_blocks(&self.swap.lock(), slot);

        let mut staged = vec![0u8; PAGE_SIZE];
        read_page(&mut *self.disk.lock(), &blocks, &mut staged)?;

        vm.tracker.take_swap(va)?;
        self.swap.lock().free(slot).map_err(|_| FaultError::SwapCorrupted)?;
        log_info!(target: "swap", "retrieve pid={} va=0x{:x} block={}", vm.pid, va, blocks[0]);
        Ok(staged)
    }

    /// Maps a fresh frame holding `staged` at heap page `va`.
    pub(super) fn install_staged<M: PageMapper>(
        &self,
        vm: &mut ProcessVm<M>,
        va: usize,
        staged: &[u8],
    ) -> Result<usize, FaultError> {
        let pa = self.frames.lock().alloc().ok_or(FaultError::OutOfFrames)?;
        let copied = match self.frames.lock().page_mut(pa) {
            Some(bytes) => {
                bytes.copy_from_slice(staged);
                true
            }
            None => false,
        };
        if !copied {
            self.frames.lock().free(pa);
            return Err(FaultError::UnknownFrame { pa });
        }
        self.install_heap_page(vm, va, pa)?;
        Ok(pa)
    }

    /// Maps `pa` at heap page `va` and records it as resident.
    pub(super) fn install_heap_page<M: PageMapper>(
        &self,
        vm: &mut ProcessVm<M>,
        va: usize,
        pa: usize,
    ) -> Result<(), FaultError> {
        if let Err(err) = vm.table.map(va, pa, PageFlags::HEAP) {
            self.frames.lock().free(pa);
            return Err(err.into());
        }
        let now = self.timer.now();
        vm.tracker.mark_loaded(va, now)?;
        vm.resident_heap += 1;
        Ok(())
    }
}
