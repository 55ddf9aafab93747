// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Owner of the fault-path tables and the process memory lifecycle
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: Pager (new, create_process, grow_heap, fork, release, handle_fault, evict_one, retrieve)
//! DEPENDS_ON: cow::CowRegistry, swap::SwapArea, heap::HeapTracker, hal traits
//! INVARIANTS: Lock order is process fault lock, then any one of registry/swap/frames/disk;
//!             registry and swap locks are released before page copies and disk transfers

extern crate alloc;

use alloc::string::String;
use core::ops::Range;

use spin::Mutex;

use crate::config::{ConfigError, PagerConfig};
use crate::cow::{fork_address_space, CowRegistry, GroupId, Leave};
use crate::error::{FaultError, ForkError};
use crate::hal::{BlockDevice, Timer, Tlb, BLOCK_SIZE, BLOCKS_PER_PAGE};
use crate::heap::{HeapPage, HeapTracker};
use crate::mm::{pages, FrameAllocator, PageMapper, PAGE_SIZE};
use crate::process::{ImageRef, Pid, Process, ProcessVm};
use crate::swap::{slot_blocks, SwapArea, SwapSlot};

mod evict;
mod fault;

pub use fault::{FaultCause, FaultInfo, FaultKind};

/// Virtual-memory fault handler and the kernel-wide state it owns.
///
/// Created once at boot. Every table lives behind its own lock; callers
/// serialise faults per process through [`Process::lock`].
pub struct Pager<F, D, T, L> {
    config: PagerConfig,
    frames: Mutex<F>,
    disk: Mutex<D>,
    swap: Mutex<SwapArea>,
    cow: Mutex<CowRegistry>,
    timer: T,
    tlb: L,
}

impl<F, D, T, L> Pager<F, D, T, L>
where
    F: FrameAllocator,
    D: BlockDevice,
    T: Timer,
    L: Tlb,
{
    /// Validates `config` and starts with every swap block and group slot free.
    pub fn new(config: PagerConfig, frames: F, disk: D, timer: T, tlb: L) -> Result<Self, ConfigError> {
        config.validate()?;
        log_info!(
            target: "pager",
            "init groups={} shared/group={} swap={}+{} resident<={}",
            config.max_procs,
            config.shared_pages_per_group,
            config.swap.start_block,
            config.swap.blocks,
            config.max_resident_heap_pages
        );
        Ok(Self {
            config,
            frames: Mutex::new(frames),
            disk: Mutex::new(disk),
            swap: Mutex::new(SwapArea::new(config.swap)),
            cow: Mutex::new(CowRegistry::new(config.max_procs, config.shared_pages_per_group)),
            timer,
            tlb,
        })
    }

    pub fn config(&self) -> &PagerConfig {
        &self.config
    }

    pub fn frames(&self) -> &Mutex<F> {
        &self.frames
    }

    pub fn disk(&self) -> &Mutex<D> {
        &self.disk
    }

    pub fn registry(&self) -> &Mutex<CowRegistry> {
        &self.cow
    }

    pub fn swap(&self) -> &Mutex<SwapArea> {
        &self.swap
    }

    pub fn tlb(&self) -> &L {
        &self.tlb
    }

    /// Wraps a freshly built address space. The heap starts empty right above the image.
    pub fn create_process<M: PageMapper>(
        &self,
        pid: Pid,
        name: &str,
        table: M,
        image: Option<ImageRef>,
    ) -> Process<M> {
        let image_end = image.as_ref().map_or(0, |image| image.image_end());
        Process::new(ProcessVm {
            pid,
            name: String::from(name),
            table,
            image,
            image_end,
            heap: image_end..image_end,
            tracker: HeapTracker::new(self.config.max_heap_pages),
            resident_heap: 0,
            cow_group: None,
            cow_enabled: false,
            killed: false,
            released: false,
        })
    }

    /// Extends the heap by `count` pages without backing them; returns the new range.
    pub fn grow_heap<M: PageMapper>(
        &self,
        process: &Process<M>,
        count: usize,
    ) -> Result<Range<usize>, FaultError> {
        let mut vm = process.lock();
        if vm.killed {
            return Err(FaultError::Killed);
        }
        let start = vm.heap.end;
        let end = count
            .checked_mul(PAGE_SIZE)
            .and_then(|len| start.checked_add(len))
            .ok_or(FaultError::HeapLimit)?;
        if vm.tracker.len() + count > vm.tracker.capacity() {
            return Err(FaultError::HeapLimit);
        }
        for va in pages(start, end) {
            vm.tracker.track(va)?;
        }
        vm.heap.end = end;
        log_debug!(target: "heap", "grow pid={} break=0x{:x} pages={}", vm.pid, end, vm.tracker.len());
        Ok(start..end)
    }

    /// Forks `parent` into a new process sharing its pages copy-on-write.
    ///
    /// Holds the parent's fault lock throughout. On failure the child is torn
    /// down again and the parent stays in its group with its downgraded pages.
    pub fn fork<M: PageMapper>(
        &self,
        parent: &Process<M>,
        child_pid: Pid,
        child_table: M,
    ) -> Result<Process<M>, ForkError> {
        let mut pvm = parent.lock();
        if pvm.killed {
            return Err(ForkError::ParentKilled);
        }
        let group = match pvm.cow_group {
            Some(group) => group,
            None => {
                let group = self.create_joined_group()?;
                pvm.cow_group = Some(group);
                group
            }
        };
        self.cow.lock().join(group)?;
        pvm.cow_enabled = true;

        let mut child = ProcessVm {
            pid: child_pid,
            name: pvm.name.clone(),
            table: child_table,
            image: pvm.image.clone(),
            image_end: pvm.image_end,
            heap: pvm.heap.clone(),
            tracker: HeapTracker::new(pvm.tracker.capacity()),
            resident_heap: 0,
            cow_group: Some(group),
            cow_enabled: true,
            killed: false,
            released: false,
        };

        let size = pvm.user_size();
        let shared = fork_address_space(&self.cow, &self.frames, group, &mut pvm.table, &mut child.table, size)
            .and_then(|stats| self.clone_heap(&pvm.tracker, &mut child.tracker).map(|()| stats));
        let stats = match shared {
            Ok(stats) => stats,
            Err(err) => {
                log_warn!(target: "cow", "fork pid={} -> {} failed: {}", pvm.pid, child_pid, err);
                self.release_vm(&mut child);
                return Err(err);
            }
        };
        child.resident_heap = pvm.resident_heap;
        // Every leaf changed in the parent; drop all cached translations.
        self.tlb.flush_all();
        log_info!(
            target: "cow",
            "fork pid={} -> {} group={} shared={} copied={}",
            pvm.pid,
            child_pid,
            group,
            stats.shared,
            stats.copied
        );
        Ok(Process::new(child))
    }

    /// Releases every page, swap slot and group membership held by `process`.
    pub fn release<M: PageMapper>(&self, process: &Process<M>) {
        let mut vm = process.lock();
        self.release_vm(&mut vm);
    }

    /// Number of swap blocks currently claimed.
    pub fn swap_used(&self) -> usize {
        self.swap.lock().used_blocks()
    }

    fn create_joined_group(&self) -> Result<GroupId, ForkError> {
        let mut registry = self.cow.lock();
        let group = registry.create_group()?;
        registry.join(group)?;
        Ok(group)
    }

    /// Copies heap descriptors; swapped-out pages get their own slot and blocks.
    fn clone_heap(&self, parent: &HeapTracker, child: &mut HeapTracker) -> Result<(), ForkError> {
        for (va, page) in parent.iter() {
            let copy = match page.swap {
                Some(slot) => {
                    let own = self.copy_slot(slot)?;
                    HeapPage { swap: Some(own), ..*page }
                }
                None => *page,
            };
            // Capacities match; the insert cannot overflow.
            let inserted = child.insert(va, copy);
            debug_assert!(inserted.is_ok());
        }
        Ok(())
    }

    fn copy_slot(&self, from: SwapSlot) -> Result<SwapSlot, ForkError> {
        let (to, src, dst) = {
            let mut swap = self.swap.lock();
            let to = swap.alloc_page().ok_or(ForkError::SwapExhausted)?;
            (to, slot_blocks(&swap, from), slot_blocks(&swap, to))
        };
        let mut buf = [0u8; BLOCK_SIZE];
        let mut disk = self.disk.lock();
        for chunk in 0..BLOCKS_PER_PAGE {
            let moved = disk.read_block(src[chunk], &mut buf).and_then(|()| disk.write_block(dst[chunk], &buf));
            if let Err(err) = moved {
                drop(disk);
                self.free_slot(to);
                return Err(err.into());
            }
        }
        Ok(to)
    }

    pub(crate) fn free_slot(&self, slot: SwapSlot) {
        if let Err(err) = self.swap.lock().free(slot) {
            log_warn!(target: "swap", "free slot={} failed: {:?}", slot, err);
        }
    }

    /// Tears the address space down. Safe to call more than once.
    pub(crate) fn release_vm<M: PageMapper>(&self, vm: &mut ProcessVm<M>) {
        if vm.released {
            return;
        }
        vm.released = true;
        let mut freed = 0usize;
        for va in pages(0, vm.user_size()) {
            let Ok(leaf) = vm.table.unmap(va) else {
                continue;
            };
            if !self.cow.lock().is_shared(vm.cow_group, leaf.pa) {
                self.frames.lock().free(leaf.pa);
                freed += 1;
            }
        }
        for slot in vm.tracker.drain() {
            self.free_slot(slot);
        }
        vm.resident_heap = 0;
        if let Some(group) = vm.cow_group.take() {
            let left = self.cow.lock().leave(group);
            match left {
                Ok(Leave::TornDown(orphans)) => {
                    let mut frames = self.frames.lock();
                    for pa in orphans {
                        frames.free(pa);
                    }
                    log_debug!(target: "cow", "group={} torn down", group);
                }
                Ok(Leave::Remaining(_)) => {}
                Err(err) => log_warn!(target: "cow", "leave group={} failed: {}", group, err),
            }
        }
        self.tlb.flush_all();
        log_debug!(target: "pager", "release pid={} freed={}", vm.pid, freed);
    }
}
