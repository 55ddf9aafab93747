// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-fault classification and the COW, heap and segment resolvers.

extern crate alloc;

use alloc::vec;

use super::Pager;
use crate::error::FaultError;
use crate::hal::{BlockDevice, Timer, Tlb};
use crate::image::Segment;
use crate::mm::{
    page_round_down, pages, FrameAllocator, MappingGuard, PageFlags, PageMapper, Translation, PAGE_SIZE,
};
use crate::process::{Process, ProcessVm};

const SCAUSE_INSTRUCTION_PAGE_FAULT: usize = 12;
const SCAUSE_LOAD_PAGE_FAULT: usize = 13;
const SCAUSE_STORE_PAGE_FAULT: usize = 15;

/// Access that raised the fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCause {
    Instruction,
    Load,
    /// Store or AMO.
    Store,
}

impl FaultCause {
    /// Decodes a RISC-V `scause` value.
    pub fn from_scause(scause: usize) -> Option<Self> {
        match scause {
            SCAUSE_INSTRUCTION_PAGE_FAULT => Some(FaultCause::Instruction),
            SCAUSE_LOAD_PAGE_FAULT => Some(FaultCause::Load),
            SCAUSE_STORE_PAGE_FAULT => Some(FaultCause::Store),
            _ => None,
        }
    }

    pub fn is_write_or_exec(self) -> bool {
        matches!(self, FaultCause::Store | FaultCause::Instruction)
    }

    /// Whether a leaf with `flags` satisfies this access.
    pub fn permitted_by(self, flags: PageFlags) -> bool {
        let needed = match self {
            FaultCause::Instruction => PageFlags::EXECUTE,
            FaultCause::Load => PageFlags::READ,
            FaultCause::Store => PageFlags::WRITE,
        };
        flags.contains(PageFlags::VALID | PageFlags::USER | needed)
    }
}

/// Trap information handed to the pager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    pub cause: FaultCause,
    pub addr: usize,
}

impl FaultInfo {
    pub fn new(cause: FaultCause, addr: usize) -> Self {
        Self { cause, addr }
    }

    /// Builds fault info from the trap CSRs.
    pub fn from_trap(scause: usize, stval: usize) -> Result<Self, FaultError> {
        let cause = FaultCause::from_scause(scause).ok_or(FaultError::NotPageFault { scause })?;
        Ok(Self { cause, addr: stval })
    }
}

/// How a fault was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// A shared page was copied and made writable.
    CopyOnWrite,
    /// A heap page was touched for the first time.
    HeapZeroFill,
    /// A heap page was read back from swap.
    HeapSwapIn,
    /// Pages of a program segment were loaded.
    Segment { loaded: usize },
    /// The leaf already allowed the access; only the TLB was stale.
    Spurious,
}

impl<F, D, T, L> Pager<F, D, T, L>
where
    F: FrameAllocator,
    D: BlockDevice,
    T: Timer,
    L: Tlb,
{
    /// Resolves one page fault of `process`.
    ///
    /// Any error is fatal: before it is returned the address space has been
    /// released and the process marked killed.
    pub fn handle_fault<M: PageMapper>(
        &self,
        process: &Process<M>,
        info: FaultInfo,
    ) -> Result<FaultKind, FaultError> {
        let mut vm = process.lock();
        if vm.killed {
            return Err(FaultError::Killed);
        }
        let va = page_round_down(info.addr);
        log_debug!(target: "fault", "page fault pid={} va=0x{:x} cause={:?}", vm.pid, info.addr, info.cause);

        match self.dispatch(&mut vm, info.cause, va) {
            Ok(kind) => {
                self.tlb.flush_page(va);
                Ok(kind)
            }
            Err(err) => {
                log_error!(
                    target: "fault",
                    "killing pid={} ({}) va=0x{:x}: {}",
                    vm.pid,
                    vm.name,
                    info.addr,
                    err
                );
                self.release_vm(&mut vm);
                vm.killed = true;
                Err(err)
            }
        }
    }

    fn dispatch<M: PageMapper>(
        &self,
        vm: &mut ProcessVm<M>,
        cause: FaultCause,
        va: usize,
    ) -> Result<FaultKind, FaultError> {
        if let Some(leaf) = vm.table.translate(va) {
            if cause.permitted_by(leaf.flags) {
                return Ok(FaultKind::Spurious);
            }
            let shared = cause.is_write_or_exec()
                && vm.cow_enabled
                && self.cow.lock().is_shared(vm.cow_group, leaf.pa);
            if shared && leaf.flags.contains(PageFlags::COW) {
                return self.resolve_cow(vm, va, leaf);
            }
            return Err(FaultError::ProtectionViolation { va });
        }
        if vm.heap.contains(&va) {
            return self.resolve_heap(vm, va);
        }
        self.resolve_segment(vm, va)
    }

    fn resolve_cow<M: PageMapper>(
        &self,
        vm: &mut ProcessVm<M>,
        va: usize,
        leaf: Translation,
    ) -> Result<FaultKind, FaultError> {
        let copy = self.frames.lock().alloc().ok_or(FaultError::OutOfFrames)?;
        if !self.frames.lock().copy_page(leaf.pa, copy) {
            self.frames.lock().free(copy);
            return Err(FaultError::UnknownFrame { pa: leaf.pa });
        }
        if let Err(err) = vm.table.remap(va, copy, leaf.flags.private_writable()) {
            self.frames.lock().free(copy);
            return Err(err.into());
        }
        log_info!(
            target: "cow",
            "copy pid={} va=0x{:x} pa=0x{:x} -> 0x{:x}",
            vm.pid,
            va,
            leaf.pa,
            copy
        );
        Ok(FaultKind::CopyOnWrite)
    }

    fn resolve_heap<M: PageMapper>(&self, vm: &mut ProcessVm<M>, va: usize) -> Result<FaultKind, FaultError> {
        let page = vm.tracker.get(va).copied().ok_or(FaultError::UntrackedHeapPage { va })?;
        // Read the page back before making room so its blocks are free for the victim.
        let staged = match page.swap {
            Some(_) => Some(self.stage_swapped(vm, va)?),
            None => None,
        };
        if vm.resident_heap >= self.config.max_resident_heap_pages {
            self.evict_one(vm)?;
        }
        if let Some(bytes) = staged {
            self.install_staged(vm, va, &bytes)?;
            return Ok(FaultKind::HeapSwapIn);
        }
        let pa = self.frames.lock().alloc_zeroed().ok_or(FaultError::OutOfFrames)?;
        self.install_heap_page(vm, va, pa)?;
        log_info!(target: "heap", "zero-fill pid={} va=0x{:x}", vm.pid, va);
        Ok(FaultKind::HeapZeroFill)
    }

    fn resolve_segment<M: PageMapper>(&self, vm: &mut ProcessVm<M>, va: usize) -> Result<FaultKind, FaultError> {
        let image = vm.image.clone().ok_or(FaultError::NoImage)?;
        let segment = select_segment(image.segments(), va)?;

        let flags = segment.page_flags();
        let mut guard = MappingGuard::new(&mut vm.table, &self.frames);
        for page in pages(segment.vaddr, segment.end()) {
            if guard.table().translate(page).is_some() {
                continue;
            }
            let pa = self.frames.lock().alloc_zeroed().ok_or(FaultError::OutOfFrames)?;
            let page_off = page - segment.vaddr;
            if page_off < segment.file_size {
                let len = PAGE_SIZE.min(segment.file_size - page_off);
                let mut staged = vec![0u8; len];
                let filled = image
                    .read_at(segment.offset + page_off, &mut staged)
                    .map_err(FaultError::from)
                    .and_then(|()| match self.frames.lock().page_mut(pa) {
                        Some(bytes) => {
                            bytes[..len].copy_from_slice(&staged);
                            Ok(())
                        }
                        None => Err(FaultError::UnknownFrame { pa }),
                    });
                if let Err(err) = filled {
                    self.frames.lock().free(pa);
                    return Err(err);
                }
            }
            if let Err(err) = guard.map_owned(page, pa, flags) {
                self.frames.lock().free(pa);
                return Err(err.into());
            }
        }
        let loaded = guard.commit();
        self.tlb.flush_range(segment.vaddr, segment.mem_size);
        log_info!(
            target: "exec",
            "load segment pid={} va=0x{:x} off=0x{:x} size=0x{:x} pages={}",
            vm.pid,
            segment.vaddr,
            segment.offset,
            segment.file_size,
            loaded
        );
        Ok(FaultKind::Segment { loaded })
    }
}

/// Scans headers in order up to the one covering `va`; any malformed header on the way is fatal.
fn select_segment(segments: &[Segment], va: usize) -> Result<Segment, FaultError> {
    for segment in segments {
        segment.validate()?;
        if segment.contains(va) {
            return Ok(*segment);
        }
    }
    Err(FaultError::SegmentNotFound { va })
}
