// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the integration tests: a pager over the hosted HAL
//! backends, user-memory accessors that fault like a hart would, and an ELF builder.

#![allow(dead_code)]

use std::sync::Arc;

use neuron_vm::hal::sim::{CountingTlb, FramePool, RamDisk, TickTimer};
use neuron_vm::image::ElfImage;
use neuron_vm::mm::{FrameAllocator, PageMapper, PAGE_SIZE};
use neuron_vm::process::ImageRef;
use neuron_vm::{FaultCause, FaultError, FaultInfo, FaultKind, Pager, PagerConfig};

pub use neuron_vm::hal::sim::SoftPageTable;

pub type TestPager = Pager<FramePool, RamDisk, TickTimer, CountingTlb>;
pub type TestProcess = neuron_vm::Process<SoftPageTable>;

pub const FRAME_BASE: usize = 0x8000_0000;

/// Pager with `frames` physical frames and a disk just large enough for the swap area.
pub fn pager(config: PagerConfig, frames: usize) -> TestPager {
    let disk_blocks = config.swap.start_block as usize + config.swap.blocks;
    Pager::new(
        config,
        FramePool::new(FRAME_BASE, frames),
        RamDisk::new(disk_blocks),
        TickTimer::new(),
        CountingTlb::new(),
    )
    .expect("valid config")
}

/// Small swap area placed past a few reserved blocks.
pub fn config(resident_ceiling: usize) -> PagerConfig {
    PagerConfig::new().with_resident_ceiling(resident_ceiling).with_swap(16, 64)
}

fn access(
    pager: &TestPager,
    process: &TestProcess,
    cause: FaultCause,
    va: usize,
) -> Result<(Option<FaultKind>, usize), FaultError> {
    let mut kind = None;
    for _ in 0..2 {
        let leaf = process.lock().page_table().translate(va);
        match leaf {
            Some(leaf) if cause.permitted_by(leaf.flags) => {
                return Ok((kind, leaf.pa + va % PAGE_SIZE));
            }
            _ => kind = Some(pager.handle_fault(process, FaultInfo::new(cause, va))?),
        }
    }
    panic!("va=0x{:x} still inaccessible after fault", va);
}

/// Writes `data` at `va` (within one page), faulting first when needed.
pub fn store(
    pager: &TestPager,
    process: &TestProcess,
    va: usize,
    data: &[u8],
) -> Result<Option<FaultKind>, FaultError> {
    let (kind, pa) = access(pager, process, FaultCause::Store, va)?;
    let base = pa - pa % PAGE_SIZE;
    let offset = pa % PAGE_SIZE;
    let mut frames = pager.frames().lock();
    let page = frames.page_mut(base).expect("mapped frame is live");
    page[offset..offset + data.len()].copy_from_slice(data);
    Ok(kind)
}

/// Reads `len` bytes at `va` (within one page), faulting first when needed.
pub fn load(
    pager: &TestPager,
    process: &TestProcess,
    va: usize,
    len: usize,
) -> Result<(Option<FaultKind>, Vec<u8>), FaultError> {
    let (kind, pa) = access(pager, process, FaultCause::Load, va)?;
    let base = pa - pa % PAGE_SIZE;
    let offset = pa % PAGE_SIZE;
    let frames = pager.frames().lock();
    let page = frames.page(base).expect("mapped frame is live");
    Ok((kind, page[offset..offset + len].to_vec()))
}

/// Physical frame currently mapped at `va`.
pub fn frame_of(process: &TestProcess, va: usize) -> Option<usize> {
    process.lock().page_table().translate(va).map(|leaf| leaf.pa)
}

/// One PT_LOAD header for [`elf`].
pub struct Load<'a> {
    pub vaddr: u64,
    pub flags: u32,
    pub data: &'a [u8],
    pub mem_size: u64,
}

/// Builds an ELF64 image whose PT_LOAD segments carry `loads` in order.
pub fn elf(loads: &[Load<'_>]) -> Vec<u8> {
    const EHDR: usize = 64;
    const PHDR: usize = 56;
    let mut out = vec![0u8; EHDR + loads.len() * PHDR];
    out[0..4].copy_from_slice(b"\x7FELF");
    out[4] = 2;
    out[5] = 1;
    out[32..40].copy_from_slice(&(EHDR as u64).to_le_bytes());
    out[54..56].copy_from_slice(&(PHDR as u16).to_le_bytes());
    out[56..58].copy_from_slice(&(loads.len() as u16).to_le_bytes());
    for (i, load) in loads.iter().enumerate() {
        let offset = out.len() as u64;
        let h = EHDR + i * PHDR;
        out[h..h + 4].copy_from_slice(&1u32.to_le_bytes());
        out[h + 4..h + 8].copy_from_slice(&load.flags.to_le_bytes());
        out[h + 8..h + 16].copy_from_slice(&offset.to_le_bytes());
        out[h + 16..h + 24].copy_from_slice(&load.vaddr.to_le_bytes());
        out[h + 32..h + 40].copy_from_slice(&(load.data.len() as u64).to_le_bytes());
        out[h + 40..h + 48].copy_from_slice(&load.mem_size.to_le_bytes());
        out.extend_from_slice(load.data);
    }
    out
}

pub fn image(loads: &[Load<'_>]) -> ImageRef {
    Arc::new(ElfImage::parse(elf(loads)).expect("well-formed elf"))
}
