// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation targeting QEMU's `virt` machine.

use super::{Timer, Tlb};

/// Virt specific timer reading the `time` CSR.
pub struct VirtTimer;

impl Timer for VirtTimer {
    fn now(&self) -> u64 {
        riscv::register::time::read() as u64
    }
}

/// Sv39 TLB helper issuing `sfence.vma`.
pub struct VirtTlb;

impl Tlb for VirtTlb {
    fn flush_all(&self) {
        unsafe {
            core::arch::asm!("sfence.vma x0, x0", options(nostack));
        }
    }

    fn flush_page(&self, va: usize) {
        unsafe {
            core::arch::asm!("sfence.vma {0}, x0", in(reg) va, options(nostack));
        }
    }
}
