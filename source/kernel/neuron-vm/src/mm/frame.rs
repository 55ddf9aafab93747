// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frame allocator contract.

extern crate alloc;

use alloc::vec::Vec;

/// Allocator handing out page-sized physical frames.
///
/// Frames are addressed by physical address; on the kernel target they are
/// reachable through the identity map, hosted backends keep them in memory.
pub trait FrameAllocator {
    /// Acquires one frame with unspecified contents.
    fn alloc(&mut self) -> Option<usize>;

    /// Returns a frame to the pool.
    fn free(&mut self, pa: usize);

    /// Borrows the bytes of a live frame.
    fn page(&self, pa: usize) -> Option<&[u8]>;

    /// Mutably borrows the bytes of a live frame.
    fn page_mut(&mut self, pa: usize) -> Option<&mut [u8]>;

    /// Acquires one frame filled with zeroes.
    fn alloc_zeroed(&mut self) -> Option<usize> {
        let pa = self.alloc()?;
        match self.page_mut(pa) {
            Some(bytes) => {
                bytes.fill(0);
                Some(pa)
            }
            None => {
                self.free(pa);
                None
            }
        }
    }

    /// Copies the full contents of `src` into `dst`. Returns `false` if either frame is unknown.
    fn copy_page(&mut self, src: usize, dst: usize) -> bool {
        let staged: Vec<u8> = match self.page(src) {
            Some(bytes) => bytes.to_vec(),
            None => return false,
        };
        match self.page_mut(dst) {
            Some(bytes) => {
                bytes.copy_from_slice(&staged);
                true
            }
            None => false,
        }
    }
}
