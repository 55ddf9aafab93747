// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scoped page-table edits that unwind unless committed.

extern crate alloc;

use alloc::vec::Vec;
use spin::Mutex;

use super::{FrameAllocator, MapError, PageFlags, PageMapper};

/// Records leaves installed through it and removes them again on drop
/// unless [`MappingGuard::commit`] was called.
///
/// Frames installed with [`MappingGuard::map_owned`] are released on unwind;
/// frames installed with [`MappingGuard::map_borrowed`] belong to someone else
/// and are only unmapped.
pub struct MappingGuard<'a, M: PageMapper, F: FrameAllocator> {
    table: &'a mut M,
    frames: &'a Mutex<F>,
    installed: Vec<(usize, bool)>,
    committed: bool,
}

impl<'a, M: PageMapper, F: FrameAllocator> MappingGuard<'a, M, F> {
    pub fn new(table: &'a mut M, frames: &'a Mutex<F>) -> Self {
        Self { table, frames, installed: Vec::new(), committed: false }
    }

    /// Installs a leaf whose frame the guard releases on unwind.
    pub fn map_owned(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        self.table.map(va, pa, flags)?;
        self.installed.push((va, true));
        Ok(())
    }

    /// Installs a leaf whose frame stays allocated on unwind.
    pub fn map_borrowed(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        self.table.map(va, pa, flags)?;
        self.installed.push((va, false));
        Ok(())
    }

    /// Read access to the table being edited.
    pub fn table(&self) -> &M {
        &*self.table
    }

    /// Keeps every installed leaf and returns how many there were.
    pub fn commit(mut self) -> usize {
        self.committed = true;
        self.installed.len()
    }
}

impl<M: PageMapper, F: FrameAllocator> Drop for MappingGuard<'_, M, F> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (va, owned) in self.installed.drain(..).rev() {
            match self.table.unmap(va) {
                Ok(leaf) if owned => self.frames.lock().free(leaf.pa),
                Ok(_) => {}
                Err(err) => {
                    log_error!(target: "mm", "unwind: unmap va=0x{:x} failed: {:?}", va, err);
                }
            }
        }
    }
}
