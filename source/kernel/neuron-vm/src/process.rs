// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Memory-related process state and its per-process fault lock.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::ops::Range;

use spin::{Mutex, MutexGuard};

use crate::cow::GroupId;
use crate::heap::HeapTracker;
use crate::image::ExecImage;
use crate::mm::PageMapper;

/// Process identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared handle to a program image.
pub type ImageRef = Arc<dyn ExecImage + Send + Sync>;

/// Address-space view of a process, guarded by [`Process::lock`].
pub struct ProcessVm<M: PageMapper> {
    pub(crate) pid: Pid,
    pub(crate) name: String,
    pub(crate) table: M,
    pub(crate) image: Option<ImageRef>,
    pub(crate) image_end: usize,
    pub(crate) heap: Range<usize>,
    pub(crate) tracker: HeapTracker,
    pub(crate) resident_heap: usize,
    pub(crate) cow_group: Option<GroupId>,
    pub(crate) cow_enabled: bool,
    pub(crate) killed: bool,
    pub(crate) released: bool,
}

impl<M: PageMapper> ProcessVm<M> {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_table(&self) -> &M {
        &self.table
    }

    /// Heap range `[image_end, break)`.
    pub fn heap(&self) -> Range<usize> {
        self.heap.clone()
    }

    pub fn tracker(&self) -> &HeapTracker {
        &self.tracker
    }

    /// Heap descriptors, for access-time updates from the scheduler tick.
    pub fn tracker_mut(&mut self) -> &mut HeapTracker {
        &mut self.tracker
    }

    /// Heap pages currently mapped.
    pub fn resident_heap(&self) -> usize {
        self.resident_heap
    }

    pub fn cow_group(&self) -> Option<GroupId> {
        self.cow_group
    }

    pub fn cow_enabled(&self) -> bool {
        self.cow_enabled
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Size of the user address space, the range fork shares.
    pub(crate) fn user_size(&self) -> usize {
        self.heap.end.max(self.image_end)
    }
}

/// A process as seen by the pager. The mutex is the per-process fault lock.
pub struct Process<M: PageMapper> {
    pid: Pid,
    vm: Mutex<ProcessVm<M>>,
}

impl<M: PageMapper> Process<M> {
    pub(crate) fn new(vm: ProcessVm<M>) -> Self {
        Self { pid: vm.pid, vm: Mutex::new(vm) }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Takes the fault lock.
    pub fn lock(&self) -> MutexGuard<'_, ProcessVm<M>> {
        self.vm.lock()
    }
}
