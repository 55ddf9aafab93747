// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write group registry and fork-time address-space sharing
//! OWNERS: @kernel-mm-team
//! PUBLIC API: CowRegistry (create_group, join, leave, add_shared_page, is_shared), GroupId,
//!             SharedPages, fork_address_space
//! DEPENDS_ON: mm::{PageMapper, FrameAllocator, MappingGuard}
//! INVARIANTS: One slot per process; a process belongs to at most one group;
//!             a group's shared set is bounded and rejects duplicates and overflow silently;
//!             the last `leave` reclaims the slot and hands the shared frames back to the caller

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;
use core::num::NonZeroU32;

use spin::Mutex;

use crate::error::ForkError;
use crate::mm::{pages, FrameAllocator, MappingGuard, PageMapper};

/// Handle referencing a COW group slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(NonZeroU32);

impl GroupId {
    fn from_index(index: usize) -> Self {
        // SAFETY: index is offset by one, ensuring the raw value is never zero.
        unsafe { Self(NonZeroU32::new_unchecked(index as u32 + 1)) }
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Constructs a handle from its raw value; zero means "no group".
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn to_raw(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a shared-page insertion. Callers are free to ignore it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharedInsert {
    Inserted,
    AlreadyShared,
    /// Set is at capacity; the page was not recorded.
    Full,
    /// No group was given.
    NoGroup,
}

/// Bounded set of physical page addresses.
#[derive(Clone, Debug)]
pub struct SharedPages {
    pages: Vec<usize>,
    capacity: usize,
}

impl SharedPages {
    pub fn new(capacity: usize) -> Self {
        Self { pages: Vec::with_capacity(capacity), capacity }
    }

    pub fn insert(&mut self, pa: usize) -> SharedInsert {
        if self.pages.contains(&pa) {
            return SharedInsert::AlreadyShared;
        }
        if self.pages.len() >= self.capacity {
            return SharedInsert::Full;
        }
        self.pages.push(pa);
        SharedInsert::Inserted
    }

    pub fn contains(&self, pa: usize) -> bool {
        self.pages.contains(&pa)
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

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.pages.iter().copied()
    }

    fn take(&mut self) -> Vec<usize> {
        core::mem::take(&mut self.pages)
    }
}

/// Errors produced by registry bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CowError {
    /// Every group slot is in use.
    NoGroupAvailable,
    /// Handle does not name a live group.
    InvalidGroup,
}

impl fmt::Display for CowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CowError::NoGroupAvailable => f.write_str("no cow group available"),
            CowError::InvalidGroup => f.write_str("invalid cow group"),
        }
    }
}

struct CowGroup {
    in_use: bool,
    members: usize,
    shared: SharedPages,
}

/// Result of dropping a member from a group.
#[derive(Debug, PartialEq, Eq)]
pub enum Leave {
    /// Other members remain.
    Remaining(usize),
    /// The group was torn down; these frames are no longer referenced by any member.
    TornDown(Vec<usize>),
}

/// Table of COW groups, one slot per process.
pub struct CowRegistry {
    groups: Vec<CowGroup>,
}

impl CowRegistry {
    /// Creates `slots` free groups each able to share `capacity` pages.
    pub fn new(slots: usize, capacity: usize) -> Self {
        let groups = (0..slots)
            .map(|_| CowGroup { in_use: false, members: 0, shared: SharedPages::new(capacity) })
            .collect();
        Self { groups }
    }

    /// Claims the first free slot.
    pub fn create_group(&mut self) -> Result<GroupId, CowError> {
        let index = self
            .groups
            .iter()
            .position(|group| !group.in_use)
            .ok_or(CowError::NoGroupAvailable)?;
        let group = &mut self.groups[index];
        group.in_use = true;
        group.members = 0;
        Ok(GroupId::from_index(index))
    }

    /// Adds one member reference.
    pub fn join(&mut self, id: GroupId) -> Result<usize, CowError> {
        let group = self.group_mut(id)?;
        group.members += 1;
        Ok(group.members)
    }

    /// Drops one member reference, tearing the group down when none remain.
    pub fn leave(&mut self, id: GroupId) -> Result<Leave, CowError> {
        let group = self.group_mut(id)?;
        group.members = group.members.saturating_sub(1);
        if group.members > 0 {
            return Ok(Leave::Remaining(group.members));
        }
        group.in_use = false;
        Ok(Leave::TornDown(group.shared.take()))
    }

    /// Records `pa` as shared by `id`'s members.
    pub fn add_shared_page(&mut self, id: Option<GroupId>, pa: usize) -> SharedInsert {
        let Some(id) = id else {
            return SharedInsert::NoGroup;
        };
        match self.group_mut(id) {
            Ok(group) => group.shared.insert(pa),
            Err(_) => SharedInsert::NoGroup,
        }
    }

    pub fn is_shared(&self, id: Option<GroupId>, pa: usize) -> bool {
        id.and_then(|id| self.group(id).ok()).is_some_and(|group| group.shared.contains(pa))
    }

    /// Live member count of `id`, zero for free slots.
    pub fn members(&self, id: GroupId) -> usize {
        self.group(id).map(|group| group.members).unwrap_or(0)
    }

    /// Shared set of a live group.
    pub fn shared_pages(&self, id: GroupId) -> Option<&SharedPages> {
        self.group(id).ok().map(|group| &group.shared)
    }

    /// Number of slots currently claimed.
    pub fn groups_in_use(&self) -> usize {
        self.groups.iter().filter(|group| group.in_use).count()
    }

    fn group(&self, id: GroupId) -> Result<&CowGroup, CowError> {
        self.groups
            .get(id.index())
            .filter(|group| group.in_use)
            .ok_or(CowError::InvalidGroup)
    }

    fn group_mut(&mut self, id: GroupId) -> Result<&mut CowGroup, CowError> {
        self.groups
            .get_mut(id.index())
            .filter(|group| group.in_use)
            .ok_or(CowError::InvalidGroup)
    }
}

/// Pages handled by one [`fork_address_space`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForkStats {
    /// Pages now mapped read-only in both tables.
    pub shared: usize,
    /// Pages the child received a private copy of because the group's set was full.
    pub copied: usize,
}

/// Shares every mapped page of `[0, size)` between `parent` and `child`.
///
/// Parent leaves are downgraded to read-only and mirrored into `child`, and the
/// frame is recorded in `group`'s shared set. When that set is full the child
/// gets a private copy instead and the parent keeps its original permissions.
/// The caller holds the parent's fault lock for the whole call.
///
/// On failure every leaf installed in `child` by this call is removed again;
/// parent pages already downgraded stay read-only.
pub fn fork_address_space<M: PageMapper, F: FrameAllocator>(
    registry: &Mutex<CowRegistry>,
    frames: &Mutex<F>,
    group: GroupId,
    parent: &mut M,
    child: &mut M,
    size: usize,
) -> Result<ForkStats, ForkError> {
    let mut stats = ForkStats::default();
    let mut installed = MappingGuard::new(child, frames);

    for va in pages(0, size) {
        let Some(leaf) = parent.translate(va) else {
            continue;
        };
        let read_only = leaf.flags.shared_read_only();
        parent.remap(va, leaf.pa, read_only)?;
        let outcome = registry.lock().add_shared_page(Some(group), leaf.pa);

        if outcome == SharedInsert::Full {
            parent.remap(va, leaf.pa, leaf.flags)?;
            let copy = frames.lock().alloc().ok_or(ForkError::OutOfFrames)?;
            if !frames.lock().copy_page(leaf.pa, copy) {
                frames.lock().free(copy);
                return Err(ForkError::OutOfFrames);
            }
            if let Err(err) = installed.map_owned(va, copy, leaf.flags) {
                frames.lock().free(copy);
                return Err(err.into());
            }
            stats.copied += 1;
            continue;
        }

        installed.map_borrowed(va, leaf.pa, read_only)?;
        stats.shared += 1;
    }

    installed.commit();
    log_debug!(
        target: "cow",
        "fork share group={} shared={} copied={}",
        group,
        stats.shared,
        stats.copied
    );
    Ok(stats)
}


#[cfg(test)]
mod tests_prop;
