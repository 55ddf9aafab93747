// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-table contract used by the fault path.
//!
//! The walk itself lives with the architecture code; this module fixes the
//! Sv39 leaf flag layout and the operations the pager needs from it.

use bitflags::bitflags;

use super::PAGE_SIZE;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Software bit (RSW0): write access was withdrawn by a copy-on-write fork.
        const COW = 1 << 8;
    }
}

impl PageFlags {
    /// Permissions installed for demand-paged heap pages.
    pub const HEAP: PageFlags = PageFlags::VALID
        .union(PageFlags::READ)
        .union(PageFlags::WRITE)
        .union(PageFlags::EXECUTE)
        .union(PageFlags::USER);

    /// Read-only flavour used for pages shared after fork.
    ///
    /// Pages that were writable keep a `COW` marker so a later store fault can
    /// restore write access; pages that never had it stay as they are.
    pub fn shared_read_only(self) -> PageFlags {
        if self.contains(PageFlags::WRITE) {
            (self - PageFlags::WRITE) | PageFlags::COW
        } else {
            self
        }
    }

    /// Flags for the private copy made when a COW page is written.
    pub fn private_writable(self) -> PageFlags {
        (self - PageFlags::COW) | PageFlags::WRITE
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Mapping extends beyond the range the table can describe.
    OutOfRange,
    /// The table refused the mapping.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// No leaf entry exists for the address.
    NotMapped,
}

/// Result of translating a virtual address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Physical address of the backing frame.
    pub pa: usize,
    /// Leaf flags currently installed.
    pub flags: PageFlags,
}

/// Page-table operations required by the pager. All addresses are page aligned.
pub trait PageMapper {
    /// Installs a new leaf; fails with [`MapError::Overlap`] if `va` is mapped.
    fn map(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError>;

    /// Replaces the existing leaf at `va`; fails with [`MapError::NotMapped`] if absent.
    fn remap(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError>;

    /// Removes the leaf at `va` and returns what it pointed to.
    ///
    /// The frame is not released; callers decide whether it is still referenced.
    fn unmap(&mut self, va: usize) -> Result<Translation, MapError>;

    /// Returns the current leaf for the page containing `va`.
    fn translate(&self, va: usize) -> Option<Translation>;
}

/// Checks shared by every mapper implementation before a leaf is installed.
pub fn check_leaf(va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
    if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
        return Err(MapError::Unaligned);
    }
    if !flags.contains(PageFlags::VALID) {
        return Err(MapError::InvalidFlags);
    }
    Ok(())
}
