// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types surfaced by the fault path and by fork.
//!
//! Every [`FaultError`] is fatal for the faulting process: by the time it is
//! returned from [`crate::Pager::handle_fault`] the address space has been
//! released and the process marked killed.

use core::fmt;

use crate::cow::CowError;
use crate::hal::BlockError;
use crate::heap::HeapError;
use crate::image::{ImageError, SegmentError};
use crate::mm::MapError;

/// Fatal outcome of page-fault handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// Trap cause is not one of the page-fault causes.
    NotPageFault { scause: usize },
    /// The process was already killed by an earlier fault.
    Killed,
    /// Frame allocator is exhausted.
    OutOfFrames,
    /// A frame named by a page-table entry is not known to the allocator.
    UnknownFrame { pa: usize },
    /// A leaf that had to exist was missing.
    MissingMapping { va: usize },
    /// Page-table update failed.
    Map(MapError),
    /// Access is not permitted and no handler applies.
    ProtectionViolation { va: usize },
    /// Heap address without a descriptor.
    UntrackedHeapPage { va: usize },
    /// Resident ceiling reached with nothing resident to evict.
    NoVictim,
    /// No free run of swap blocks.
    SwapExhausted,
    /// Swap bookkeeping disagrees with the descriptor.
    SwapCorrupted,
    /// Swap transfer failed.
    Io(BlockError),
    /// Address outside the heap and the process has no program image.
    NoImage,
    /// Address outside the heap and outside every program segment.
    SegmentNotFound { va: usize },
    /// Program segment failed validation.
    MalformedSegment(SegmentError),
    /// Program image could not be read.
    Image(ImageError),
    /// Heap growth beyond the configured limit.
    HeapLimit,
}

impl From<MapError> for FaultError {
    fn from(err: MapError) -> Self {
        FaultError::Map(err)
    }
}

impl From<BlockError> for FaultError {
    fn from(err: BlockError) -> Self {
        FaultError::Io(err)
    }
}

impl From<ImageError> for FaultError {
    fn from(err: ImageError) -> Self {
        FaultError::Image(err)
    }
}

impl From<SegmentError> for FaultError {
    fn from(err: SegmentError) -> Self {
        FaultError::MalformedSegment(err)
    }
}

impl From<HeapError> for FaultError {
    fn from(err: HeapError) -> Self {
        match err {
            HeapError::Full => FaultError::HeapLimit,
            HeapError::Unaligned | HeapError::Untracked => FaultError::SwapCorrupted,
        }
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::NotPageFault { scause } => write!(f, "scause {} is not a page fault", scause),
            FaultError::Killed => f.write_str("process already killed"),
            FaultError::OutOfFrames => f.write_str("out of physical frames"),
            FaultError::UnknownFrame { pa } => write!(f, "unknown frame pa=0x{:x}", pa),
            FaultError::MissingMapping { va } => write!(f, "missing mapping va=0x{:x}", va),
            FaultError::Map(err) => write!(f, "page table update failed: {:?}", err),
            FaultError::ProtectionViolation { va } => write!(f, "protection violation va=0x{:x}", va),
            FaultError::UntrackedHeapPage { va } => write!(f, "untracked heap page va=0x{:x}", va),
            FaultError::NoVictim => f.write_str("no resident heap page to evict"),
            FaultError::SwapExhausted => f.write_str("swap area exhausted"),
            FaultError::SwapCorrupted => f.write_str("swap bookkeeping corrupted"),
            FaultError::Io(err) => write!(f, "swap i/o: {}", err),
            FaultError::NoImage => f.write_str("no program image"),
            FaultError::SegmentNotFound { va } => write!(f, "no segment contains va=0x{:x}", va),
            FaultError::MalformedSegment(err) => write!(f, "malformed segment: {:?}", err),
            FaultError::Image(err) => write!(f, "program image: {:?}", err),
            FaultError::HeapLimit => f.write_str("heap limit reached"),
        }
    }
}

/// Failure reported to the caller of fork.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkError {
    /// Every COW group slot is in use.
    NoGroupAvailable,
    /// The parent has been killed.
    ParentKilled,
    /// Installing or downgrading a leaf failed.
    Map(MapError),
    /// Frame allocator is exhausted.
    OutOfFrames,
    /// No swap slot for a copied swapped-out heap page.
    SwapExhausted,
    /// Copying a swapped-out heap page failed.
    Io(BlockError),
    /// Registry state changed under the fork.
    Group(CowError),
}

impl From<MapError> for ForkError {
    fn from(err: MapError) -> Self {
        ForkError::Map(err)
    }
}

impl From<BlockError> for ForkError {
    fn from(err: BlockError) -> Self {
        ForkError::Io(err)
    }
}

impl From<CowError> for ForkError {
    fn from(err: CowError) -> Self {
        match err {
            CowError::NoGroupAvailable => ForkError::NoGroupAvailable,
            CowError::InvalidGroup => ForkError::Group(err),
        }
    }
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkError::NoGroupAvailable => f.write_str("no cow group available"),
            ForkError::ParentKilled => f.write_str("parent killed"),
            ForkError::Map(err) => write!(f, "page table update failed: {:?}", err),
            ForkError::OutOfFrames => f.write_str("out of physical frames"),
            ForkError::SwapExhausted => f.write_str("swap area exhausted"),
            ForkError::Io(err) => write!(f, "swap i/o: {}", err),
            ForkError::Group(err) => write!(f, "cow group: {}", err),
        }
    }
}
