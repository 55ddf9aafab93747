// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual-memory fault path for the neuron kernel
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: Pager (handle_fault, fork, grow_heap, release), Process, CowRegistry, SwapArea
//! DEPENDS_ON: mm::PageMapper, mm::FrameAllocator, hal::{BlockDevice, Timer, Tlb}, image::ExecImage
//! INVARIANTS: COW classification precedes heap and segment classification;
//!             registry and swap locks are never held across page copies or disk I/O;
//!             one fault in flight per process (per-process fault lock)

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod config;
pub mod cow;
pub mod error;
pub mod hal;
pub mod heap;
pub mod image;
pub mod mm;
pub mod pager;
pub mod process;
pub mod swap;

pub use config::{ConfigError, PagerConfig, SwapConfig};
pub use cow::{CowRegistry, GroupId};
pub use error::{FaultError, ForkError};
pub use pager::{FaultCause, FaultInfo, FaultKind, Pager};
pub use process::{Pid, Process, ProcessVm};
pub use swap::{SwapArea, SwapSlot};
