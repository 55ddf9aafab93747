// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program-segment demand loading and fatal fault paths
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! TEST_SCOPE:
//!   - Segment pages are loaded from the right file offset and zero-padded
//!   - Permissions follow the segment flags; writes to text are fatal
//!   - Malformed or missing segments kill the process and release its memory,
//!     including malformed headers ahead of the one covering the fault

mod common;

use std::sync::Arc;

use common::{config, image, load, pager, store, Load, SoftPageTable};
use neuron_vm::image::{ElfImage, ImageError, SegmentError};
use neuron_vm::mm::{PageFlags, PageMapper, PAGE_SIZE};
use neuron_vm::process::ImageRef;
use neuron_vm::{FaultCause, FaultError, FaultInfo, FaultKind, Pid};

const R: u32 = 4;
const W: u32 = 2;
const X: u32 = 1;

fn text_bytes() -> Vec<u8> {
    (0..PAGE_SIZE + 0x800).map(|i| (i % 199) as u8).collect()
}

#[test]
fn instruction_fault_loads_whole_segment() {
    let pager = pager(config(4), 16);
    let text = text_bytes();
    let loads = [
        Load { vaddr: 0x1000, flags: R | X, data: &text, mem_size: 2 * PAGE_SIZE as u64 },
        Load { vaddr: 0x4000, flags: R | W, data: b"data", mem_size: 0x10 },
    ];
    let proc_a = pager.create_process(Pid(1), "init", SoftPageTable::new(), Some(image(&loads)));

    let kind = pager.handle_fault(&proc_a, FaultInfo::new(FaultCause::Instruction, 0x1004));
    assert_eq!(kind, Ok(FaultKind::Segment { loaded: 2 }));
    {
        let vm = proc_a.lock();
        let leaf = vm.page_table().translate(0x2000).expect("second page loaded too");
        assert!(leaf.flags.contains(PageFlags::EXECUTE));
        assert!(!leaf.flags.contains(PageFlags::WRITE));
        assert!(vm.page_table().translate(0x4000).is_none());
    }
    let (_, first) = load(&pager, &proc_a, 0x1000, PAGE_SIZE).expect("first page");
    assert_eq!(first, text[..PAGE_SIZE]);
    let (_, second) = load(&pager, &proc_a, 0x2000, PAGE_SIZE).expect("second page");
    assert_eq!(second[..0x800], text[PAGE_SIZE..]);
    assert!(second[0x800..].iter().all(|&b| b == 0));

    assert_eq!(
        pager.handle_fault(&proc_a, FaultInfo::new(FaultCause::Load, 0x2010)),
        Ok(FaultKind::Spurious)
    );
    assert_eq!(store(&pager, &proc_a, 0x4004, b"!"), Ok(Some(FaultKind::Segment { loaded: 1 })));
    let (_, data) = load(&pager, &proc_a, 0x4000, 5).expect("data");
    assert_eq!(data, b"data!");
}

#[test]
fn heap_begins_after_the_image() {
    let pager = pager(config(4), 16);
    let loads = [Load { vaddr: 0x1000, flags: R, data: b"x", mem_size: 0x1800 }];
    let proc_a = pager.create_process(Pid(1), "a", SoftPageTable::new(), Some(image(&loads)));
    let heap = pager.grow_heap(&proc_a, 1).expect("grow");
    assert_eq!(heap, 0x3000..0x4000);
    assert_eq!(store(&pager, &proc_a, heap.start, &[1]), Ok(Some(FaultKind::HeapZeroFill)));
}

#[test]
fn store_to_text_is_a_protection_violation() {
    let pager = pager(config(4), 16);
    let loads = [Load { vaddr: 0x1000, flags: R | X, data: b"code", mem_size: 4 }];
    let proc_a = pager.create_process(Pid(1), "a", SoftPageTable::new(), Some(image(&loads)));
    load(&pager, &proc_a, 0x1000, 4).expect("load text");

    let err = store(&pager, &proc_a, 0x1000, &[0]).expect_err("text is read-only");
    assert_eq!(err, FaultError::ProtectionViolation { va: 0x1000 });
    assert!(proc_a.lock().is_killed());
    assert!(proc_a.lock().page_table().is_empty());
    assert_eq!(pager.frames().lock().live(), 0);
}

#[test]
fn text_stays_read_only_after_fork() {
    let pager = pager(config(4), 16);
    let loads = [Load { vaddr: 0x1000, flags: R | X, data: b"code", mem_size: 4 }];
    let proc_a = pager.create_process(Pid(1), "a", SoftPageTable::new(), Some(image(&loads)));
    load(&pager, &proc_a, 0x1000, 4).expect("load text");
    let proc_b = pager.fork(&proc_a, Pid(2), SoftPageTable::new()).expect("fork");

    let (_, code) = load(&pager, &proc_b, 0x1000, 4).expect("child reads shared text");
    assert_eq!(code, b"code");
    assert_eq!(
        store(&pager, &proc_b, 0x1000, &[0]),
        Err(FaultError::ProtectionViolation { va: 0x1000 })
    );
    let (_, code) = load(&pager, &proc_a, 0x1000, 4).expect("parent unaffected");
    assert_eq!(code, b"code");
}

#[test]
fn malformed_segments_are_fatal() {
    let cases = [
        (Load { vaddr: 0x1010, flags: R, data: b"abc", mem_size: 8 }, SegmentError::Misaligned),
        (Load { vaddr: 0x1000, flags: R, data: b"abcdefgh", mem_size: 4 }, SegmentError::SizeMismatch),
        (
            Load {
                vaddr: (usize::MAX - PAGE_SIZE + 1) as u64,
                flags: R,
                data: b"",
                mem_size: 2 * PAGE_SIZE as u64,
            },
            SegmentError::Wraparound,
        ),
    ];
    for (segment, expected) in cases {
        let pager = pager(config(4), 16);
        let fault_at = segment.vaddr as usize;
        let proc_a = pager.create_process(Pid(1), "a", SoftPageTable::new(), Some(image(&[segment])));
        let err = pager.handle_fault(&proc_a, FaultInfo::new(FaultCause::Load, fault_at));
        assert_eq!(err, Err(FaultError::MalformedSegment(expected)));
        assert!(proc_a.lock().is_killed());
        assert_eq!(pager.frames().lock().live(), 0);
    }
}

#[test]
fn malformed_header_ahead_of_the_match_is_fatal() {
    let pager = pager(config(4), 16);
    let loads = [
        Load { vaddr: 0x1000, flags: R, data: b"abcdefgh", mem_size: 4 },
        Load { vaddr: 0x4000, flags: R | W, data: b"data", mem_size: 0x10 },
    ];
    let proc_a = pager.create_process(Pid(1), "a", SoftPageTable::new(), Some(image(&loads)));
    assert_eq!(
        pager.handle_fault(&proc_a, FaultInfo::new(FaultCause::Load, 0x4000)),
        Err(FaultError::MalformedSegment(SegmentError::SizeMismatch))
    );
    assert!(proc_a.lock().is_killed());
    assert_eq!(pager.frames().lock().live(), 0);
}

#[test]
fn address_outside_every_segment_is_fatal() {
    let pager = pager(config(4), 16);
    let loads = [Load { vaddr: 0x1000, flags: R, data: b"x", mem_size: 1 }];
    let proc_a = pager.create_process(Pid(1), "a", SoftPageTable::new(), Some(image(&loads)));
    assert_eq!(
        pager.handle_fault(&proc_a, FaultInfo::new(FaultCause::Load, 0x9_0000)),
        Err(FaultError::SegmentNotFound { va: 0x9_0000 })
    );
    assert_eq!(
        pager.handle_fault(&proc_a, FaultInfo::new(FaultCause::Load, 0x1000)),
        Err(FaultError::Killed)
    );
}

#[test]
fn segment_reading_past_the_file_is_fatal() {
    let pager = pager(config(4), 16);
    let mut bytes = common::elf(&[Load { vaddr: 0x1000, flags: R, data: b"abcd", mem_size: 4 }]);
    bytes.truncate(bytes.len() - 2);
    let parsed: ImageRef = Arc::new(ElfImage::parse(bytes).expect("headers intact"));
    let proc_a = pager.create_process(Pid(1), "a", SoftPageTable::new(), Some(parsed));
    assert_eq!(
        pager.handle_fault(&proc_a, FaultInfo::new(FaultCause::Load, 0x1000)),
        Err(FaultError::Image(ImageError::ReadOutOfRange))
    );
    assert_eq!(pager.frames().lock().live(), 0);
}
