// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program image metadata consumed by segment faults
//! OWNERS: @kernel-team
//! PUBLIC API: ExecImage (segments, read_at), Segment, ElfImage::parse
//! DEPENDS_ON: bitflags
//! INVARIANTS: Only PT_LOAD headers become segments; a segment fault validates every header it scans

extern crate alloc;

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::mm::{page_round_up, PageFlags, PAGE_SIZE};

const PT_LOAD: u32 = 1;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

bitflags! {
    /// ELF `p_flags` permission bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

/// Errors surfaced while reading a program image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageError {
    /// Input was shorter than required for the ELF header or program headers.
    Truncated,
    /// ELF magic was not present.
    InvalidElf,
    /// ELF class was not 64-bit.
    WrongClass,
    /// ELF encoding was not little-endian.
    WrongEndian,
    /// Program header table fields were out of range.
    BadPhTable,
    /// Requested byte range lies outside the image.
    ReadOutOfRange,
}

/// Reasons a segment cannot be loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentError {
    /// Memory size is smaller than file size.
    SizeMismatch,
    /// Virtual start is not page aligned.
    Misaligned,
    /// Virtual range or file range wraps around the address space.
    Wraparound,
}

/// One loadable segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: usize,
    pub offset: usize,
    pub file_size: usize,
    pub mem_size: usize,
    pub flags: SegmentFlags,
}

impl Segment {
    pub fn validate(&self) -> Result<(), SegmentError> {
        if self.mem_size < self.file_size {
            return Err(SegmentError::SizeMismatch);
        }
        if self.vaddr % PAGE_SIZE != 0 {
            return Err(SegmentError::Misaligned);
        }
        let end = self.vaddr.checked_add(self.mem_size).and_then(page_round_up);
        if end.is_none() || self.offset.checked_add(self.file_size).is_none() {
            return Err(SegmentError::Wraparound);
        }
        Ok(())
    }

    /// End of the virtual range, saturating on wraparound.
    pub fn end(&self) -> usize {
        self.vaddr.saturating_add(self.mem_size)
    }

    pub fn contains(&self, va: usize) -> bool {
        va >= self.vaddr && va < self.end()
    }

    /// Leaf flags for the segment's pages.
    pub fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::VALID | PageFlags::USER | PageFlags::READ;
        if self.flags.contains(SegmentFlags::WRITE) {
            flags |= PageFlags::WRITE;
        }
        if self.flags.contains(SegmentFlags::EXECUTE) {
            flags |= PageFlags::EXECUTE;
        }
        flags
    }
}

/// Executable metadata and contents.
pub trait ExecImage {
    /// Loadable segments in program-header order.
    fn segments(&self) -> &[Segment];

    /// Fills `dest` with the bytes at `offset`.
    fn read_at(&self, offset: usize, dest: &mut [u8]) -> Result<(), ImageError>;

    /// First page above every well-formed segment; the heap starts here.
    ///
    /// Malformed segments are skipped. A fault on one kills the process.
    fn image_end(&self) -> usize {
        self.segments()
            .iter()
            .filter(|segment| segment.validate().is_ok())
            .filter_map(|segment| page_round_up(segment.end()))
            .max()
            .unwrap_or(0)
    }
}

/// In-memory ELF64 little-endian image.
#[derive(Clone, Debug)]
pub struct ElfImage {
    bytes: Vec<u8>,
    entry: u64,
    segments: Vec<Segment>,
}

impl ElfImage {
    pub fn parse(bytes: Vec<u8>) -> Result<Self, ImageError> {
        if bytes.len() < EHDR_SIZE {
            return Err(ImageError::Truncated);
        }
        if &bytes[0..4] != b"\x7FELF" {
            return Err(ImageError::InvalidElf);
        }
        if bytes[4] != 2 {
            return Err(ImageError::WrongClass);
        }
        if bytes[5] != 1 {
            return Err(ImageError::WrongEndian);
        }
        let entry = le_u64(&bytes[24..32]);
        let phoff = usize::try_from(le_u64(&bytes[32..40])).map_err(|_| ImageError::BadPhTable)?;
        let phentsize = le_u16(&bytes[54..56]) as usize;
        let phnum = le_u16(&bytes[56..58]) as usize;
        if phnum > 0 && (phentsize < PHDR_SIZE || phoff >= bytes.len()) {
            return Err(ImageError::BadPhTable);
        }

        let mut segments = Vec::new();
        for index in 0..phnum {
            let off = index
                .checked_mul(phentsize)
                .and_then(|rel| rel.checked_add(phoff))
                .ok_or(ImageError::BadPhTable)?;
            let header = bytes.get(off..off + PHDR_SIZE).ok_or(ImageError::Truncated)?;
            if le_u32(&header[0..4]) != PT_LOAD {
                continue;
            }
            segments.push(Segment {
                flags: SegmentFlags::from_bits_truncate(le_u32(&header[4..8])),
                offset: le_u64(&header[8..16]) as usize,
                vaddr: le_u64(&header[16..24]) as usize,
                file_size: le_u64(&header[32..40]) as usize,
                mem_size: le_u64(&header[40..48]) as usize,
            });
        }
        Ok(Self { bytes, entry, segments })
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }
}

impl ExecImage for ElfImage {
    fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn read_at(&self, offset: usize, dest: &mut [u8]) -> Result<(), ImageError> {
        let end = offset.checked_add(dest.len()).ok_or(ImageError::ReadOutOfRange)?;
        let src = self.bytes.get(offset..end).ok_or(ImageError::ReadOutOfRange)?;
        dest.copy_from_slice(src);
        Ok(())
    }
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn elf_with(headers: &[(u32, u32, u64, u64, u64, u64)], body: &[u8]) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let mut out = vec![0u8; phoff + headers.len() * PHDR_SIZE];
        out[0..4].copy_from_slice(b"\x7FELF");
        out[4] = 2;
        out[5] = 1;
        out[24..32].copy_from_slice(&0x1000u64.to_le_bytes());
        out[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
        out[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out[56..58].copy_from_slice(&(headers.len() as u16).to_le_bytes());
        for (i, (kind, flags, offset, vaddr, filesz, memsz)) in headers.iter().enumerate() {
            let h = phoff + i * PHDR_SIZE;
            out[h..h + 4].copy_from_slice(&kind.to_le_bytes());
            out[h + 4..h + 8].copy_from_slice(&flags.to_le_bytes());
            out[h + 8..h + 16].copy_from_slice(&offset.to_le_bytes());
            out[h + 16..h + 24].copy_from_slice(&vaddr.to_le_bytes());
            out[h + 32..h + 40].copy_from_slice(&filesz.to_le_bytes());
            out[h + 40..h + 48].copy_from_slice(&memsz.to_le_bytes());
        }
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn parse_keeps_only_load_headers() {
        let bytes = elf_with(&[(1, 5, 0, 0, 16, 16), (4, 4, 0, 0x9000, 0, 0), (1, 6, 0, 0x2000, 8, 0x1800)], &[]);
        let image = ElfImage::parse(bytes).expect("parse");
        assert_eq!(image.entry(), 0x1000);
        assert_eq!(image.segments().len(), 2);
        assert_eq!(image.segments()[1].vaddr, 0x2000);
        assert_eq!(image.image_end(), 0x4000);
        let text = image.segments()[0].page_flags();
        assert!(text.contains(PageFlags::EXECUTE));
        assert!(!text.contains(PageFlags::WRITE));
    }

    #[test]
    fn parse_rejects_bad_headers() {
        assert_eq!(ElfImage::parse(vec![0; 10]).map(|_| ()), Err(ImageError::Truncated));
        let mut bytes = elf_with(&[], &[]);
        bytes[0] = 0;
        assert_eq!(ElfImage::parse(bytes).map(|_| ()), Err(ImageError::InvalidElf));
        let mut bytes = elf_with(&[], &[]);
        bytes[4] = 1;
        assert_eq!(ElfImage::parse(bytes).map(|_| ()), Err(ImageError::WrongClass));
        let mut bytes = elf_with(&[(1, 4, 0, 0, 0, 0)], &[]);
        bytes.truncate(EHDR_SIZE + 20);
        assert_eq!(ElfImage::parse(bytes).map(|_| ()), Err(ImageError::Truncated));
    }

    #[test]
    fn segment_validation() {
        let ok = Segment { vaddr: 0x1000, offset: 0, file_size: 8, mem_size: 16, flags: SegmentFlags::READ };
        assert_eq!(ok.validate(), Ok(()));
        assert_eq!(Segment { mem_size: 4, ..ok }.validate(), Err(SegmentError::SizeMismatch));
        assert_eq!(Segment { vaddr: 0x1010, ..ok }.validate(), Err(SegmentError::Misaligned));
        assert_eq!(
            Segment { vaddr: usize::MAX & !(PAGE_SIZE - 1), ..ok }.validate(),
            Err(SegmentError::Wraparound)
        );
    }

    struct Headers(Vec<Segment>);

    impl ExecImage for Headers {
        fn segments(&self) -> &[Segment] {
            &self.0
        }

        fn read_at(&self, _offset: usize, _dest: &mut [u8]) -> Result<(), ImageError> {
            Err(ImageError::ReadOutOfRange)
        }
    }

    #[test]
    fn image_end_ignores_segments_that_cannot_load() {
        let text = Segment { vaddr: 0x1000, offset: 0, file_size: 8, mem_size: 0x1800, flags: SegmentFlags::READ };
        let top = Segment { vaddr: usize::MAX & !(PAGE_SIZE - 1), mem_size: 16, ..text };
        let bss = Segment { vaddr: 0x8010, ..text };
        assert_eq!(Headers(vec![text, top, bss]).image_end(), 0x3000);
        assert_eq!(Headers(vec![top]).image_end(), 0);
    }

    #[test]
    fn read_at_is_bounds_checked() {
        let image = ElfImage::parse(elf_with(&[], b"hello")).expect("parse");
        let mut buf = [0u8; 5];
        image.read_at(EHDR_SIZE, &mut buf).expect("read");
        assert_eq!(&buf, b"hello");
        assert_eq!(image.read_at(EHDR_SIZE + 1, &mut buf), Err(ImageError::ReadOutOfRange));
    }
}
