//! Output layout management.
//!
//! Output sections carry the bytes destined for the final image together
//! with a fixed ordering priority. Once every section's size is known,
//! `assign_addresses` walks the sections in priority order handing out file
//! offsets and virtual addresses, then `build_segments` groups contiguous
//! runs of sections that share load permissions. Segments are computed once,
//! after the last address is fixed, and never change afterwards.

use object::elf;
use object::read::SectionIndex;

use crate::utils::align_up;

/// Layout priority of an output section, lowest first. Target-specific
/// sections ask the architecture backend for a priority and default to
/// `Undefined`, which sorts last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SectionOrder {
    Interp = 1,
    RoNote,
    /// .hash, .dynsym, .dynstr
    NamePool,
    Relocation,
    /// .rela.plt comes after the other relocation sections
    RelPlt,
    Init,
    Plt,
    Text,
    Fini,
    ReadOnly,
    /// .eh_frame_hdr, .eh_frame, .gcc_except_table
    Exception,
    TlsData,
    TlsBss,
    Relro,
    /// .got sits at the end of the relro region
    RelroLast,
    /// .got.plt is written lazily and leads the writable region
    NonRelroFirst,
    Data,
    Bss,
    Undefined = u8::MAX as isize,
}

/// An input section placed inside an output section.
#[derive(Debug, Clone, Copy)]
pub struct InputRef {
    pub file: usize,
    pub section: SectionIndex,
    /// Offset of the input section's bytes within the output section.
    pub offset: u64,
}

/// An ordered byte-producing unit of the output image.
pub struct OutputSection {
    pub name: String,
    pub order: SectionOrder,
    /// SHF_* flags; the permission bits decide segment grouping.
    pub flags: u64,
    /// Occupies address space but no file bytes (.bss and friends).
    pub is_bss: bool,
    pub align: u64,
    pub data: Vec<u8>,
    /// Size in memory. Equal to `data.len()` except for bss sections.
    pub size: u64,
    pub addr: u64,
    pub offset: u64,
    pub inputs: Vec<InputRef>,
}

impl OutputSection {
    pub fn new(name: &str, order: SectionOrder, flags: u64) -> Self {
        Self {
            name: name.to_string(),
            order,
            flags,
            is_bss: false,
            align: 8,
            data: Vec::new(),
            size: 0,
            addr: 0,
            offset: 0,
            inputs: Vec::new(),
        }
    }

    pub fn bss(name: &str, order: SectionOrder, flags: u64) -> Self {
        let mut section = Self::new(name, order, flags);
        section.is_bss = true;
        section
    }

    pub fn is_alloc(&self) -> bool {
        self.flags & u64::from(elf::SHF_ALLOC) != 0
    }

    /// Append `bytes` aligned to `align`, returning the offset they landed at.
    pub fn append(&mut self, bytes: &[u8], align: u64) -> u64 {
        let offset = align_up(self.size, align.max(1));
        debug_assert!(!self.is_bss);
        self.data.resize(offset as usize, 0);
        self.data.extend_from_slice(bytes);
        self.size = self.data.len() as u64;
        self.align = self.align.max(align);
        offset
    }

    /// Reserve `size` zero bytes (address space only for bss sections).
    pub fn reserve(&mut self, size: u64, align: u64) -> u64 {
        let offset = align_up(self.size, align.max(1));
        self.size = offset + size;
        if !self.is_bss {
            self.data.resize(self.size as usize, 0);
        }
        self.align = self.align.max(align);
        offset
    }
}

/// Contiguous group of output sections sharing load permissions, mapped as
/// one unit at load time.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    /// PF_R / PF_W / PF_X.
    pub flags: u32,
    pub addr: u64,
    pub offset: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub align: u64,
}

/// Permission flags of the segment a section belongs in.
pub fn segment_flags(section_flags: u64) -> u32 {
    let mut flags = elf::PF_R;
    if section_flags & u64::from(elf::SHF_WRITE) != 0 {
        flags |= elf::PF_W;
    }
    if section_flags & u64::from(elf::SHF_EXECINSTR) != 0 {
        flags |= elf::PF_X;
    }
    flags
}

pub struct Layout {
    pub sections: Vec<OutputSection>,
    pub segments: Vec<Segment>,
    /// Section indices sorted by layout priority. Section indices themselves
    /// stay stable so ids captured before layout remain valid.
    order: Vec<usize>,
    pub base_addr: u64,
    pub page_size: u64,
}

impl Layout {
    pub fn new(base_addr: u64, page_size: u64) -> Self {
        Self {
            sections: Vec::new(),
            segments: Vec::new(),
            order: Vec::new(),
            base_addr,
            page_size,
        }
    }

    pub fn push(&mut self, section: OutputSection) -> usize {
        self.sections.push(section);
        self.sections.len() - 1
    }

    pub fn section(&self, index: usize) -> &OutputSection {
        &self.sections[index]
    }

    pub fn section_mut(&mut self, index: usize) -> &mut OutputSection {
        &mut self.sections[index]
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    /// Compute the final section order. Stable with respect to creation
    /// order for sections of equal priority.
    pub fn sort_sections(&mut self) {
        self.order = (0..self.sections.len()).collect();
        self.order.sort_by_key(|&i| self.sections[i].order);
    }

    /// Section indices in layout order.
    pub fn ordered(&self) -> &[usize] {
        &self.order
    }

    /// Sections that receive a section header in the output, in layout
    /// order. Empty sections are dropped from the file.
    pub fn emitted(&self) -> impl Iterator<Item = usize> + '_ {
        self.order
            .iter()
            .copied()
            .filter(|&i| self.sections[i].size > 0)
    }

    /// The output section header index of `section`, valid once
    /// `sort_sections` has run. Header 0 is the null entry.
    pub fn header_index(&self, section: usize) -> Option<u16> {
        self.emitted()
            .position(|i| i == section)
            .map(|p| p as u16 + 1)
    }

    /// Hand out file offsets and virtual addresses in layout order. A new
    /// page is started whenever load permissions change so the later segment
    /// grouping can map each run with one program header.
    pub fn assign_addresses(&mut self) {
        let mut addr = self.base_addr + self.page_size;
        let mut offset = self.page_size;
        let mut current_flags = None;
        for i in 0..self.order.len() {
            let section = &mut self.sections[self.order[i]];
            if !section.is_alloc() || section.size == 0 {
                continue;
            }
            let flags = segment_flags(section.flags);
            if current_flags != Some(flags) {
                addr = align_up(addr, self.page_size);
                offset = align_up(offset, self.page_size);
                current_flags = Some(flags);
            }
            addr = align_up(addr, section.align.max(1));
            offset = align_up(offset, section.align.max(1));
            section.addr = addr;
            section.offset = offset;
            addr += section.size;
            if !section.is_bss {
                offset += section.size;
            }
        }
    }

    /// Group contiguous same-permission sections. Only valid after
    /// `assign_addresses`; the result is immutable from then on.
    pub fn build_segments(&mut self) {
        self.segments.clear();
        for &index in &self.order {
            let section = &self.sections[index];
            if !section.is_alloc() || section.size == 0 {
                continue;
            }
            let flags = segment_flags(section.flags);
            let file_size = if section.is_bss { 0 } else { section.size };
            match self.segments.last_mut() {
                Some(segment) if segment.flags == flags => {
                    segment.mem_size = section.addr + section.size - segment.addr;
                    if !section.is_bss {
                        segment.file_size = section.offset + section.size - segment.offset;
                    }
                }
                _ => {
                    self.segments.push(Segment {
                        flags,
                        addr: section.addr,
                        offset: section.offset,
                        file_size,
                        mem_size: section.size,
                        align: self.page_size,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(name: &str, order: SectionOrder, flags: u64, size: u64) -> OutputSection {
        let mut s = OutputSection::new(name, order, flags);
        s.reserve(size, 16);
        s
    }

    const AX: u64 = (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u64;
    const A: u64 = elf::SHF_ALLOC as u64;
    const AW: u64 = (elf::SHF_ALLOC | elf::SHF_WRITE) as u64;

    #[test]
    fn orders_follow_the_priority_ladder() {
        assert!(SectionOrder::Interp < SectionOrder::NamePool);
        assert!(SectionOrder::Relocation < SectionOrder::RelPlt);
        assert!(SectionOrder::Plt < SectionOrder::Text);
        assert!(SectionOrder::Text < SectionOrder::ReadOnly);
        assert!(SectionOrder::RelroLast < SectionOrder::Data);
        assert!(SectionOrder::Bss < SectionOrder::Undefined);
    }

    #[test]
    fn sorts_sections_and_groups_segments_by_permission() {
        let mut layout = Layout::new(0x400000, 0x1000);
        layout.push(section(".data", SectionOrder::Data, AW, 32));
        layout.push(section(".text", SectionOrder::Text, AX, 100));
        layout.push(section(".rodata", SectionOrder::ReadOnly, A, 64));
        let mut bss = OutputSection::bss(".bss", SectionOrder::Bss, AW);
        bss.reserve(128, 16);
        layout.push(bss);

        layout.sort_sections();
        layout.assign_addresses();
        layout.build_segments();

        let names: Vec<&str> = layout
            .ordered()
            .iter()
            .map(|&i| layout.sections[i].name.as_str())
            .collect();
        assert_eq!(names, [".text", ".rodata", ".data", ".bss"]);

        // text | rodata | data+bss
        assert_eq!(layout.segments.len(), 3);
        assert_eq!(layout.segments[0].flags, elf::PF_R | elf::PF_X);
        assert_eq!(layout.segments[1].flags, elf::PF_R);
        assert_eq!(layout.segments[2].flags, elf::PF_R | elf::PF_W);

        // The writable segment covers .data in the file and .bss in memory.
        let data = &layout.sections[layout.find(".data").unwrap()];
        let bss = &layout.sections[layout.find(".bss").unwrap()];
        assert_eq!(layout.segments[2].file_size, data.size);
        assert_eq!(layout.segments[2].mem_size, bss.addr + bss.size - data.addr);

        // Permission changes land on fresh pages.
        for segment in &layout.segments {
            assert_eq!(segment.addr % 0x1000, 0);
            assert_eq!(segment.offset % 0x1000, 0);
        }
    }

    #[test]
    fn append_respects_alignment() {
        let mut s = OutputSection::new(".rodata", SectionOrder::ReadOnly, A);
        s.append(&[1, 2, 3], 4);
        let offset = s.append(&[4, 5], 8);
        assert_eq!(offset, 8);
        assert_eq!(s.size, 10);
        assert_eq!(&s.data[8..10], &[4, 5]);
    }
}
