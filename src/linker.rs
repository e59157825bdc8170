//! Core Linker logic.
//!
//! This module contains the `Linker` struct which orchestrates the entire
//! linking process as one linear pass:
//! 1. Input Loading: reads object files (and archives, and shared objects)
//!    and feeds every symbol through the resolver.
//! 2. Section Merge: maps input sections into output sections.
//! 3. Relocation Scan: walks every relocation in per-section order and
//!    reserves GOT/PLT/dynamic-relocation/copy entries.
//! 4. Layout: orders output sections, assigns addresses, groups segments.
//! 5. Emission: assigns symbol indices, renders name pools and reserved
//!    slots, applies relocations, and writes the final ELF.
//!
//! Every walk over symbols is in insertion order and every walk over
//! relocations is in per-section input order, so identical inputs produce
//! identical outputs.

use anyhow::{anyhow, bail, Context, Result};
use memmap2::Mmap;
use object::elf;
use object::read::{Object, ObjectSection, ObjectSymbol, RelocationTarget, SectionIndex};
use object::{ObjectKind, SectionKind, SymbolKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::arch::{Architecture, RelocClass};
use crate::config::OutputKind;
use crate::diagnostics::Diagnostics;
use crate::emit;
use crate::intern::SymbolId;
use crate::layout::{Layout, OutputSection, SectionOrder};
use crate::reloc::{FragmentRef, RelocHandle, RelocTarget, RelocationFactory};
use crate::resolver::{SymbolPool, WarningPolicy};
use crate::scanner::{ScanTables, Scanner};
use crate::symbol::{
    Binding, Desc, Source, SymType, SymbolInput, SymbolValue, Visibility,
};
use crate::tables::DynRelocPlace;
use crate::writer;

const EXEC_BASE_ADDR: u64 = 0x400000;

pub struct Linker<'a> {
    arch: Box<dyn Architecture>,
    output_kind: OutputKind,
    pic: bool,
    entry: String,

    objects: Vec<object::File<'a>>,
    paths: Vec<String>,

    pool: SymbolPool,
    diag: Diagnostics,
    factory: RelocationFactory,
    relocs: Vec<RelocHandle>,
    tables: ScanTables,

    layout: Layout,
    /// Input (file, section) to (output section, offset within it).
    section_map: HashMap<(usize, SectionIndex), (usize, u64)>,
    /// Dynamic symbols in dynsym order, fixed after scanning.
    dynsym_order: Vec<SymbolId>,

    bss_section: usize,
    copy_section: usize,
    got_section: usize,
    plt_section: usize,
    rela_section: usize,
    dynsym_section: Option<usize>,
    dynstr_section: Option<usize>,
    hash_section: Option<usize>,
}

impl<'a> Linker<'a> {
    pub fn new(
        arch: Box<dyn Architecture>,
        output_kind: OutputKind,
        pic: bool,
        entry: String,
        warning_policy: WarningPolicy,
    ) -> Self {
        let base = if output_kind == OutputKind::Executable && !pic {
            EXEC_BASE_ADDR
        } else {
            0
        };
        let page = arch.abi_page_size();
        let bitclass = arch.bitclass();
        let endian = arch.endianness();
        let mut layout = Layout::new(base, page);

        const AW: u64 = (elf::SHF_ALLOC | elf::SHF_WRITE) as u64;
        const AX: u64 = (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u64;
        const A: u64 = elf::SHF_ALLOC as u64;

        // Target-owned sections exist up front so the scanner can hand out
        // stable section indices; their sizes are settled after scanning.
        let got_order = arch.target_section_order(".got");
        let bss_section = layout.push(OutputSection::bss(".bss", SectionOrder::Bss, AW));
        let copy_section = layout.push(OutputSection::bss(".dynbss", SectionOrder::Bss, AW));
        let got_section = layout.push(OutputSection::new(".got", got_order, AW));
        let plt_section = layout.push(OutputSection::new(".plt", SectionOrder::Plt, AX));
        let rela_section = layout.push(OutputSection::new(
            ".rela.dyn",
            SectionOrder::Relocation,
            A,
        ));

        Self {
            arch,
            output_kind,
            pic,
            entry,
            objects: Vec::new(),
            paths: Vec::new(),
            pool: SymbolPool::new(warning_policy),
            diag: Diagnostics::new(),
            factory: RelocationFactory::new(bitclass, endian),
            relocs: Vec::new(),
            tables: ScanTables::default(),
            layout,
            section_map: HashMap::new(),
            dynsym_order: Vec::new(),
            bss_section,
            copy_section,
            got_section,
            plt_section,
            rela_section,
            dynsym_section: None,
            dynstr_section: None,
            hash_section: None,
        }
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diag
    }

    /// Look a symbol up by name and return its output symbol-table index,
    /// once emission has assigned one.
    pub fn find_symbol(&self, name: &[u8]) -> Option<usize> {
        self.pool.find_output_symbol(name)
    }

    /// Parse `mmap` as an object file or archive and feed its symbols
    /// through the resolver.
    pub fn add_file(&mut self, path: PathBuf, mmap: &'a Mmap) -> Result<()> {
        let magic = &mmap[..8.min(mmap.len())];
        if magic.starts_with(b"!<arch>\n") {
            let archive = object::read::archive::ArchiveFile::parse(&**mmap)?;
            for member in archive.members() {
                let member = member?;
                let name = String::from_utf8_lossy(member.name()).to_string();
                let data = member.data(&**mmap)?;
                let obj = if data.as_ptr().align_offset(8) != 0 {
                    // The parser needs aligned input; copy misaligned members.
                    let vec = data.to_vec();
                    let leaked: &'a [u8] = Box::leak(vec.into_boxed_slice());
                    object::File::parse(leaked).context("failed to parse archive member")?
                } else {
                    object::File::parse(data).context("failed to parse archive member")?
                };
                let member_path = format!("{}({})", path.display(), name);
                self.process_object(member_path, obj)?;
            }
        } else {
            let obj = object::File::parse(&**mmap).context("failed to parse object file")?;
            self.process_object(path.display().to_string(), obj)?;
        }
        Ok(())
    }

    fn process_object(&mut self, path: String, obj: object::File<'a>) -> Result<()> {
        let file_index = self.objects.len();
        let source = if obj.kind() == ObjectKind::Dynamic {
            Source::Dynamic
        } else {
            Source::Regular
        };
        tracing::debug!(path, ?source, "loading input");

        for sym in obj.symbols() {
            let name = sym.name_bytes()?;
            if name.is_empty() || sym.is_local() {
                continue;
            }
            let kind = sym.kind();
            if kind == SymbolKind::Section || kind == SymbolKind::File {
                continue;
            }
            let input = symbol_input(file_index, source, name, &sym)?;
            self.pool
                .insert_symbol(&input, &mut self.diag)
                .with_context(|| format!("while resolving symbols of {path}"))?;
        }
        self.objects.push(obj);
        self.paths.push(path);
        Ok(())
    }

    /// Map every loadable input section into an output section, copying its
    /// bytes. Shared objects contribute symbols only.
    pub fn merge_sections(&mut self) -> Result<()> {
        for file_index in 0..self.objects.len() {
            if self.objects[file_index].kind() == ObjectKind::Dynamic {
                continue;
            }
            let sections: Vec<(SectionIndex, SectionKind, u64, u64, Vec<u8>, String)> = {
                let obj = &self.objects[file_index];
                let mut out = Vec::new();
                for section in obj.sections() {
                    let size = section.size();
                    if size == 0 {
                        continue;
                    }
                    let data = if section.kind() == SectionKind::UninitializedData {
                        Vec::new()
                    } else {
                        section.data()?.to_vec()
                    };
                    out.push((
                        section.index(),
                        section.kind(),
                        size,
                        section.align(),
                        data,
                        section.name().unwrap_or("?").to_string(),
                    ));
                }
                out
            };
            for (index, kind, size, align, data, name) in sections {
                let Some(output) = self.output_section_for(kind, &name) else {
                    tracing::debug!("skipping section {name} (kind: {kind:?}, size: {size})");
                    continue;
                };
                let section = self.layout.section_mut(output);
                let offset = if section.is_bss {
                    section.reserve(size, align.max(1))
                } else {
                    section.append(&data, align.max(1))
                };
                section.inputs.push(crate::layout::InputRef {
                    file: file_index,
                    section: index,
                    offset,
                });
                self.section_map
                    .insert((file_index, index), (output, offset));
            }
        }
        Ok(())
    }

    fn output_section_for(&mut self, kind: SectionKind, name: &str) -> Option<usize> {
        const AW: u64 = (elf::SHF_ALLOC | elf::SHF_WRITE) as u64;
        const AX: u64 = (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u64;
        const A: u64 = elf::SHF_ALLOC as u64;
        let (name, order, flags, is_bss) = match kind {
            SectionKind::Text => (".text", SectionOrder::Text, AX, false),
            SectionKind::ReadOnlyData | SectionKind::ReadOnlyString => {
                (".rodata", SectionOrder::ReadOnly, A, false)
            }
            SectionKind::Data => (".data", SectionOrder::Data, AW, false),
            SectionKind::UninitializedData => return Some(self.bss_section),
            SectionKind::Tls => (
                ".tdata",
                SectionOrder::TlsData,
                AW | u64::from(elf::SHF_TLS),
                false,
            ),
            SectionKind::Elf(elf::SHT_INIT_ARRAY) => {
                (".init_array", SectionOrder::Relro, AW, false)
            }
            SectionKind::Elf(elf::SHT_FINI_ARRAY) => {
                (".fini_array", SectionOrder::Relro, AW, false)
            }
            _ => {
                // Unknown target-specific kinds ask the backend.
                let order = self.arch.target_section_order(name);
                if order == SectionOrder::Undefined {
                    return None;
                }
                return Some(self.get_or_create(name, order, A, false));
            }
        };
        Some(self.get_or_create(name, order, flags, is_bss))
    }

    fn get_or_create(&mut self, name: &str, order: SectionOrder, flags: u64, is_bss: bool) -> usize {
        if let Some(index) = self.layout.find(name) {
            return index;
        }
        let section = if is_bss {
            OutputSection::bss(name, order, flags)
        } else {
            OutputSection::new(name, order, flags)
        };
        self.layout.push(section)
    }

    /// Walk every relocation of every merged section, in per-section order,
    /// recording the relocation and reserving output entries through the
    /// scanner.
    pub fn scan_relocations(&mut self) -> Result<()> {
        let scanner = Scanner::new(
            self.arch.as_ref(),
            self.output_kind,
            self.pic,
            self.copy_section,
        );
        for file_index in 0..self.objects.len() {
            let obj = &self.objects[file_index];
            if obj.kind() == ObjectKind::Dynamic {
                continue;
            }
            for section in obj.sections() {
                if !self
                    .section_map
                    .contains_key(&(file_index, section.index()))
                {
                    continue;
                }
                let data = if section.kind() == SectionKind::UninitializedData {
                    &[][..]
                } else {
                    section.data()?
                };
                for (offset, reloc) in section.relocations() {
                    let object::RelocationFlags::Elf { r_type } = reloc.flags() else {
                        continue;
                    };
                    let target = match reloc.target() {
                        RelocationTarget::Symbol(index) => {
                            let sym = obj.symbol_by_index(index)?;
                            if sym.is_local() || sym.kind() == SymbolKind::Section {
                                RelocTarget::Local {
                                    file: file_index,
                                    symbol: index.0,
                                }
                            } else {
                                match self.pool.find(sym.name_bytes()?) {
                                    Some(id) => RelocTarget::Pool(id),
                                    None => RelocTarget::Local {
                                        file: file_index,
                                        symbol: index.0,
                                    },
                                }
                            }
                        }
                        RelocationTarget::Section(section) => RelocTarget::Section {
                            file: file_index,
                            section,
                        },
                        _ => continue,
                    };
                    let frag = FragmentRef {
                        file: file_index,
                        section: section.index(),
                        offset,
                    };
                    let handle =
                        self.factory
                            .produce(r_type, frag, reloc.addend(), target, data)?;
                    self.relocs.push(handle);
                    scanner.scan_relocation(
                        self.factory.get(handle),
                        &mut self.pool,
                        &mut self.tables,
                    )?;
                }
            }
        }
        tracing::info!(
            got = self.tables.got.len(),
            plt = self.tables.plt.len(),
            dynrel = self.tables.dynrel.len(),
            "relocation scan complete"
        );
        Ok(())
    }

    /// Fix the sizes of the scanner-fed sections, allocate commons, order
    /// sections, assign addresses and build segments.
    pub fn layout(&mut self) -> Result<()> {
        emit::allocate_commons(
            &mut self.pool,
            self.bss_section,
            self.layout.section_mut(self.bss_section),
        );

        let got_size = self.tables.got.size(self.arch.got_entry_size());
        let plt_size = self
            .tables
            .plt
            .size(self.arch.plt0_size(), self.arch.plt_entry_size());
        let rela_size = self.tables.dynrel.size();
        let copy_size = self.tables.copy.size();
        self.layout.section_mut(self.got_section).reserve(got_size, 8);
        self.layout.section_mut(self.plt_section).reserve(plt_size, 16);
        self.layout.section_mut(self.rela_section).reserve(rela_size, 8);
        self.layout.section_mut(self.copy_section).reserve(copy_size, 16);

        // Dynamic name pools, sized now and rendered once addresses exist.
        let shared = self.output_kind == OutputKind::SharedObject;
        self.dynsym_order = emit::dynamic_symbols(&self.pool, shared);
        if !self.dynsym_order.is_empty() && self.output_kind != OutputKind::Relocatable {
            const A: u64 = elf::SHF_ALLOC as u64;
            let dynsym_size = (self.dynsym_order.len() as u64 + 1) * 24;
            let dynstr_size: u64 = 1 + self
                .dynsym_order
                .iter()
                .map(|&id| self.pool.name(id).len() as u64 + 1)
                .sum::<u64>();
            let nbucket = emit::hash_bucket_count(self.dynsym_order.len()) as u64;
            let hash_size = (2 + nbucket + self.dynsym_order.len() as u64 + 1) * 4;

            let dynsym = self.get_or_create(".dynsym", SectionOrder::NamePool, A, false);
            let dynstr = self.get_or_create(".dynstr", SectionOrder::NamePool, A, false);
            let hash = self.get_or_create(".hash", SectionOrder::NamePool, A, false);
            self.layout.section_mut(dynsym).reserve(dynsym_size, 8);
            self.layout.section_mut(dynstr).reserve(dynstr_size, 1);
            self.layout.section_mut(hash).reserve(hash_size, 8);
            self.dynsym_section = Some(dynsym);
            self.dynstr_section = Some(dynstr);
            self.hash_section = Some(hash);
        }

        self.layout.sort_sections();
        self.layout.assign_addresses();
        self.layout.build_segments();
        Ok(())
    }

    fn dynsym_index(&self, id: SymbolId) -> u32 {
        self.dynsym_order
            .iter()
            .position(|&d| d == id)
            .map_or(0, |p| p as u32 + 1)
    }

    /// Address of a resolved pool symbol, if it has one. The address of a
    /// run-time-bound function is its PLT stub.
    fn symbol_addr(&self, id: SymbolId) -> Option<u64> {
        let record = self.pool.get(id);
        match record.value {
            SymbolValue::Absolute(value) => Some(value),
            SymbolValue::Output { section, offset } => {
                Some(self.layout.section(section).addr + offset)
            }
            SymbolValue::Section {
                file,
                section,
                offset,
            } => {
                let (output, base) = self.section_map.get(&(file, section))?;
                Some(self.layout.section(*output).addr + base + offset)
            }
            SymbolValue::None => {
                if let Some(slot) = self.tables.plt.slot_of(id) {
                    return Some(self.tables.plt.entry_addr(
                        self.layout.section(self.plt_section).addr,
                        slot,
                        self.arch.plt0_size(),
                        self.arch.plt_entry_size(),
                    ));
                }
                // Unresolved weak references read as zero. So does a
                // shared-object definition with no local copy: the loader
                // fills its words through the dynamic relocation the scan
                // reserved for it.
                if record.desc == Desc::Undefined || record.is_dynamic() {
                    return Some(0);
                }
                None
            }
        }
    }

    /// The output section header index a symbol's definition lives in.
    fn symbol_shndx(&self, id: SymbolId) -> u16 {
        let record = self.pool.get(id);
        match record.value {
            SymbolValue::Absolute(_) if record.is_defined() => elf::SHN_ABS,
            SymbolValue::Output { section, .. } => {
                self.layout.header_index(section).unwrap_or(elf::SHN_UNDEF)
            }
            SymbolValue::Section { file, section, .. } => self
                .section_map
                .get(&(file, section))
                .and_then(|(output, _)| self.layout.header_index(*output))
                .unwrap_or(elf::SHN_UNDEF),
            _ => elf::SHN_UNDEF,
        }
    }

    pub fn symbol_addr_by_name(&self, name: &[u8]) -> Option<u64> {
        if name == b"_GLOBAL_OFFSET_TABLE_" {
            return Some(self.layout.section(self.got_section).addr);
        }
        self.symbol_addr(self.pool.find(name)?)
    }

    fn local_symbol_addr(&self, file: usize, symbol: usize) -> Result<u64> {
        let obj = &self.objects[file];
        let sym = obj.symbol_by_index(object::SymbolIndex(symbol))?;
        if sym.kind() == SymbolKind::Section {
            let index = sym.section_index().context("section symbol without index")?;
            return Ok(self.input_section_addr(file, index).unwrap_or(0));
        }
        match sym.section_index() {
            Some(index) => Ok(self
                .input_section_addr(file, index)
                .map_or(sym.address(), |base| base + sym.address())),
            None => Ok(sym.address()),
        }
    }

    fn input_section_addr(&self, file: usize, section: SectionIndex) -> Option<u64> {
        let (output, offset) = self.section_map.get(&(file, section))?;
        Some(self.layout.section(*output).addr + offset)
    }

    /// Render every reserved slot and apply every input relocation, then
    /// recycle the relocation records.
    pub fn relocate(&mut self) -> Result<()> {
        if self.output_kind == OutputKind::Relocatable {
            // Nothing is applied; the records are carried into the output
            // as section-relative rela entries when the file is written.
            return Ok(());
        }
        self.fill_reserved_slots()?;

        struct Patch {
            section: usize,
            offset: u64,
            r_type: u32,
            p: u64,
            s: u64,
            a: i64,
        }
        let mut patches = Vec::with_capacity(self.relocs.len());
        for &handle in &self.relocs {
            let reloc = self.factory.get(handle);
            let (output, base) = *self
                .section_map
                .get(&(reloc.frag.file, reloc.frag.section))
                .with_context(|| {
                    format!(
                        "relocation against unmapped section in {}",
                        self.paths[reloc.frag.file]
                    )
                })?;
            if self.layout.section(output).is_bss {
                continue;
            }
            let offset = base + reloc.frag.offset;
            let p = self.layout.section(output).addr + offset;
            let s = self.relocation_value(reloc)?;
            patches.push(Patch {
                section: output,
                offset,
                r_type: reloc.r_type,
                p,
                s,
                a: reloc.addend,
            });
        }
        for patch in patches {
            let section = self.layout.section_mut(patch.section);
            self.arch.apply_relocation(
                patch.offset,
                patch.r_type,
                patch.p,
                patch.s,
                patch.a,
                &mut section.data,
            )?;
        }
        for handle in std::mem::take(&mut self.relocs) {
            self.factory.destroy(handle);
        }
        Ok(())
    }

    /// The S value a relocation resolves against: a GOT slot address for
    /// GOT-class references, a PLT stub for calls bound at run time, the
    /// symbol's own address otherwise.
    fn relocation_value(&self, reloc: &crate::reloc::Relocation) -> Result<u64> {
        let class = self.arch.classify(reloc.r_type)?;
        let entry_size = self.arch.got_entry_size();
        match reloc.target {
            RelocTarget::Pool(id) => {
                if class == RelocClass::Got {
                    if let Some(slot) = self.tables.got.data_slot_of(id) {
                        let base = self.layout.section(self.got_section).addr;
                        return Ok(self.tables.got.slot_addr(base, slot, entry_size));
                    }
                }
                if class == RelocClass::Plt {
                    if let Some(slot) = self.tables.plt.slot_of(id) {
                        return Ok(self.tables.plt.entry_addr(
                            self.layout.section(self.plt_section).addr,
                            slot,
                            self.arch.plt0_size(),
                            self.arch.plt_entry_size(),
                        ));
                    }
                }
                self.symbol_addr(id).ok_or_else(|| {
                    anyhow!(
                        "symbol missing: name={}",
                        String::from_utf8_lossy(self.pool.name(id))
                    )
                })
            }
            // The scan never allocates GOT slots for locals, so a GOT-class
            // reference here would read the symbol's storage as a pointer.
            RelocTarget::Local { file, symbol } => {
                if class == RelocClass::Got {
                    bail!(
                        "GOT relocation against local symbol {symbol} in {} has no slot",
                        self.paths[file]
                    );
                }
                self.local_symbol_addr(file, symbol)
            }
            RelocTarget::Section { file, section } => {
                if class == RelocClass::Got {
                    bail!(
                        "GOT relocation against a section of {} has no slot",
                        self.paths[file]
                    );
                }
                Ok(self.input_section_addr(file, section).unwrap_or(0))
            }
        }
    }

    fn fill_reserved_slots(&mut self) -> Result<()> {
        let entry_size = self.arch.got_entry_size();
        let got_base = self.layout.section(self.got_section).addr;
        let plt_base = self.layout.section(self.plt_section).addr;
        let copy_base = self.layout.section(self.copy_section).addr;

        // GOT entries that are computable now get their final value; the
        // rest stay zero for the loader.
        let bytes = self
            .tables
            .got
            .emit(entry_size, |id| self.symbol_addr(id).unwrap_or(0));
        self.layout.section_mut(self.got_section).data = bytes;

        if !self.tables.plt.is_empty() {
            let plt0 = self.arch.plt0_size() as usize;
            let entry = self.arch.plt_entry_size() as usize;
            let mut bytes = vec![0u8; plt0 + entry * self.tables.plt.len()];
            self.arch.write_plt0(&mut bytes[..plt0], plt_base, got_base);
            for (index, plt_entry) in self.tables.plt.entries().iter().enumerate() {
                let entry_addr = self.tables.plt.entry_addr(
                    plt_base,
                    index,
                    plt0 as u64,
                    entry as u64,
                );
                let got_slot = self
                    .tables
                    .got
                    .slot_addr(got_base, plt_entry.got_slot, entry_size);
                let start = plt0 + index * entry;
                self.arch.write_plt_entry(
                    &mut bytes[start..start + entry],
                    entry_addr,
                    got_slot,
                    index as u32,
                    plt_base,
                );
            }
            self.layout.section_mut(self.plt_section).data = bytes;
        }

        if !self.tables.dynrel.is_empty() {
            let section_map = &self.section_map;
            let layout = &self.layout;
            let got = &self.tables.got;
            let bytes = self.tables.dynrel.emit(
                |place| match place {
                    DynRelocPlace::Got(slot) => got.slot_addr(got_base, *slot, entry_size),
                    DynRelocPlace::Copy(offset) => copy_base + offset,
                    DynRelocPlace::Fragment(frag) => section_map
                        .get(&(frag.file, frag.section))
                        .map_or(0, |(output, base)| {
                            layout.section(*output).addr + base + frag.offset
                        }),
                },
                |id| self.dynsym_index(id),
            );
            self.layout.section_mut(self.rela_section).data = bytes;
        }

        if let (Some(dynsym), Some(dynstr), Some(hash)) = (
            self.dynsym_section,
            self.dynstr_section,
            self.hash_section,
        ) {
            let mut strtab = emit::StringTable::new();
            let order = self.dynsym_order.clone();
            let bytes = emit::build_symtab(&self.pool, &order, &mut strtab, |id, _| {
                (
                    self.symbol_addr(id).unwrap_or(0),
                    self.symbol_shndx(id),
                )
            });
            self.layout.section_mut(dynsym).data = bytes;
            self.layout.section_mut(dynstr).data = strtab.into_bytes();
            let names: Vec<&[u8]> = order.iter().map(|&id| self.pool.name(id)).collect();
            self.layout.section_mut(hash).data = emit::build_hash_section(&names);
        }
        Ok(())
    }

    /// Assign output symbol indices, render the regular name pools, and
    /// serialize the final file. The image is built fully in memory so an
    /// error cannot leave a partial file behind.
    pub fn write(&mut self, output_path: &Path) -> Result<()> {
        let order = emit::assign_symbol_indices(&mut self.pool)?;
        let relocatable = self.output_kind == OutputKind::Relocatable;
        let mut strtab = emit::StringTable::new();
        let mut symtab = emit::build_symtab(&self.pool, &order.ids, &mut strtab, |id, _| {
            let value = if relocatable {
                // st_value in ET_REL is an offset into the section.
                self.symbol_section_offset(id)
            } else {
                self.symbol_addr(id).unwrap_or(0)
            };
            (value, self.symbol_shndx(id))
        });

        let mut first_global = order.first_global;
        let mut relas = Vec::new();
        if relocatable {
            let emitted: Vec<usize> = self.layout.emitted().collect();
            // Section symbols sit between the null entry and the named
            // locals so the carried-through relocations can bind
            // section-relatively.
            let tail = symtab.split_off(24);
            symtab.extend_from_slice(&emit::section_symbol_entries(emitted.len()));
            symtab.extend_from_slice(&tail);
            first_global += emitted.len();
            relas = self.build_input_relas(&emitted)?;
        }

        let entry = if self.output_kind == OutputKind::Executable {
            match self.symbol_addr_by_name(self.entry.as_bytes()) {
                Some(addr) if addr != 0 => addr,
                _ => {
                    self.diag
                        .warn(&format!("entry symbol `{}' not found, defaulting to 0", self.entry));
                    0
                }
            }
        } else {
            0
        };

        writer::write_elf(
            output_path,
            &writer::WriteParams {
                machine: self.arch.machine(),
                output_kind: self.output_kind,
                entry,
                symtab,
                strtab: strtab.into_bytes(),
                first_global: first_global as u32,
                relas,
            },
            &self.layout,
        )
    }

    /// st_value of a symbol in relocatable output: its offset within the
    /// output section named by st_shndx.
    fn symbol_section_offset(&self, id: SymbolId) -> u64 {
        match self.pool.get(id).value {
            SymbolValue::Absolute(value) => value,
            SymbolValue::Output { offset, .. } => offset,
            SymbolValue::Section {
                file,
                section,
                offset,
            } => self
                .section_map
                .get(&(file, section))
                .map_or(offset, |(_, base)| base + offset),
            SymbolValue::None => 0,
        }
    }

    /// Carry every input relocation into the output, one rela section per
    /// output section. Pool symbols bind by their output symtab index
    /// (shifted past the section symbols); local and section references are
    /// rewritten against the output section symbol, folding the input
    /// section's placement into the addend.
    fn build_input_relas(&self, emitted: &[usize]) -> Result<Vec<writer::RelaSection>> {
        let nsec = emitted.len();
        let header_pos: HashMap<usize, usize> = emitted
            .iter()
            .enumerate()
            .map(|(pos, &index)| (index, pos))
            .collect();
        let mut grouped: Vec<Vec<u8>> = vec![Vec::new(); nsec];
        let endian = object::Endianness::Little;

        for &handle in &self.relocs {
            let reloc = self.factory.get(handle);
            let (output, base) = *self
                .section_map
                .get(&(reloc.frag.file, reloc.frag.section))
                .with_context(|| {
                    format!(
                        "relocation against unmapped section in {}",
                        self.paths[reloc.frag.file]
                    )
                })?;
            let Some(&pos) = header_pos.get(&output) else {
                continue;
            };
            let (r_sym, addend) = match reloc.target {
                RelocTarget::Pool(id) => {
                    let index = self.pool.get(id).output_index.map_or(0, |i| i + nsec);
                    (index as u32, reloc.addend)
                }
                RelocTarget::Section { file, section } => {
                    self.section_relative(file, section, reloc.addend, &header_pos)?
                }
                RelocTarget::Local { file, symbol } => {
                    let sym = self.objects[file].symbol_by_index(object::SymbolIndex(symbol))?;
                    match sym.section_index() {
                        Some(index) => {
                            let value = if sym.kind() == SymbolKind::Section {
                                0
                            } else {
                                sym.address()
                            };
                            self.section_relative(
                                file,
                                index,
                                reloc.addend + value as i64,
                                &header_pos,
                            )?
                        }
                        None => (0, reloc.addend + sym.address() as i64),
                    }
                }
            };
            let rela = elf::Rela64::<object::Endianness> {
                r_offset: object::U64::new(endian, base + reloc.frag.offset),
                r_info: object::U64::new(
                    endian,
                    (u64::from(r_sym) << 32) | u64::from(reloc.r_type),
                ),
                r_addend: object::I64::new(endian, addend),
            };
            grouped[pos].extend_from_slice(object::pod::bytes_of(&rela));
        }

        let mut out = Vec::new();
        for (pos, &index) in emitted.iter().enumerate() {
            let data = std::mem::take(&mut grouped[pos]);
            if data.is_empty() {
                continue;
            }
            out.push(writer::RelaSection {
                name: format!(".rela{}", self.layout.section(index).name),
                target: pos as u32 + 1,
                data,
            });
        }
        Ok(out)
    }

    /// Rewrite a reference to an input section as (output section symbol
    /// index, adjusted addend).
    fn section_relative(
        &self,
        file: usize,
        section: SectionIndex,
        addend: i64,
        header_pos: &HashMap<usize, usize>,
    ) -> Result<(u32, i64)> {
        let (output, base) = self
            .section_map
            .get(&(file, section))
            .with_context(|| {
                format!(
                    "relocation against unmapped section in {}",
                    self.paths[file]
                )
            })?;
        let pos = header_pos
            .get(output)
            .context("relocation targets a section with no output bytes")?;
        Ok((*pos as u32 + 1, addend + *base as i64))
    }
}

fn symbol_input<'n>(
    file: usize,
    source: Source,
    name: &'n [u8],
    sym: &object::Symbol<'_, '_>,
) -> Result<SymbolInput<'n>> {
    let binding = if sym.is_weak() {
        Binding::Weak
    } else {
        Binding::Global
    };
    let desc = if sym.is_undefined() {
        Desc::Undefined
    } else if sym.is_common() {
        Desc::Common
    } else {
        Desc::Defined
    };
    let sym_type = match sym.kind() {
        SymbolKind::Text => SymType::Func,
        SymbolKind::Data => SymType::Object,
        SymbolKind::Tls => SymType::Tls,
        SymbolKind::File => SymType::File,
        SymbolKind::Section => SymType::Section,
        _ => SymType::NoType,
    };
    let visibility = match sym.flags() {
        object::SymbolFlags::Elf { st_other, .. } => match st_other & 0x3 {
            1 => Visibility::Internal,
            2 => Visibility::Hidden,
            3 => Visibility::Protected,
            _ => Visibility::Default,
        },
        _ => Visibility::Default,
    };
    let value = if desc == Desc::Undefined || source == Source::Dynamic {
        SymbolValue::None
    } else if desc == Desc::Common {
        // For commons st_value carries the required alignment.
        SymbolValue::Absolute(sym.address())
    } else {
        match sym.section_index() {
            Some(section) => SymbolValue::Section {
                file,
                section,
                offset: sym.address(),
            },
            None => SymbolValue::Absolute(sym.address()),
        }
    };
    Ok(SymbolInput {
        name,
        binding,
        sym_type,
        visibility,
        desc,
        source,
        size: sym.size(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use crate::diagnostics::Diagnostics;
    use crate::reloc::FragmentRef;

    const AW: u64 = (elf::SHF_ALLOC | elf::SHF_WRITE) as u64;
    const AX: u64 = (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u64;

    fn test_linker(output_kind: OutputKind, pic: bool) -> Linker<'static> {
        Linker::new(
            Box::new(X86_64),
            output_kind,
            pic,
            "_start".to_string(),
            WarningPolicy::Continue,
        )
    }

    fn insert(linker: &mut Linker, name: &[u8], desc: Desc, source: Source) -> SymbolId {
        let mut diag = Diagnostics::new();
        linker
            .pool
            .insert_symbol(
                &SymbolInput {
                    name,
                    binding: Binding::Global,
                    sym_type: SymType::Object,
                    visibility: Visibility::Default,
                    desc,
                    source,
                    size: 8,
                    value: SymbolValue::None,
                },
                &mut diag,
            )
            .unwrap()
            .id
    }

    fn frag(offset: u64) -> FragmentRef {
        FragmentRef {
            file: 0,
            section: SectionIndex(1),
            offset,
        }
    }

    #[test]
    fn deferred_dynamic_data_reference_stays_zero_for_the_loader() {
        // A PIC link taking the address of data defined in a shared object
        // leaves a dynamic relocation and writes zero, instead of failing
        // because the symbol has no link-time address.
        let mut linker = test_linker(OutputKind::Executable, true);
        let id = insert(&mut linker, b"shared_data", Desc::Defined, Source::Dynamic);

        let data_sec = linker.get_or_create(".data", SectionOrder::Data, AW, false);
        let offset = linker.layout.section_mut(data_sec).append(&[0u8; 8], 8);
        linker
            .section_map
            .insert((0, SectionIndex(1)), (data_sec, offset));
        linker.paths.push("a.o".to_string());

        let handle = linker
            .factory
            .produce(elf::R_X86_64_64, frag(0), 0, RelocTarget::Pool(id), &[0u8; 8])
            .unwrap();
        linker.relocs.push(handle);
        let scanner = Scanner::new(
            linker.arch.as_ref(),
            linker.output_kind,
            linker.pic,
            linker.copy_section,
        );
        scanner
            .scan_relocation(linker.factory.get(handle), &mut linker.pool, &mut linker.tables)
            .unwrap();
        assert_eq!(linker.tables.dynrel.len(), 1);

        linker.layout().unwrap();
        linker.relocate().unwrap();

        assert_eq!(&linker.layout.section(data_sec).data[..8], &[0u8; 8]);
        // The loader's record was rendered for the deferred word.
        assert_eq!(linker.layout.section(linker.rela_section).data.len(), 24);
    }

    #[test]
    fn relocatable_output_carries_input_relocations() {
        let mut linker = test_linker(OutputKind::Relocatable, false);
        let id = insert(&mut linker, b"callee", Desc::Undefined, Source::Regular);

        let text = linker.get_or_create(".text", SectionOrder::Text, AX, false);
        let offset = linker.layout.section_mut(text).append(&[0u8; 8], 16);
        linker.section_map.insert((0, SectionIndex(1)), (text, offset));
        linker.paths.push("a.o".to_string());

        let handle = linker
            .factory
            .produce(elf::R_X86_64_PC32, frag(4), -4, RelocTarget::Pool(id), &[0u8; 8])
            .unwrap();
        linker.relocs.push(handle);
        let scanner = Scanner::new(
            linker.arch.as_ref(),
            linker.output_kind,
            linker.pic,
            linker.copy_section,
        );
        scanner
            .scan_relocation(linker.factory.get(handle), &mut linker.pool, &mut linker.tables)
            .unwrap();
        assert!(linker.tables.dynrel.is_empty());
        assert!(linker.tables.got.is_empty());

        emit::assign_symbol_indices(&mut linker.pool).unwrap();
        linker.layout.sort_sections();
        let emitted: Vec<usize> = linker.layout.emitted().collect();
        assert_eq!(emitted, [text]);

        let relas = linker.build_input_relas(&emitted).unwrap();
        assert_eq!(relas.len(), 1);
        assert_eq!(relas[0].name, ".rela.text");
        assert_eq!(relas[0].target, 1);
        assert_eq!(relas[0].data.len(), 24);

        let record = &relas[0].data;
        let r_offset = u64::from_le_bytes(record[..8].try_into().unwrap());
        let r_info = u64::from_le_bytes(record[8..16].try_into().unwrap());
        let r_addend = i64::from_le_bytes(record[16..24].try_into().unwrap());
        assert_eq!(r_offset, 4);
        // One section symbol precedes the pool symbols.
        assert_eq!(r_info >> 32, 2);
        assert_eq!(r_info & 0xffff_ffff, u64::from(elf::R_X86_64_PC32));
        assert_eq!(r_addend, -4);
    }

    #[test]
    fn got_reference_to_an_unslotted_local_is_an_error() {
        let mut linker = test_linker(OutputKind::Executable, false);
        linker.paths.push("a.o".to_string());
        let handle = linker
            .factory
            .produce(
                elf::R_X86_64_GOTPCREL,
                frag(0),
                -4,
                RelocTarget::Local { file: 0, symbol: 5 },
                &[0u8; 8],
            )
            .unwrap();
        let err = linker
            .relocation_value(linker.factory.get(handle))
            .unwrap_err();
        assert!(err.to_string().contains("has no slot"));
    }
}
