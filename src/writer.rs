//! ELF file writer.
//!
//! Serializes the finished layout: file header, one PT_LOAD program header
//! per segment, section contents at their assigned file offsets, then the
//! non-loaded tables (.symtab, .strtab, carried-through rela sections for
//! relocatable output, .shstrtab) and the section header table. The image is
//! assembled fully in memory and written once.

use anyhow::Result;
use object::elf;
use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::Endianness;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::config::OutputKind;
use crate::layout::Layout;
use crate::utils::align_up;

fn u16(v: u16) -> U16<Endianness> {
    U16::new(Endianness::Little, v)
}
fn u32(v: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, v)
}
fn u64(v: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, v)
}

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const SHDR_SIZE: u64 = 64;
const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;

pub struct WriteParams {
    pub machine: u16,
    pub output_kind: OutputKind,
    pub entry: u64,
    pub symtab: Vec<u8>,
    pub strtab: Vec<u8>,
    /// Index of the first non-local symbol, the symtab header's sh_info.
    pub first_global: u32,
    /// Carried-through relocation sections for relocatable output; empty
    /// otherwise.
    pub relas: Vec<RelaSection>,
}

/// One SHT_RELA section of relocatable output: rendered Elf64_Rela records
/// against the section at header index `target`.
pub struct RelaSection {
    pub name: String,
    pub target: u32,
    pub data: Vec<u8>,
}

/// Write the linked output to disk.
pub fn write_elf(output_path: &Path, params: &WriteParams, layout: &Layout) -> Result<()> {
    let emitted: Vec<usize> = layout.emitted().collect();
    // null + loaded sections + rela sections + .symtab + .strtab + .shstrtab
    let num_sections = emitted.len() as u16 + params.relas.len() as u16 + 4;
    let relocatable = params.output_kind == OutputKind::Relocatable;
    let phnum = if relocatable {
        0
    } else {
        layout.segments.len() as u16
    };

    let e_type = match params.output_kind {
        OutputKind::Executable => elf::ET_EXEC,
        OutputKind::SharedObject => elf::ET_DYN,
        OutputKind::Relocatable => elf::ET_REL,
    };
    let file_header = elf::FileHeader64::<Endianness> {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16(e_type),
        e_machine: u16(params.machine),
        e_version: u32(elf::EV_CURRENT as u32),
        e_entry: u64(params.entry),
        e_phoff: u64(if phnum > 0 { EHDR_SIZE } else { 0 }),
        e_shoff: u64(0), // Will be patched later
        e_flags: u32(0),
        e_ehsize: u16(EHDR_SIZE as u16),
        e_phentsize: u16(PHDR_SIZE as u16),
        e_phnum: u16(phnum),
        e_shentsize: u16(SHDR_SIZE as u16),
        e_shnum: u16(num_sections),
        e_shstrndx: u16(num_sections - 1),
    };
    let mut buffer = Vec::new();
    buffer.extend_from_slice(bytes_of(&file_header));

    if !relocatable {
        for segment in &layout.segments {
            let prog_header = elf::ProgramHeader64::<Endianness> {
                p_type: u32(elf::PT_LOAD),
                p_flags: u32(segment.flags),
                p_offset: u64(segment.offset),
                p_vaddr: u64(segment.addr),
                p_paddr: u64(segment.addr),
                p_filesz: u64(segment.file_size),
                p_memsz: u64(segment.mem_size),
                p_align: u64(segment.align),
            };
            buffer.extend_from_slice(bytes_of(&prog_header));
        }
    }

    // Section contents at their assigned offsets. NOBITS sections occupy
    // no file bytes.
    for &index in &emitted {
        let section = layout.section(index);
        if section.is_bss {
            continue;
        }
        let current = buffer.len() as u64;
        if section.offset > current {
            buffer.resize(section.offset as usize, 0);
        }
        buffer.extend_from_slice(&section.data);
    }

    // Non-loaded tables follow the last loaded byte.
    let symtab_offset = align_up(buffer.len() as u64, 8);
    buffer.resize(symtab_offset as usize, 0);
    buffer.extend_from_slice(&params.symtab);
    let strtab_offset = buffer.len() as u64;
    buffer.extend_from_slice(&params.strtab);

    let mut rela_offsets = Vec::with_capacity(params.relas.len());
    for rela in &params.relas {
        let offset = align_up(buffer.len() as u64, 8);
        buffer.resize(offset as usize, 0);
        buffer.extend_from_slice(&rela.data);
        rela_offsets.push(offset);
    }

    // Section header string table.
    let mut shstrtab = vec![0u8];
    let name_offset = |name: &str, shstrtab: &mut Vec<u8>| -> u32 {
        let offset = shstrtab.len() as u32;
        shstrtab.extend_from_slice(name.as_bytes());
        shstrtab.push(0);
        offset
    };
    let section_names: Vec<u32> = emitted
        .iter()
        .map(|&i| name_offset(&layout.section(i).name, &mut shstrtab))
        .collect();
    let rela_names: Vec<u32> = params
        .relas
        .iter()
        .map(|r| name_offset(&r.name, &mut shstrtab))
        .collect();
    let symtab_name = name_offset(".symtab", &mut shstrtab);
    let strtab_name = name_offset(".strtab", &mut shstrtab);
    let shstrtab_name = name_offset(".shstrtab", &mut shstrtab);
    let shstrtab_offset = buffer.len() as u64;
    buffer.extend_from_slice(&shstrtab);

    let shoff = align_up(buffer.len() as u64, 8);
    buffer.resize(shoff as usize, 0);

    // Header indices of the dynamic tables, for sh_link.
    let header_of = |name: &str| -> u32 {
        emitted
            .iter()
            .position(|&i| layout.section(i).name == name)
            .map_or(0, |p| p as u32 + 1)
    };
    let dynsym_header = header_of(".dynsym");
    let dynstr_header = header_of(".dynstr");
    let symtab_header = emitted.len() as u32 + params.relas.len() as u32 + 1;
    let strtab_header = symtab_header + 1;

    let null_sec = elf::SectionHeader64::<Endianness> {
        sh_name: u32(0),
        sh_type: u32(elf::SHT_NULL),
        sh_flags: u64(0),
        sh_addr: u64(0),
        sh_offset: u64(0),
        sh_size: u64(0),
        sh_link: u32(0),
        sh_info: u32(0),
        sh_addralign: u64(0),
        sh_entsize: u64(0),
    };
    buffer.extend_from_slice(bytes_of(&null_sec));

    for (position, &index) in emitted.iter().enumerate() {
        let section = layout.section(index);
        let (sh_type, sh_link, sh_info, sh_entsize) = section_header_kind(
            &section.name,
            section.is_bss,
            dynsym_header,
            dynstr_header,
        );
        let header = elf::SectionHeader64::<Endianness> {
            sh_name: u32(section_names[position]),
            sh_type: u32(sh_type),
            sh_flags: u64(section.flags),
            // ET_REL sections have no assigned addresses.
            sh_addr: u64(if relocatable { 0 } else { section.addr }),
            sh_offset: u64(section.offset),
            sh_size: u64(section.size),
            sh_link: u32(sh_link),
            sh_info: u32(sh_info),
            sh_addralign: u64(section.align.max(1)),
            sh_entsize: u64(sh_entsize),
        };
        buffer.extend_from_slice(bytes_of(&header));
    }

    for (position, rela) in params.relas.iter().enumerate() {
        let header = elf::SectionHeader64::<Endianness> {
            sh_name: u32(rela_names[position]),
            sh_type: u32(elf::SHT_RELA),
            sh_flags: u64(elf::SHF_INFO_LINK as u64),
            sh_addr: u64(0),
            sh_offset: u64(rela_offsets[position]),
            sh_size: u64(rela.data.len() as u64),
            sh_link: u32(symtab_header),
            sh_info: u32(rela.target),
            sh_addralign: u64(8),
            sh_entsize: u64(RELA_SIZE),
        };
        buffer.extend_from_slice(bytes_of(&header));
    }

    let symtab_header = elf::SectionHeader64::<Endianness> {
        sh_name: u32(symtab_name),
        sh_type: u32(elf::SHT_SYMTAB),
        sh_flags: u64(0),
        sh_addr: u64(0),
        sh_offset: u64(symtab_offset),
        sh_size: u64(params.symtab.len() as u64),
        sh_link: u32(strtab_header),
        sh_info: u32(params.first_global),
        sh_addralign: u64(8),
        sh_entsize: u64(SYM_SIZE),
    };
    buffer.extend_from_slice(bytes_of(&symtab_header));

    let strtab_header64 = elf::SectionHeader64::<Endianness> {
        sh_name: u32(strtab_name),
        sh_type: u32(elf::SHT_STRTAB),
        sh_flags: u64(0),
        sh_addr: u64(0),
        sh_offset: u64(strtab_offset),
        sh_size: u64(params.strtab.len() as u64),
        sh_link: u32(0),
        sh_info: u32(0),
        sh_addralign: u64(1),
        sh_entsize: u64(0),
    };
    buffer.extend_from_slice(bytes_of(&strtab_header64));

    let shstrtab_header = elf::SectionHeader64::<Endianness> {
        sh_name: u32(shstrtab_name),
        sh_type: u32(elf::SHT_STRTAB),
        sh_flags: u64(0),
        sh_addr: u64(0),
        sh_offset: u64(shstrtab_offset),
        sh_size: u64(shstrtab.len() as u64),
        sh_link: u32(0),
        sh_info: u32(0),
        sh_addralign: u64(1),
        sh_entsize: u64(0),
    };
    buffer.extend_from_slice(bytes_of(&shstrtab_header));

    // Patch e_shoff in the file header
    buffer[40..48].copy_from_slice(&shoff.to_le_bytes());

    std::fs::write(output_path, &buffer)?;

    if params.output_kind != OutputKind::Relocatable {
        let mut perms = std::fs::metadata(output_path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(output_path, perms)?;
    }

    Ok(())
}

/// Section header type, links and entry size, decided by the output
/// section's conventional name.
fn section_header_kind(name: &str, is_bss: bool, dynsym: u32, dynstr: u32) -> (u32, u32, u32, u64) {
    if is_bss {
        return (elf::SHT_NOBITS, 0, 0, 0);
    }
    match name {
        // sh_info of a symbol table is the first non-local entry; the
        // dynamic table holds no locals beyond the null symbol.
        ".dynsym" => (elf::SHT_DYNSYM, dynstr, 1, SYM_SIZE),
        ".dynstr" => (elf::SHT_STRTAB, 0, 0, 0),
        ".hash" => (elf::SHT_HASH, dynsym, 0, 4),
        ".rela.dyn" => (elf::SHT_RELA, dynsym, 0, RELA_SIZE),
        ".init_array" => (elf::SHT_INIT_ARRAY, 0, 0, 8),
        ".fini_array" => (elf::SHT_FINI_ARRAY, 0, 0, 8),
        _ => (elf::SHT_PROGBITS, 0, 0, 0),
    }
}
