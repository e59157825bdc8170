//! Output symbol emission.
//!
//! Turns the resolved symbol pool into output-table content: allocates
//! surviving common symbols, assigns symbol-table indices with every
//! local-binding symbol ahead of every global one (the ABI-required split),
//! and renders the string/symbol/hash name pools. Walks the pool strictly in
//! insertion order so identical inputs produce identical bytes.

use anyhow::{anyhow, Result};
use object::elf;
use object::pod::bytes_of;
use object::Endianness;
use object::{U16, U32, U64};

use crate::intern::SymbolId;
use crate::resolver::SymbolPool;
use crate::symbol::{Binding, Desc, SymType, SymbolRecord, SymbolValue, Visibility};

/// A string table under construction. Offset 0 is the empty name.
pub struct StringTable {
    bytes: Vec<u8>,
}

impl StringTable {
    pub fn new() -> Self {
        Self { bytes: vec![0] }
    }

    pub fn push(&mut self, name: &[u8]) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name);
        self.bytes.push(0);
        offset
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite surviving common symbols into real storage in the bss output
/// section. Must run before symbol indices are assigned.
pub fn allocate_commons(
    pool: &mut SymbolPool,
    bss_index: usize,
    bss: &mut crate::layout::OutputSection,
) {
    let commons: Vec<SymbolId> = pool
        .iter()
        .filter(|(_, r)| r.desc == Desc::Common)
        .map(|(id, _)| id)
        .collect();
    for id in commons {
        let size = pool.get(id).size.max(1);
        // A common's value field carries its required alignment.
        let align = match pool.get(id).value {
            SymbolValue::Absolute(a) if a.is_power_of_two() => a,
            _ => size.min(16).next_power_of_two(),
        };
        let offset = bss.reserve(size, align);
        let record = pool.get_mut(id);
        record.desc = Desc::Defined;
        record.value = SymbolValue::Output {
            section: bss_index,
            offset,
        };
        tracing::debug!(offset, size, "allocated common symbol");
    }
}

/// Symbol ids in output-table order, locals first, and the index of the
/// first global entry (the value of the symtab section's sh_info).
pub struct SymbolOrder {
    pub ids: Vec<SymbolId>,
    pub first_global: usize,
}

/// Assign output symbol-table indices. Index 0 is the null symbol; locals
/// come before globals while both keep their relative insertion order. A
/// common symbol reaching this point means the allocation pass was skipped.
pub fn assign_symbol_indices(pool: &mut SymbolPool) -> Result<SymbolOrder> {
    let mut locals = Vec::new();
    let mut globals = Vec::new();
    for (id, record) in pool.iter() {
        if record.desc == Desc::Common {
            return Err(anyhow!(
                "common symbol `{}' was never allocated",
                String::from_utf8_lossy(pool.name(id))
            ));
        }
        if record.binding == Binding::Local {
            locals.push(id);
        } else {
            globals.push(id);
        }
    }
    let first_global = locals.len() + 1;
    let ids: Vec<SymbolId> = locals.into_iter().chain(globals).collect();
    for (position, &id) in ids.iter().enumerate() {
        pool.get_mut(id).output_index = Some(position + 1);
    }
    Ok(SymbolOrder { ids, first_global })
}

fn st_info(record: &SymbolRecord) -> u8 {
    let bind = match record.binding {
        Binding::Local => elf::STB_LOCAL,
        Binding::Global => elf::STB_GLOBAL,
        Binding::Weak => elf::STB_WEAK,
    };
    let kind = match record.sym_type {
        SymType::NoType => elf::STT_NOTYPE,
        SymType::Object => elf::STT_OBJECT,
        SymType::Func => elf::STT_FUNC,
        SymType::Section => elf::STT_SECTION,
        SymType::File => elf::STT_FILE,
        SymType::Tls => elf::STT_TLS,
    };
    (bind << 4) | kind
}

fn st_other(record: &SymbolRecord) -> u8 {
    match record.visibility {
        Visibility::Default => elf::STV_DEFAULT,
        Visibility::Internal => elf::STV_INTERNAL,
        Visibility::Hidden => elf::STV_HIDDEN,
        Visibility::Protected => elf::STV_PROTECTED,
    }
}

/// Render an ELF64 symbol table for `order`, appending names to `strtab`.
/// `resolve` supplies each symbol's final value and output section header
/// index.
pub fn build_symtab(
    pool: &SymbolPool,
    order: &[SymbolId],
    strtab: &mut StringTable,
    mut resolve: impl FnMut(SymbolId, &SymbolRecord) -> (u64, u16),
) -> Vec<u8> {
    let endian = Endianness::Little;
    let mut bytes = Vec::with_capacity((order.len() + 1) * 24);
    bytes.extend_from_slice(bytes_of(&elf::Sym64::<Endianness> {
        st_name: U32::new(endian, 0),
        st_info: 0,
        st_other: 0,
        st_shndx: U16::new(endian, 0),
        st_value: U64::new(endian, 0),
        st_size: U64::new(endian, 0),
    }));
    for &id in order {
        let record = pool.get(id);
        let (value, shndx) = resolve(id, record);
        let sym = elf::Sym64::<Endianness> {
            st_name: U32::new(endian, strtab.push(pool.name(id))),
            st_info: st_info(record),
            st_other: st_other(record),
            st_shndx: U16::new(endian, shndx),
            st_value: U64::new(endian, value),
            st_size: U64::new(endian, record.size),
        };
        bytes.extend_from_slice(bytes_of(&sym));
    }
    bytes
}

/// Render one local STT_SECTION symbol per output section, in section
/// header order starting at index 1. Relocatable output needs these so
/// carried-through relocations can bind section-relatively.
pub fn section_symbol_entries(count: usize) -> Vec<u8> {
    let endian = Endianness::Little;
    let mut bytes = Vec::with_capacity(count * 24);
    for position in 0..count {
        let sym = elf::Sym64::<Endianness> {
            st_name: U32::new(endian, 0),
            st_info: (elf::STB_LOCAL << 4) | elf::STT_SECTION,
            st_other: 0,
            st_shndx: U16::new(endian, position as u16 + 1),
            st_value: U64::new(endian, 0),
            st_size: U64::new(endian, 0),
        };
        bytes.extend_from_slice(bytes_of(&sym));
    }
    bytes
}

/// Symbols that belong in the dynamic symbol table: everything defined by or
/// bound to a shared object, everything with a reserved output entry, and
/// every exported global when producing a shared object.
pub fn dynamic_symbols(pool: &SymbolPool, shared_output: bool) -> Vec<SymbolId> {
    pool.iter()
        .filter(|(_, r)| {
            if r.binding == Binding::Local {
                return false;
            }
            r.is_dynamic()
                || !r.reserved.is_empty()
                || (shared_output && r.visibility == Visibility::Default)
        })
        .map(|(id, _)| id)
        .collect()
}

/// Bucket counts for the SysV hash section, from the gold linker's table of
/// symbol-count thresholds. The chosen count is the largest entry that does
/// not exceed the number of dynamic symbols.
const HASH_BUCKETS: &[u32] = &[
    1, 3, 17, 37, 67, 97, 131, 197, 263, 521, 1031, 2053, 4099, 8209, 16411, 32771,
];

pub fn hash_bucket_count(symbol_count: usize) -> u32 {
    let mut chosen = HASH_BUCKETS[0];
    for &count in HASH_BUCKETS {
        if u64::from(count) > symbol_count as u64 {
            break;
        }
        chosen = count;
    }
    chosen
}

/// The standard SysV ELF name hash.
pub fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &byte in name {
        h = (h << 4).wrapping_add(u32::from(byte));
        let g = h & 0xf000_0000;
        h ^= g >> 24;
        h &= !g;
    }
    h
}

/// Render the `.hash` section for the dynamic symbol table. `names[i]` must
/// be the name of dynamic symbol index `i + 1` (index 0 is the null symbol).
pub fn build_hash_section(names: &[&[u8]]) -> Vec<u8> {
    let nchain = names.len() as u32 + 1;
    let nbucket = hash_bucket_count(names.len());
    let mut buckets = vec![0u32; nbucket as usize];
    let mut chains = vec![0u32; nchain as usize];
    for (i, name) in names.iter().enumerate() {
        let symbol_index = i as u32 + 1;
        let bucket = (elf_hash(name) % nbucket) as usize;
        // Prepend to the bucket's chain.
        chains[symbol_index as usize] = buckets[bucket];
        buckets[bucket] = symbol_index;
    }
    let mut bytes = Vec::with_capacity((2 + buckets.len() + chains.len()) * 4);
    for word in [nbucket, nchain]
        .iter()
        .chain(buckets.iter())
        .chain(chains.iter())
    {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}
