//! Target-owned output tables.
//!
//! The relocation scanner reserves slots in these builders; each holds at
//! most one slot per symbol. Sizes become known as soon as scanning is done,
//! so the layout pass can place the backing sections, and the emission pass
//! renders the final bytes once addresses are fixed.

use object::elf;
use object::pod::bytes_of;
use object::Endianness;
use object::{I64, U64};

use crate::intern::SymbolId;
use crate::reloc::{FragmentRef, RelocType};

/// How a GOT slot gets its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotUse {
    /// Filled with the symbol's address at link time.
    Static,
    /// Filled by the loader through a glob-dat relocation.
    GlobDat,
    /// Owned by a PLT stub, filled lazily through a jump-slot relocation.
    JumpSlot,
}

#[derive(Debug, Clone, Copy)]
pub struct GotEntry {
    pub symbol: SymbolId,
    pub usage: GotUse,
}

/// Global offset table builder.
#[derive(Default)]
pub struct GotSection {
    entries: Vec<GotEntry>,
}

impl GotSection {
    /// Reserve one slot for `symbol`. The scanner's reservation bitmask
    /// guarantees this is called at most once per symbol and usage.
    pub fn reserve(&mut self, symbol: SymbolId, usage: GotUse) -> usize {
        debug_assert!(
            !self
                .entries
                .iter()
                .any(|e| e.symbol == symbol && e.usage == usage),
            "duplicate GOT reservation"
        );
        self.entries.push(GotEntry { symbol, usage });
        self.entries.len() - 1
    }

    pub fn slot_of(&self, symbol: SymbolId) -> Option<usize> {
        self.entries.iter().position(|e| e.symbol == symbol)
    }

    /// The slot GOT-class references should read, preferring a data slot
    /// over one owned by a PLT stub.
    pub fn data_slot_of(&self, symbol: SymbolId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.symbol == symbol && e.usage != GotUse::JumpSlot)
            .or_else(|| self.slot_of(symbol))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[GotEntry] {
        &self.entries
    }

    pub fn size(&self, entry_size: u64) -> u64 {
        self.entries.len() as u64 * entry_size
    }

    pub fn slot_addr(&self, base: u64, slot: usize, entry_size: u64) -> u64 {
        base + slot as u64 * entry_size
    }

    /// Render the table. `resolve` maps a symbol to the value a statically
    /// filled slot should hold; loader-filled slots are left zero.
    pub fn emit(&self, entry_size: u64, mut resolve: impl FnMut(SymbolId) -> u64) -> Vec<u8> {
        let mut bytes = vec![0u8; (self.entries.len() as u64 * entry_size) as usize];
        for (slot, entry) in self.entries.iter().enumerate() {
            let value = match entry.usage {
                GotUse::Static => resolve(entry.symbol),
                GotUse::GlobDat | GotUse::JumpSlot => 0,
            };
            let start = slot * entry_size as usize;
            match entry_size {
                8 => bytes[start..start + 8].copy_from_slice(&value.to_le_bytes()),
                4 => bytes[start..start + 4].copy_from_slice(&(value as u32).to_le_bytes()),
                _ => unreachable!("entry size follows the bit class"),
            }
        }
        bytes
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PltEntry {
    pub symbol: SymbolId,
    /// GOT slot owned by this stub.
    pub got_slot: usize,
}

/// Procedure linkage table builder. Slot 0 is the resolver header stub.
#[derive(Default)]
pub struct PltSection {
    entries: Vec<PltEntry>,
}

impl PltSection {
    pub fn reserve(&mut self, symbol: SymbolId, got_slot: usize) -> usize {
        debug_assert!(
            !self.entries.iter().any(|e| e.symbol == symbol),
            "duplicate PLT reservation"
        );
        self.entries.push(PltEntry { symbol, got_slot });
        self.entries.len() - 1
    }

    pub fn slot_of(&self, symbol: SymbolId) -> Option<usize> {
        self.entries.iter().position(|e| e.symbol == symbol)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PltEntry] {
        &self.entries
    }

    pub fn size(&self, plt0_size: u64, entry_size: u64) -> u64 {
        if self.entries.is_empty() {
            0
        } else {
            plt0_size + self.entries.len() as u64 * entry_size
        }
    }

    pub fn entry_addr(&self, base: u64, slot: usize, plt0_size: u64, entry_size: u64) -> u64 {
        base + plt0_size + slot as u64 * entry_size
    }
}

/// Where a dynamic relocation applies.
#[derive(Debug, Clone, Copy)]
pub enum DynRelocPlace {
    /// A GOT slot, identified by its index.
    Got(usize),
    /// An offset inside the copy region.
    Copy(u64),
    /// A place inside a loaded input section.
    Fragment(FragmentRef),
}

#[derive(Debug, Clone, Copy)]
pub struct DynRelocEntry {
    pub r_type: RelocType,
    pub symbol: SymbolId,
    pub place: DynRelocPlace,
    pub addend: i64,
}

/// Builder for the relocation records left in the output for the loader.
#[derive(Default)]
pub struct DynRelocSection {
    entries: Vec<DynRelocEntry>,
}

impl DynRelocSection {
    pub fn reserve(
        &mut self,
        r_type: RelocType,
        symbol: SymbolId,
        place: DynRelocPlace,
        addend: i64,
    ) -> usize {
        self.entries.push(DynRelocEntry {
            r_type,
            symbol,
            place,
            addend,
        });
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DynRelocEntry] {
        &self.entries
    }

    pub fn size(&self) -> u64 {
        self.entries.len() as u64 * std::mem::size_of::<elf::Rela64<Endianness>>() as u64
    }

    /// Render Elf64_Rela records. `place_addr` resolves each entry's place
    /// to its final address; `dynsym_index` maps symbols to their dynamic
    /// symbol table index.
    pub fn emit(
        &self,
        mut place_addr: impl FnMut(&DynRelocPlace) -> u64,
        mut dynsym_index: impl FnMut(SymbolId) -> u32,
    ) -> Vec<u8> {
        let endian = Endianness::Little;
        let mut bytes = Vec::with_capacity(self.size() as usize);
        for entry in &self.entries {
            let rela = elf::Rela64::<Endianness> {
                r_offset: U64::new(endian, place_addr(&entry.place)),
                r_info: U64::new(
                    endian,
                    (u64::from(dynsym_index(entry.symbol)) << 32) | u64::from(entry.r_type),
                ),
                r_addend: I64::new(endian, entry.addend),
            };
            bytes.extend_from_slice(bytes_of(&rela));
        }
        bytes
    }
}

/// Space reserved in a writable bss-like section for symbols redirected by
/// copy relocations.
#[derive(Default)]
pub struct CopySection {
    reservations: Vec<(SymbolId, u64, u64)>, // symbol, offset, size
    size: u64,
}

impl CopySection {
    pub fn reserve(&mut self, symbol: SymbolId, size: u64, align: u64) -> u64 {
        debug_assert!(
            !self.reservations.iter().any(|(s, _, _)| *s == symbol),
            "duplicate copy reservation"
        );
        let align = align.max(1);
        let offset = (self.size + align - 1) & !(align - 1);
        self.reservations.push((symbol, offset, size));
        self.size = offset + size;
        offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    pub fn reservations(&self) -> &[(SymbolId, u64, u64)] {
        &self.reservations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::InternTable;
    use crate::symbol::{Binding, Desc, Reserve, Source, SymType, SymbolRecord, SymbolValue, Visibility};

    fn ids(n: usize) -> Vec<SymbolId> {
        let mut table = InternTable::new();
        (0..n)
            .map(|i| {
                table
                    .insert_with(format!("s{i}").as_bytes(), || SymbolRecord {
                        binding: Binding::Global,
                        sym_type: SymType::Func,
                        visibility: Visibility::Default,
                        desc: Desc::Defined,
                        source: Source::Dynamic,
                        size: 0,
                        value: SymbolValue::None,
                        reserved: Reserve::empty(),
                        output_index: None,
                    })
                    .0
            })
            .collect()
    }

    #[test]
    fn got_emits_static_values_and_zeroed_dynamic_slots() {
        let ids = ids(2);
        let mut got = GotSection::default();
        got.reserve(ids[0], GotUse::Static);
        got.reserve(ids[1], GotUse::GlobDat);
        let bytes = got.emit(8, |id| if id == ids[0] { 0xdead_beef } else { 0 });
        assert_eq!(bytes.len(), 16);
        assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), 0xdead_beef);
        assert_eq!(u64::from_le_bytes(bytes[8..].try_into().unwrap()), 0);
    }

    #[test]
    fn plt_size_includes_the_header_only_when_used() {
        let ids = ids(1);
        let mut plt = PltSection::default();
        assert_eq!(plt.size(16, 16), 0);
        plt.reserve(ids[0], 0);
        assert_eq!(plt.size(16, 16), 32);
        assert_eq!(plt.entry_addr(0x1000, 0, 16, 16), 0x1010);
    }

    #[test]
    fn dyn_reloc_records_pack_symbol_and_type() {
        let ids = ids(1);
        let mut rels = DynRelocSection::default();
        rels.reserve(7, ids[0], DynRelocPlace::Got(0), 0);
        let bytes = rels.emit(|_| 0x403000, |_| 5);
        assert_eq!(bytes.len(), 24);
        assert_eq!(u64::from_le_bytes(bytes[..8].try_into().unwrap()), 0x403000);
        let info = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        assert_eq!(info >> 32, 5);
        assert_eq!(info & 0xffff_ffff, 7);
    }

    #[test]
    fn copy_reservations_are_aligned() {
        let ids = ids(2);
        let mut copy = CopySection::default();
        assert_eq!(copy.reserve(ids[0], 3, 1), 0);
        assert_eq!(copy.reserve(ids[1], 8, 8), 8);
        assert_eq!(copy.size(), 16);
    }
}
