//! Relocation records and their recycling arena.
//!
//! Relocations are allocated out of `RelocationFactory`, an arena with an
//! explicit free list, and referred to by plain index handles. Producing a
//! record captures the bytes the relocation will later be applied to (the
//! target word) from the referenced fragment, swapped into host order when
//! host and target byte orders differ. Destroying a record returns its slot
//! to the free list; the fragment itself is owned by whichever section
//! contributed it and is not released here.

use anyhow::{bail, Result};
use object::read::SectionIndex;
use object::{Endian, Endianness};

use crate::error::LinkError;
use crate::intern::SymbolId;

/// Raw ELF relocation type (the `r_type` field).
pub type RelocType = u32;

/// A place inside an input section's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    pub file: usize,
    pub section: SectionIndex,
    pub offset: u64,
}

/// What a relocation refers to. Only pool symbols (named globals) ever
/// participate in GOT/PLT/dynamic-relocation allocation; locals and section
/// references resolve entirely at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    Pool(SymbolId),
    Local { file: usize, symbol: usize },
    Section { file: usize, section: SectionIndex },
}

#[derive(Debug, Clone)]
pub struct Relocation {
    pub r_type: RelocType,
    pub frag: FragmentRef,
    pub addend: i64,
    pub target: RelocTarget,
    /// Bytes at the relocated location, captured at construction, in host
    /// order.
    pub target_word: u64,
}

/// Handle into the factory's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocHandle(u32);

enum Slot {
    Occupied(Relocation),
    Free,
}

pub struct RelocationFactory {
    slots: Vec<Slot>,
    free: Vec<u32>,
    bitclass: u32,
    endian: Endianness,
}

impl RelocationFactory {
    /// `bitclass` is the target word width in bits; only 32 and 64 are
    /// meaningful and anything else fails at `produce` time.
    pub fn new(bitclass: u32, endian: Endianness) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bitclass,
            endian,
        }
    }

    /// Allocate a relocation record, reusing a previously freed slot when
    /// one exists. `section_data` is the byte content of the fragment's
    /// section; the target word is read from it at the fragment offset.
    pub fn produce(
        &mut self,
        r_type: RelocType,
        frag: FragmentRef,
        addend: i64,
        target: RelocTarget,
        section_data: &[u8],
    ) -> Result<RelocHandle> {
        let target_word = capture_word(self.bitclass, self.endian, section_data, frag.offset)?;
        let reloc = Relocation {
            r_type,
            frag,
            addend,
            target,
            target_word,
        };
        let handle = match self.free.pop() {
            Some(index) => {
                debug_assert!(matches!(self.slots[index as usize], Slot::Free));
                self.slots[index as usize] = Slot::Occupied(reloc);
                RelocHandle(index)
            }
            None => {
                self.slots.push(Slot::Occupied(reloc));
                RelocHandle(self.slots.len() as u32 - 1)
            }
        };
        Ok(handle)
    }

    /// Return a record's slot to the free list. Destroying an already-free
    /// slot is a bug in the caller.
    pub fn destroy(&mut self, handle: RelocHandle) {
        let slot = &mut self.slots[handle.0 as usize];
        assert!(
            matches!(slot, Slot::Occupied(_)),
            "double destroy of relocation slot {}",
            handle.0
        );
        *slot = Slot::Free;
        self.free.push(handle.0);
    }

    pub fn get(&self, handle: RelocHandle) -> &Relocation {
        match &self.slots[handle.0 as usize] {
            Slot::Occupied(reloc) => reloc,
            Slot::Free => panic!("stale relocation handle {}", handle.0),
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// Read a 4- or 8-byte word at `offset`, reversing the bytes when the host
/// and target disagree on byte order. Other widths are rejected rather than
/// truncated. A location closer than a full word to the end of the section
/// is read short and zero padded; only an offset past the end is an error.
fn capture_word(bitclass: u32, endian: Endianness, data: &[u8], offset: u64) -> Result<u64> {
    let offset = offset as usize;
    if offset > data.len() {
        bail!("relocation offset {offset:#x} out of bounds");
    }
    let host_little = cfg!(target_endian = "little");
    let swap = host_little != endian.is_little_endian();
    match bitclass {
        32 => {
            let mut bytes = [0u8; 4];
            let avail = (data.len() - offset).min(4);
            bytes[..avail].copy_from_slice(&data[offset..offset + avail]);
            let word = u32::from_ne_bytes(bytes);
            Ok(u64::from(if swap { word.swap_bytes() } else { word }))
        }
        64 => {
            let mut bytes = [0u8; 8];
            let avail = (data.len() - offset).min(8);
            bytes[..avail].copy_from_slice(&data[offset..offset + avail]);
            let word = u64::from_ne_bytes(bytes);
            Ok(if swap { word.swap_bytes() } else { word })
        }
        other => Err(LinkError::UnsupportedBitClass(other).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(offset: u64) -> FragmentRef {
        FragmentRef {
            file: 0,
            section: SectionIndex(1),
            offset,
        }
    }

    fn target() -> RelocTarget {
        RelocTarget::Local { file: 0, symbol: 3 }
    }

    #[test]
    fn captures_word_in_target_order() {
        let data = [0x01u8, 0x02, 0x03, 0x04];
        let mut le = RelocationFactory::new(32, Endianness::Little);
        let h = le.produce(2, frag(0), 0, target(), &data).unwrap();
        let native = u32::from_ne_bytes(data);
        #[cfg(target_endian = "little")]
        assert_eq!(le.get(h).target_word, u64::from(native));

        // Opposite byte order: full-width reversal of the captured bytes.
        let mut be = RelocationFactory::new(32, Endianness::Big);
        let h = be.produce(2, frag(0), 0, target(), &data).unwrap();
        #[cfg(target_endian = "little")]
        assert_eq!(be.get(h).target_word, u64::from(native.swap_bytes()));
        #[cfg(target_endian = "big")]
        assert_eq!(be.get(h).target_word, u64::from(native));
    }

    #[test]
    fn captures_64_bit_words() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut factory = RelocationFactory::new(64, Endianness::Little);
        let h = factory.produce(1, frag(1), -4, target(), &data).unwrap();
        assert_eq!(
            factory.get(h).target_word,
            u64::from_le_bytes([2, 3, 4, 5, 6, 7, 8, 9])
        );
        assert_eq!(factory.get(h).addend, -4);
    }

    #[test]
    fn rejects_odd_bit_classes() {
        let mut factory = RelocationFactory::new(16, Endianness::Little);
        let err = factory
            .produce(1, frag(0), 0, target(), &[0; 8])
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkError>(),
            Some(&LinkError::UnsupportedBitClass(16))
        );
    }

    #[test]
    fn destroyed_slots_are_recycled() {
        let data = [0u8; 16];
        let mut factory = RelocationFactory::new(64, Endianness::Little);
        let a = factory.produce(1, frag(0), 0, target(), &data).unwrap();
        let b = factory.produce(1, frag(8), 0, target(), &data).unwrap();
        assert_ne!(a, b);
        factory.destroy(a);
        assert_eq!(factory.live_count(), 1);
        let c = factory.produce(2, frag(8), 0, target(), &data).unwrap();
        assert_eq!(a, c, "freed slot should be reused first");
        assert_eq!(factory.live_count(), 2);
    }

    #[test]
    #[should_panic(expected = "double destroy")]
    fn double_destroy_panics() {
        let mut factory = RelocationFactory::new(64, Endianness::Little);
        let h = factory
            .produce(1, frag(0), 0, target(), &[0u8; 8])
            .unwrap();
        factory.destroy(h);
        factory.destroy(h);
    }
}
