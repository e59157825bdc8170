//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, the capability set a target
//! backend must provide: identity (machine id, bit class, byte order),
//! relocation classification for the scanner, GOT/PLT geometry, page sizes,
//! ordering of target-specific sections, and the final patching of
//! relocation values into section bytes. The backend is selected once at
//! startup and used as a trait object; the core never inspects the concrete
//! target.

use anyhow::Result;
use object::Endianness;

use crate::layout::SectionOrder;
use crate::reloc::RelocType;

pub mod x86_64;

/// Broad relocation class the scanner acts on. A class names how the
/// reference reaches the symbol, not what gets allocated; the scanner
/// combines it with the symbol's resolution and the output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocClass {
    /// No action (e.g. R_*_NONE).
    None,
    /// The absolute address of the symbol is written to the location.
    Absolute,
    /// PC-relative reference to the symbol itself.
    PcRelative,
    /// Reference through a GOT slot.
    Got,
    /// Call that may go through a PLT stub.
    Plt,
}

/// A trait representing a target architecture (e.g., x86_64, AArch64).
pub trait Architecture {
    /// The value of e_machine in the ELF header.
    fn machine(&self) -> u16;

    /// Target word width in bits (32 or 64).
    fn bitclass(&self) -> u32;

    fn endianness(&self) -> Endianness;

    /// Classify a relocation type for the scanner. Unknown types are an
    /// `InvalidRelocationType` error.
    fn classify(&self, r_type: RelocType) -> Result<RelocClass>;

    fn got_entry_size(&self) -> u64 {
        u64::from(self.bitclass()) / 8
    }

    /// Size of the PLT header stub (slot 0).
    fn plt0_size(&self) -> u64;

    fn plt_entry_size(&self) -> u64;

    /// Relocation types emitted for the dynamic loader.
    fn rel_abs(&self) -> RelocType;
    fn rel_glob_dat(&self) -> RelocType;
    fn rel_jump_slot(&self) -> RelocType;
    fn rel_copy(&self) -> RelocType;

    fn common_page_size(&self) -> u64 {
        0x1000
    }

    fn abi_page_size(&self) -> u64 {
        0x1000
    }

    /// Layout priority for a target-specific section. Sections the backend
    /// does not recognize are laid out last.
    fn target_section_order(&self, _name: &str) -> SectionOrder {
        SectionOrder::Undefined
    }

    /// Write the PLT header into `buf` (exactly `plt0_size` bytes).
    /// `plt_addr` is the header's own address, `got_addr` the base of the
    /// GOT region the header uses.
    fn write_plt0(&self, buf: &mut [u8], plt_addr: u64, got_addr: u64);

    /// Write one PLT stub. `entry_addr` is the stub's address, `got_slot`
    /// the address of its GOT slot, `index` the stub's relocation index and
    /// `plt_addr` the PLT header address the stub falls back to.
    fn write_plt_entry(
        &self,
        buf: &mut [u8],
        entry_addr: u64,
        got_slot: u64,
        index: u32,
        plt_addr: u64,
    );

    /// Applies a relocation to a buffer.
    ///
    /// # Arguments
    /// * `offset` - The offset within the buffer where the relocation should be applied.
    /// * `r_type` - The ELF relocation type.
    /// * `p` - The runtime address of the location being relocated (P).
    /// * `s` - The value of the symbol (S).
    /// * `a` - The addend (A).
    /// * `data` - The mutable buffer representing the section's data.
    fn apply_relocation(
        &self,
        offset: u64,
        r_type: RelocType,
        p: u64,
        s: u64,
        a: i64,
        data: &mut [u8],
    ) -> Result<()>;
}
