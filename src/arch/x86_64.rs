//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit x86 systems (ELF64).

use anyhow::{anyhow, Result};
use object::elf;
use object::Endianness;

use super::{Architecture, RelocClass};
use crate::error::LinkError;
use crate::layout::SectionOrder;
use crate::reloc::RelocType;

/// The x86_64 architecture backend.
pub struct X86_64;

impl Architecture for X86_64 {
    fn machine(&self) -> u16 {
        elf::EM_X86_64
    }

    fn bitclass(&self) -> u32 {
        64
    }

    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn classify(&self, r_type: RelocType) -> Result<RelocClass> {
        let class = match r_type {
            elf::R_X86_64_NONE => RelocClass::None,
            elf::R_X86_64_64
            | elf::R_X86_64_32
            | elf::R_X86_64_32S
            | elf::R_X86_64_16
            | elf::R_X86_64_8 => RelocClass::Absolute,
            elf::R_X86_64_PC64
            | elf::R_X86_64_PC32
            | elf::R_X86_64_PC16
            | elf::R_X86_64_PC8 => RelocClass::PcRelative,
            elf::R_X86_64_GOTPCREL
            | elf::R_X86_64_GOTPCRELX
            | elf::R_X86_64_REX_GOTPCRELX => RelocClass::Got,
            elf::R_X86_64_PLT32 => RelocClass::Plt,
            // Everything else (TLS models, GOT-offset and large-model
            // forms) has no apply path and must not reach the scanner.
            other => return Err(LinkError::InvalidRelocationType(other).into()),
        };
        Ok(class)
    }

    fn plt0_size(&self) -> u64 {
        16
    }

    fn plt_entry_size(&self) -> u64 {
        16
    }

    fn rel_abs(&self) -> RelocType {
        elf::R_X86_64_64
    }

    fn rel_glob_dat(&self) -> RelocType {
        elf::R_X86_64_GLOB_DAT
    }

    fn rel_jump_slot(&self) -> RelocType {
        elf::R_X86_64_JUMP_SLOT
    }

    fn rel_copy(&self) -> RelocType {
        elf::R_X86_64_COPY
    }

    fn target_section_order(&self, name: &str) -> SectionOrder {
        match name {
            ".got" => SectionOrder::RelroLast,
            ".got.plt" => SectionOrder::NonRelroFirst,
            _ => SectionOrder::Undefined,
        }
    }

    fn write_plt0(&self, buf: &mut [u8], plt_addr: u64, got_addr: u64) {
        // pushq got+8(%rip); jmpq *got+16(%rip); padding
        buf[..16].copy_from_slice(&[
            0xff, 0x35, 0, 0, 0, 0, // pushq
            0xff, 0x25, 0, 0, 0, 0, // jmpq
            0x0f, 0x1f, 0x40, 0x00, // nop
        ]);
        let push_disp = (got_addr + 8).wrapping_sub(plt_addr + 6) as u32;
        let jmp_disp = (got_addr + 16).wrapping_sub(plt_addr + 12) as u32;
        buf[2..6].copy_from_slice(&push_disp.to_le_bytes());
        buf[8..12].copy_from_slice(&jmp_disp.to_le_bytes());
    }

    fn write_plt_entry(
        &self,
        buf: &mut [u8],
        entry_addr: u64,
        got_slot: u64,
        index: u32,
        plt_addr: u64,
    ) {
        // jmpq *slot(%rip); pushq $index; jmpq plt0
        buf[..16].copy_from_slice(&[
            0xff, 0x25, 0, 0, 0, 0, // jmpq
            0x68, 0, 0, 0, 0, // pushq
            0xe9, 0, 0, 0, 0, // jmpq rel32
        ]);
        let jmp_disp = got_slot.wrapping_sub(entry_addr + 6) as u32;
        let back_disp = plt_addr.wrapping_sub(entry_addr + 16) as u32;
        buf[2..6].copy_from_slice(&jmp_disp.to_le_bytes());
        buf[7..11].copy_from_slice(&index.to_le_bytes());
        buf[12..16].copy_from_slice(&back_disp.to_le_bytes());
    }

    fn apply_relocation(
        &self,
        offset: u64,
        r_type: RelocType,
        p: u64, // Place of storage (P) - the VA where the relocation is written
        s: u64, // Symbol value, GOT slot VA, or PLT entry VA (S)
        a: i64, // Addend (A)
        data: &mut [u8],
    ) -> Result<()> {
        let abs = (s as i64).wrapping_add(a) as u64;
        let rel = (s as i64).wrapping_add(a).wrapping_sub(p as i64) as u64;
        let (value, width): (u64, usize) = match r_type {
            // S + A
            elf::R_X86_64_64 => (abs, 8),
            elf::R_X86_64_32 | elf::R_X86_64_32S => (abs, 4),
            elf::R_X86_64_16 => (abs, 2),
            elf::R_X86_64_8 => (abs, 1),
            // S + A - P
            elf::R_X86_64_PC64 => (rel, 8),
            elf::R_X86_64_PC32
            | elf::R_X86_64_PLT32
            | elf::R_X86_64_GOTPCREL
            | elf::R_X86_64_GOTPCRELX
            | elf::R_X86_64_REX_GOTPCRELX => (rel, 4),
            elf::R_X86_64_PC16 => (rel, 2),
            elf::R_X86_64_PC8 => (rel, 1),
            elf::R_X86_64_NONE => return Ok(()),
            other => return Err(LinkError::InvalidRelocationType(other).into()),
        };

        // Check the range so a bad layout fails here instead of at run
        // time. Zero-extended types accept the unsigned range on top of the
        // signed one; displacements must fit the signed range exactly.
        let signed = value as i64;
        let fits = match (r_type, width) {
            (_, 8) => true,
            (elf::R_X86_64_32, _) => value <= u64::from(u32::MAX),
            (elf::R_X86_64_16, _) => {
                signed >= i64::from(i16::MIN) && signed <= i64::from(u16::MAX)
            }
            (elf::R_X86_64_8, _) => signed >= i64::from(i8::MIN) && signed <= i64::from(u8::MAX),
            (_, 4) => signed >= i64::from(i32::MIN) && signed <= i64::from(i32::MAX),
            (_, 2) => signed >= i64::from(i16::MIN) && signed <= i64::from(i16::MAX),
            _ => signed >= i64::from(i8::MIN) && signed <= i64::from(i8::MAX),
        };
        if !fits {
            return Err(anyhow!(
                "relocation overflow at {p:#x}: {signed:#x} does not fit in {width} bytes \
                 (S={s:#x}, A={a:#x})"
            ));
        }

        let offset = offset as usize;
        if offset + width > data.len() {
            return Err(anyhow!("relocation offset out of bounds at {offset:#x}"));
        }
        data[offset..offset + width].copy_from_slice(&value.to_le_bytes()[..width]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_common_types() {
        let arch = X86_64;
        assert_eq!(arch.classify(elf::R_X86_64_64).unwrap(), RelocClass::Absolute);
        assert_eq!(arch.classify(elf::R_X86_64_PC32).unwrap(), RelocClass::PcRelative);
        assert_eq!(arch.classify(elf::R_X86_64_PLT32).unwrap(), RelocClass::Plt);
        assert_eq!(
            arch.classify(elf::R_X86_64_REX_GOTPCRELX).unwrap(),
            RelocClass::Got
        );
        let err = arch.classify(0xfff0).unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkError>(),
            Some(&LinkError::InvalidRelocationType(0xfff0))
        );
    }

    #[test]
    fn applies_absolute_and_pc_relative() {
        let arch = X86_64;
        let mut data = vec![0u8; 16];
        arch.apply_relocation(0, elf::R_X86_64_64, 0, 0x401000, 8, &mut data)
            .unwrap();
        assert_eq!(u64::from_le_bytes(data[..8].try_into().unwrap()), 0x401008);

        arch.apply_relocation(8, elf::R_X86_64_PC32, 0x402000, 0x401000, -4, &mut data)
            .unwrap();
        let disp = i32::from_le_bytes(data[8..12].try_into().unwrap());
        assert_eq!(disp, 0x401000i32 - 4 - 0x402000i32);
    }

    #[test]
    fn pc32_overflow_is_an_error() {
        let arch = X86_64;
        let mut data = vec![0u8; 4];
        assert!(arch
            .apply_relocation(0, elf::R_X86_64_PC32, 0, 0x1_0000_0000, 0, &mut data)
            .is_err());
    }

    #[test]
    fn unsigned_32_bit_values_must_fit() {
        let arch = X86_64;
        let mut data = vec![0u8; 4];
        assert!(arch
            .apply_relocation(0, elf::R_X86_64_32, 0, 0x1_0000_0000, 0, &mut data)
            .is_err());
        assert!(arch
            .apply_relocation(0, elf::R_X86_64_32, 0, 0, -1, &mut data)
            .is_err());
        arch.apply_relocation(0, elf::R_X86_64_32, 0, 0xffff_0000, 0xffff, &mut data)
            .unwrap();
        assert_eq!(u32::from_le_bytes(data[..4].try_into().unwrap()), 0xffff_ffff);
    }

    #[test]
    fn narrow_widths_patch_only_their_bytes() {
        let arch = X86_64;
        let mut data = vec![0xaa; 4];
        arch.apply_relocation(0, elf::R_X86_64_16, 0, 0x1234, 0, &mut data)
            .unwrap();
        assert_eq!(&data[..2], &0x1234u16.to_le_bytes());
        assert_eq!(data[2], 0xaa);
        arch.apply_relocation(3, elf::R_X86_64_PC8, 0x10, 0x20, -4, &mut data)
            .unwrap();
        assert_eq!(data[3] as i8, 0x20 - 4 - 0x10);
        assert!(arch
            .apply_relocation(0, elf::R_X86_64_16, 0, 0x1_0000, 0, &mut data)
            .is_err());
    }

    #[test]
    fn unhandled_types_fail_instead_of_skipping() {
        let arch = X86_64;
        let mut data = vec![0u8; 8];
        let err = arch
            .apply_relocation(0, elf::R_X86_64_GOT32, 0, 0x1000, 0, &mut data)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkError>(),
            Some(&LinkError::InvalidRelocationType(elf::R_X86_64_GOT32))
        );
        assert_eq!(data, vec![0u8; 8]);
        assert!(arch.classify(elf::R_X86_64_TPOFF32).is_err());
        assert!(arch.classify(elf::R_X86_64_PLTOFF64).is_err());
    }

    #[test]
    fn plt_stub_jumps_through_its_got_slot() {
        let arch = X86_64;
        let mut buf = vec![0u8; 16];
        arch.write_plt_entry(&mut buf, 0x401020, 0x403018, 0, 0x401000);
        assert_eq!(&buf[..2], &[0xff, 0x25]);
        let disp = u32::from_le_bytes(buf[2..6].try_into().unwrap());
        assert_eq!(disp, (0x403018u64 - (0x401020 + 6)) as u32);
    }
}
