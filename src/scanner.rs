//! Relocation scanning.
//!
//! One pass over every relocation, in per-section order, deciding which
//! auxiliary entries (GOT slots, PLT stubs, dynamic relocation records, copy
//! space) the output must carry. The decision for each symbol is recorded in
//! its reservation bitmask; a bit that is already set means the entry exists
//! and the scan does nothing further for that reason, so any number of
//! relocations requesting the same reason yields exactly one slot.
//!
//! All reservations go through this module. Nothing else touches the
//! bitmask, which keeps the "allocated at most once" invariant in one place.

use anyhow::Result;

use crate::arch::{Architecture, RelocClass};
use crate::config::OutputKind;
use crate::error::LinkError;
use crate::intern::SymbolId;
use crate::reloc::{RelocTarget, Relocation};
use crate::resolver::SymbolPool;
use crate::symbol::{Binding, Desc, Reserve, SymType, SymbolValue};
use crate::tables::{CopySection, DynRelocPlace, DynRelocSection, GotSection, GotUse, PltSection};

/// The target-owned tables the scan allocates into.
#[derive(Default)]
pub struct ScanTables {
    pub got: GotSection,
    pub plt: PltSection,
    pub dynrel: DynRelocSection,
    pub copy: CopySection,
}

pub struct Scanner<'a> {
    arch: &'a dyn Architecture,
    output: OutputKind,
    pic: bool,
    /// Output section the copy region lives in; set by the linker before
    /// scanning so redirected symbols can point into it.
    copy_section: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(
        arch: &'a dyn Architecture,
        output: OutputKind,
        pic: bool,
        copy_section: usize,
    ) -> Self {
        Self {
            arch,
            output,
            pic,
            copy_section,
        }
    }

    /// Inspect one relocation and reserve whatever output entries it needs.
    pub fn scan_relocation(
        &self,
        reloc: &Relocation,
        pool: &mut SymbolPool,
        tables: &mut ScanTables,
    ) -> Result<()> {
        let class = self.arch.classify(reloc.r_type)?;

        // Partial links carry relocations into the output instead of
        // resolving them, so nothing gets reserved.
        if self.output == OutputKind::Relocatable {
            return Ok(());
        }

        // Local symbols and section references are resolved entirely at
        // link time and never need auxiliary entries.
        let RelocTarget::Pool(id) = reloc.target else {
            return Ok(());
        };
        let record = pool.get(id);
        if record.binding == Binding::Local {
            return Ok(());
        }

        let shared = self.output == OutputKind::SharedObject;
        if record.desc == Desc::Undefined && !record.is_dynamic() {
            // Weak references are allowed to stay unresolved and read as 0.
            if record.binding == Binding::Weak {
                return Ok(());
            }
            if !self.output.allows_undefined() {
                let name = String::from_utf8_lossy(pool.name(id)).into_owned();
                return Err(LinkError::UnresolvedSymbol(name).into());
            }
            // Otherwise the reference binds at load time; fall through and
            // treat it like a shared-object definition.
        }

        // Bound at run time rather than by us: definitions from shared
        // objects, symbols another link unit may preempt, and undefined
        // symbols the output kind tolerates.
        let runtime_bound = record.is_dynamic()
            || record.is_preemptible(shared)
            || (record.desc == Desc::Undefined && self.output.allows_undefined());

        match class {
            RelocClass::None => {}
            RelocClass::Got => self.reserve_got(id, runtime_bound, pool, tables),
            RelocClass::Plt => {
                if runtime_bound {
                    self.reserve_plt(id, pool, tables);
                }
                // Calls to symbols we resolve ourselves go direct.
            }
            RelocClass::Absolute | RelocClass::PcRelative => {
                if runtime_bound {
                    if record.sym_type == SymType::Func {
                        // The address of a run-time-bound function is its
                        // PLT entry, which stays stable across preemption.
                        self.reserve_plt(id, pool, tables);
                    } else if !self.pic && self.output == OutputKind::Executable {
                        self.reserve_copy(id, pool, tables);
                    } else {
                        self.reserve_dyn_rel(id, reloc, pool, tables);
                    }
                } else if self.pic && class == RelocClass::Absolute {
                    // A statically resolved address still moves with the
                    // load base, so leave a relocation for the loader.
                    self.reserve_dyn_rel(id, reloc, pool, tables);
                }
            }
        }
        Ok(())
    }

    fn reserve_got(
        &self,
        id: SymbolId,
        needs_rel: bool,
        pool: &mut SymbolPool,
        tables: &mut ScanTables,
    ) {
        if pool.get(id).reserved.has_got() {
            return;
        }
        if needs_rel {
            pool.get_mut(id).reserved |= Reserve::GOT_REL;
            let slot = tables.got.reserve(id, GotUse::GlobDat);
            tables
                .dynrel
                .reserve(self.arch.rel_glob_dat(), id, DynRelocPlace::Got(slot), 0);
            tracing::debug!(slot, "reserved GOT entry with relocation");
        } else {
            pool.get_mut(id).reserved |= Reserve::GOT;
            let slot = tables.got.reserve(id, GotUse::Static);
            tracing::debug!(slot, "reserved GOT entry");
        }
    }

    fn reserve_plt(&self, id: SymbolId, pool: &mut SymbolPool, tables: &mut ScanTables) {
        if pool.get(id).reserved.contains(Reserve::PLT) {
            return;
        }
        pool.get_mut(id).reserved |= Reserve::PLT;
        // A PLT stub implies its GOT slot and the jump-slot relocation that
        // fills it; one reservation covers all three.
        let got_slot = tables.got.reserve(id, GotUse::JumpSlot);
        let plt_slot = tables.plt.reserve(id, got_slot);
        tables.dynrel.reserve(
            self.arch.rel_jump_slot(),
            id,
            DynRelocPlace::Got(got_slot),
            0,
        );
        tracing::debug!(plt_slot, got_slot, "reserved PLT entry");
    }

    fn reserve_dyn_rel(
        &self,
        id: SymbolId,
        reloc: &Relocation,
        pool: &mut SymbolPool,
        tables: &mut ScanTables,
    ) {
        if pool.get(id).reserved.contains(Reserve::REL) {
            return;
        }
        pool.get_mut(id).reserved |= Reserve::REL;
        tables.dynrel.reserve(
            self.arch.rel_abs(),
            id,
            DynRelocPlace::Fragment(reloc.frag),
            reloc.addend,
        );
    }

    /// A data object defined in a shared object but referenced absolutely
    /// from a non-PIC executable gets copied into our writable image; the
    /// loader fills the copy, and every reference binds to it.
    fn reserve_copy(&self, id: SymbolId, pool: &mut SymbolPool, tables: &mut ScanTables) {
        if pool.get(id).reserved.contains(Reserve::REL) {
            return;
        }
        let size = pool.get(id).size.max(1);
        let align = size.min(16).next_power_of_two();
        let offset = tables.copy.reserve(id, size, align);
        tables
            .dynrel
            .reserve(self.arch.rel_copy(), id, DynRelocPlace::Copy(offset), 0);
        let record = pool.get_mut(id);
        record.reserved |= Reserve::REL;
        // Redirect the definition to the output-local copy.
        record.desc = Desc::Defined;
        record.value = SymbolValue::Output {
            section: self.copy_section,
            offset,
        };
        tracing::debug!(offset, size, "reserved copy relocation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use crate::diagnostics::Diagnostics;
    use crate::reloc::FragmentRef;
    use crate::resolver::{SymbolPool, WarningPolicy};
    use crate::symbol::{Source, SymbolInput, Visibility};
    use object::elf;
    use object::read::SectionIndex;

    fn dynamic_symbol(pool: &mut SymbolPool, name: &[u8], sym_type: SymType) -> SymbolId {
        let mut diag = Diagnostics::new();
        pool.insert_symbol(
            &SymbolInput {
                name,
                binding: Binding::Global,
                sym_type,
                visibility: Visibility::Default,
                desc: Desc::Defined,
                source: Source::Dynamic,
                size: 24,
                value: SymbolValue::None,
            },
            &mut diag,
        )
        .unwrap()
        .id
    }

    fn reloc(r_type: u32, id: SymbolId, offset: u64) -> Relocation {
        Relocation {
            r_type,
            frag: FragmentRef {
                file: 0,
                section: SectionIndex(1),
                offset,
            },
            addend: -4,
            target: RelocTarget::Pool(id),
            target_word: 0,
        }
    }

    fn exec_scanner(arch: &X86_64) -> Scanner<'_> {
        Scanner::new(arch, OutputKind::Executable, false, 0)
    }

    #[test]
    fn repeated_plt_reasons_allocate_once() {
        let arch = X86_64;
        let scanner = exec_scanner(&arch);
        let mut pool = SymbolPool::new(WarningPolicy::Continue);
        let mut tables = ScanTables::default();
        let bar = dynamic_symbol(&mut pool, b"bar", SymType::Func);

        for offset in [0x10, 0x40] {
            scanner
                .scan_relocation(&reloc(elf::R_X86_64_PLT32, bar, offset), &mut pool, &mut tables)
                .unwrap();
        }

        assert_eq!(tables.plt.len(), 1);
        assert_eq!(tables.got.len(), 1);
        assert_eq!(tables.dynrel.len(), 1);
        assert_eq!(pool.get(bar).reserved, Reserve::PLT);
    }

    #[test]
    fn got_reasons_are_idempotent_and_relocated_for_dynamic_symbols() {
        let arch = X86_64;
        let scanner = exec_scanner(&arch);
        let mut pool = SymbolPool::new(WarningPolicy::Continue);
        let mut tables = ScanTables::default();
        let id = dynamic_symbol(&mut pool, b"data", SymType::Object);

        for _ in 0..3 {
            scanner
                .scan_relocation(&reloc(elf::R_X86_64_GOTPCREL, id, 0), &mut pool, &mut tables)
                .unwrap();
        }

        assert_eq!(tables.got.len(), 1);
        assert_eq!(tables.dynrel.len(), 1);
        assert_eq!(pool.get(id).reserved, Reserve::GOT_REL);
    }

    #[test]
    fn absolute_reference_to_dynamic_data_gets_a_copy() {
        let arch = X86_64;
        let scanner = Scanner::new(&arch, OutputKind::Executable, false, 7);
        let mut pool = SymbolPool::new(WarningPolicy::Continue);
        let mut tables = ScanTables::default();
        let id = dynamic_symbol(&mut pool, b"environ", SymType::Object);

        scanner
            .scan_relocation(&reloc(elf::R_X86_64_64, id, 0), &mut pool, &mut tables)
            .unwrap();
        scanner
            .scan_relocation(&reloc(elf::R_X86_64_64, id, 8), &mut pool, &mut tables)
            .unwrap();

        assert!(!tables.copy.is_empty());
        assert_eq!(tables.dynrel.len(), 1);
        let record = pool.get(id);
        assert_eq!(record.desc, Desc::Defined);
        assert!(matches!(
            record.value,
            SymbolValue::Output { section: 7, offset: 0 }
        ));
    }

    #[test]
    fn undefined_symbol_is_fatal_only_for_executables() {
        let arch = X86_64;
        let mut pool = SymbolPool::new(WarningPolicy::Continue);
        let mut diag = Diagnostics::new();
        let id = pool
            .insert_symbol(
                &SymbolInput {
                    name: b"missing",
                    binding: Binding::Global,
                    sym_type: SymType::Func,
                    visibility: Visibility::Default,
                    desc: Desc::Undefined,
                    source: Source::Regular,
                    size: 0,
                    value: SymbolValue::None,
                },
                &mut diag,
            )
            .unwrap()
            .id;

        let mut tables = ScanTables::default();
        let err = exec_scanner(&arch)
            .scan_relocation(&reloc(elf::R_X86_64_PLT32, id, 0), &mut pool, &mut tables)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkError>(),
            Some(&LinkError::UnresolvedSymbol("missing".to_string()))
        );

        // The same reference in a shared object defers to the loader.
        let shared = Scanner::new(&arch, OutputKind::SharedObject, true, 0);
        shared
            .scan_relocation(&reloc(elf::R_X86_64_PLT32, id, 0), &mut pool, &mut tables)
            .unwrap();
        assert_eq!(tables.plt.len(), 1);
    }

    #[test]
    fn local_symbols_never_reserve() {
        let arch = X86_64;
        let scanner = exec_scanner(&arch);
        let mut pool = SymbolPool::new(WarningPolicy::Continue);
        let mut tables = ScanTables::default();
        let r = Relocation {
            r_type: elf::R_X86_64_GOTPCREL,
            frag: FragmentRef {
                file: 0,
                section: SectionIndex(1),
                offset: 0,
            },
            addend: 0,
            target: RelocTarget::Local { file: 0, symbol: 2 },
            target_word: 0,
        };
        scanner.scan_relocation(&r, &mut pool, &mut tables).unwrap();
        assert!(tables.got.is_empty());
        assert!(tables.dynrel.is_empty());
    }
}
