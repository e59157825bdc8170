//! Symbol records.
//!
//! One `SymbolRecord` exists per distinct name for the whole link, owned by
//! the intern table. Resolution mutates the record in place, so every part of
//! the linker that captured the symbol's id observes overrides without being
//! re-resolved. The `Reserve` mask records which auxiliary output entries
//! (GOT, PLT, dynamic relocations) have already been allocated for the
//! symbol; bits are only ever added, never cleared.

use bitflags::bitflags;
use object::read::SectionIndex;

/// Linkage strength of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local,
    Global,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymType {
    NoType,
    Object,
    Func,
    Section,
    File,
    Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Internal,
    Hidden,
    Protected,
}

/// Definedness of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desc {
    Undefined,
    Defined,
    /// Unallocated data symbol; storage is assigned by the common
    /// allocation pass just before symbol indices are handed out.
    Common,
    Indirect,
}

/// Where a definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A regular relocatable object.
    Regular,
    /// A shared object; the real definition is bound at run time.
    Dynamic,
}

bitflags! {
    /// Reserved-entry mask. The numeric encoding is part of the target ABI
    /// contract and must not change:
    ///
    ///   0001  dynamic relocation entry
    ///   0010  GOT entry, content computable at link time
    ///   0100  GOT entry plus the relocation that fills it at run time
    ///   1000  PLT entry (implies its GOT slot and a jump-slot relocation)
    ///
    /// A set bit means the corresponding entry has already been allocated;
    /// the relocation scanner checks the bit before allocating so each
    /// reason yields at most one slot per symbol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Reserve: u8 {
        const REL     = 0b0001;
        const GOT     = 0b0010;
        const GOT_REL = 0b0100;
        const PLT     = 0b1000;
    }
}

impl Reserve {
    /// Whether a GOT slot already exists for this symbol, for either the
    /// static or the run-time-relocated flavor.
    pub fn has_got(self) -> bool {
        self.intersects(Reserve::GOT | Reserve::GOT_REL)
    }
}

/// The location a symbol's value resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolValue {
    /// No location yet (undefined, or defined only in a shared object).
    None,
    /// Offset into a section of an input file.
    Section {
        file: usize,
        section: SectionIndex,
        offset: u64,
    },
    /// Absolute value, independent of layout.
    Absolute(u64),
    /// Offset into an output section. Used for allocated commons and for
    /// copy-relocated symbols redirected into the copy region.
    Output { section: usize, offset: u64 },
}

/// Attributes of one symbol-definition event from an input reader.
#[derive(Debug, Clone)]
pub struct SymbolInput<'n> {
    pub name: &'n [u8],
    pub binding: Binding,
    pub sym_type: SymType,
    pub visibility: Visibility,
    pub desc: Desc,
    pub source: Source,
    pub size: u64,
    pub value: SymbolValue,
}

/// The resolved state of one name.
#[derive(Debug, Clone)]
pub struct SymbolRecord {
    pub binding: Binding,
    pub sym_type: SymType,
    pub visibility: Visibility,
    pub desc: Desc,
    pub source: Source,
    pub size: u64,
    pub value: SymbolValue,
    /// Which auxiliary entries have been allocated so far.
    pub reserved: Reserve,
    /// Index in the output symbol table, assigned once during emission.
    pub output_index: Option<usize>,
}

impl SymbolRecord {
    pub fn from_input(input: &SymbolInput) -> Self {
        Self {
            binding: input.binding,
            sym_type: input.sym_type,
            visibility: input.visibility,
            desc: input.desc,
            source: input.source,
            size: input.size,
            value: input.value,
            reserved: Reserve::empty(),
            output_index: None,
        }
    }

    /// Replace this record's definition with `new`, keeping the reservation
    /// mask and any already-assigned output index. Reservation bits describe
    /// output entries that exist regardless of which definition won.
    pub fn adopt(&mut self, new: &SymbolRecord) {
        self.binding = new.binding;
        self.sym_type = new.sym_type;
        self.visibility = new.visibility;
        self.desc = new.desc;
        self.source = new.source;
        self.size = new.size;
        self.value = new.value;
    }

    pub fn is_defined(&self) -> bool {
        matches!(self.desc, Desc::Defined)
    }

    pub fn is_common(&self) -> bool {
        matches!(self.desc, Desc::Common)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.desc, Desc::Undefined)
    }

    pub fn is_dynamic(&self) -> bool {
        self.source == Source::Dynamic
    }

    /// Whether another link unit may provide the binding-time definition,
    /// which forces indirection (GOT relocation, PLT) instead of a direct
    /// reference.
    pub fn is_preemptible(&self, shared_output: bool) -> bool {
        shared_output && self.binding != Binding::Local && self.visibility == Visibility::Default
    }
}
