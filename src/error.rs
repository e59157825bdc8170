//! Fatal link errors.
//!
//! Most fallible paths use `anyhow` directly, but conditions that callers may
//! want to distinguish (for example to decide whether an undefined symbol is
//! acceptable for the current output kind) are represented by `LinkError` so
//! they can be downcast out of an `anyhow::Error`.

use std::fmt;

/// Conditions that terminate the link. Warnings (such as mismatched common
/// symbol sizes) go through the diagnostics module instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Two strong definitions of the same name from regular objects.
    MultipleDefinition(String),
    /// A relocation needs a symbol that no input defines, and the output
    /// kind does not permit undefined symbols.
    UnresolvedSymbol(String),
    /// The target reported a word width other than 32 or 64 bits.
    UnsupportedBitClass(u32),
    /// A key became unreachable after a rehash of the intern table.
    RehashInconsistency(String),
    /// A relocation type the backend does not recognize.
    InvalidRelocationType(u32),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::MultipleDefinition(name) => {
                write!(f, "multiple definition of `{name}'")
            }
            LinkError::UnresolvedSymbol(name) => {
                write!(f, "undefined reference to `{name}'")
            }
            LinkError::UnsupportedBitClass(bits) => {
                write!(f, "unsupported target bit class: {bits}")
            }
            LinkError::RehashInconsistency(name) => {
                write!(f, "symbol table lost `{name}' during rehash")
            }
            LinkError::InvalidRelocationType(r_type) => {
                write!(f, "invalid relocation type {r_type}")
            }
        }
    }
}

impl std::error::Error for LinkError {}
