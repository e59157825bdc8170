//! Symbol resolution.
//!
//! `SymbolPool` is the front end every input reader feeds symbol-definition
//! events into. Each event is interned; when the name already exists, a
//! detached record is built from the new definition and the `Resolver`
//! policy decides whether the existing record keeps its definition, adopts
//! the new one, warns, or aborts the link. The winning definition is always
//! written into the record at the existing stable id, so references held
//! elsewhere in the linker observe overrides for free.

use anyhow::{anyhow, Result};

use crate::diagnostics::Diagnostics;
use crate::error::LinkError;
use crate::intern::{InternTable, SymbolId};
use crate::symbol::{Binding, Desc, Source, SymbolInput, SymbolRecord};

/// What to do with a conflicting definition.
#[derive(Debug)]
enum Action {
    /// The existing definition wins; no diagnostic.
    Keep,
    /// The new definition wins; no diagnostic.
    Override,
    /// Emit a warning, then keep or override per `overridden`.
    Warn { message: String, overridden: bool },
    /// The link cannot continue.
    Abort(LinkError),
}

/// Whether a resolver warning stops the link or only gets reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningPolicy {
    Continue,
    Fatal,
}

/// Outcome of inserting one symbol-definition event.
#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    pub id: SymbolId,
    /// Whether a record with this name already existed.
    pub existed: bool,
    /// Whether the new definition became the record's definition.
    pub overridden: bool,
}

/// The GNU/ELF conflict policy:
///
/// * undefined loses to defined, silently, in either arrival order
/// * weak loses to strong, silently, in either arrival order
/// * a regular definition beats a shared-object definition
/// * two commons merge, keeping the larger size (warning if sizes differ)
/// * a real definition beats a common
/// * two strong regular definitions are a fatal multiple-definition error
struct Resolver;

impl Resolver {
    fn resolve(&self, name: &str, old: &SymbolRecord, new: &SymbolRecord) -> Action {
        // A reference never displaces a definition. Two references collapse
        // into one record, whichever arrived first.
        if new.desc == Desc::Undefined {
            if old.desc == Desc::Undefined && old.binding == Binding::Weak
                && new.binding == Binding::Global
            {
                // An undefined strong reference upgrades an undefined weak
                // one, so a later unresolved check reports it as required.
                return Action::Override;
            }
            return Action::Keep;
        }
        if old.desc == Desc::Undefined {
            return Action::Override;
        }

        // Both sides carry a definition (or common tentative definition).
        match (old.source, new.source) {
            (Source::Regular, Source::Dynamic) => return Action::Keep,
            (Source::Dynamic, Source::Regular) => return Action::Override,
            (Source::Dynamic, Source::Dynamic) => {
                // First shared object to define a name wins, unless it was
                // only a weak definition.
                if old.binding == Binding::Weak && new.binding == Binding::Global {
                    return Action::Override;
                }
                return Action::Keep;
            }
            (Source::Regular, Source::Regular) => {}
        }

        if new.binding == Binding::Weak {
            return Action::Keep;
        }
        if old.binding == Binding::Weak {
            return Action::Override;
        }

        // Two strong regular definitions.
        match (old.desc, new.desc) {
            (Desc::Common, Desc::Common) => {
                if old.size == new.size {
                    Action::Keep
                } else {
                    Action::Warn {
                        message: format!(
                            "size of common symbol `{name}' differs: {} vs {}, keeping {}",
                            old.size,
                            new.size,
                            old.size.max(new.size)
                        ),
                        overridden: new.size > old.size,
                    }
                }
            }
            (Desc::Common, _) => Action::Override,
            (_, Desc::Common) => Action::Keep,
            _ => Action::Abort(LinkError::MultipleDefinition(name.to_string())),
        }
    }
}

pub struct SymbolPool {
    table: InternTable,
    resolver: Resolver,
    warning_policy: WarningPolicy,
}

impl SymbolPool {
    pub fn new(warning_policy: WarningPolicy) -> Self {
        Self {
            table: InternTable::new(),
            resolver: Resolver,
            warning_policy,
        }
    }

    /// Reserve room for roughly `count` symbols up front.
    pub fn reserve(&mut self, count: usize) {
        self.table.rehash(count * 2);
    }

    /// Insert one symbol-definition event and resolve it against any
    /// existing record of the same name.
    pub fn insert_symbol(
        &mut self,
        input: &SymbolInput,
        diag: &mut Diagnostics,
    ) -> Result<Resolution> {
        let (id, existed) = self
            .table
            .insert_with(input.name, || SymbolRecord::from_input(input));
        if !existed {
            return Ok(Resolution {
                id,
                existed: false,
                overridden: true,
            });
        }

        let name = String::from_utf8_lossy(input.name).into_owned();
        let proposed = SymbolRecord::from_input(input);
        let old = self.table.get(id).expect("interned symbol disappeared");
        let action = self.resolver.resolve(&name, old, &proposed);
        let overridden = match action {
            Action::Keep => false,
            Action::Override => true,
            Action::Warn {
                message,
                overridden,
            } => {
                diag.warn(&message);
                if self.warning_policy == WarningPolicy::Fatal {
                    return Err(anyhow!("{message}"));
                }
                if overridden {
                    // Common merges keep the larger of the two sizes no
                    // matter which side supplies the rest of the attributes.
                    let size = old.size.max(proposed.size);
                    let record = self.table.get_mut(id).expect("interned symbol disappeared");
                    record.adopt(&proposed);
                    record.size = size;
                    return Ok(Resolution {
                        id,
                        existed: true,
                        overridden: true,
                    });
                }
                false
            }
            Action::Abort(err) => {
                diag.fatal(&err.to_string());
                return Err(err.into());
            }
        };
        if overridden {
            self.table
                .get_mut(id)
                .expect("interned symbol disappeared")
                .adopt(&proposed);
        }
        Ok(Resolution {
            id,
            existed: true,
            overridden,
        })
    }

    pub fn find(&self, name: &[u8]) -> Option<SymbolId> {
        self.table.find(name)
    }

    /// The finalized output-table entry for `name`, if emission assigned one.
    pub fn find_output_symbol(&self, name: &[u8]) -> Option<usize> {
        self.table
            .find(name)
            .and_then(|id| self.table.get(id))
            .and_then(|record| record.output_index)
    }

    pub fn get(&self, id: SymbolId) -> &SymbolRecord {
        self.table.get(id).expect("stale symbol id")
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut SymbolRecord {
        self.table.get_mut(id).expect("stale symbol id")
    }

    pub fn name(&self, id: SymbolId) -> &[u8] {
        self.table.name(id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Resolved records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &SymbolRecord)> {
        self.table.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::symbol::{SymType, SymbolValue, Visibility};

    fn input<'n>(
        name: &'n [u8],
        binding: Binding,
        desc: Desc,
        source: Source,
        size: u64,
    ) -> SymbolInput<'n> {
        SymbolInput {
            name,
            binding,
            sym_type: SymType::Object,
            visibility: Visibility::Default,
            desc,
            source,
            size,
            value: match desc {
                Desc::Undefined => SymbolValue::None,
                _ => SymbolValue::Absolute(size),
            },
        }
    }

    fn pool() -> (SymbolPool, Diagnostics) {
        (SymbolPool::new(WarningPolicy::Continue), Diagnostics::new())
    }

    #[test]
    fn defined_beats_undefined_in_either_order() {
        let (mut pool, mut diag) = pool();
        let r = pool
            .insert_symbol(&input(b"foo", Binding::Global, Desc::Undefined, Source::Regular, 0), &mut diag)
            .unwrap();
        assert!(!r.existed);
        let r = pool
            .insert_symbol(&input(b"foo", Binding::Global, Desc::Defined, Source::Regular, 8), &mut diag)
            .unwrap();
        assert!(r.existed && r.overridden);
        assert!(pool.get(r.id).is_defined());
        assert_eq!(pool.get(r.id).size, 8);

        // Reference arriving after the definition changes nothing.
        let r = pool
            .insert_symbol(&input(b"foo", Binding::Global, Desc::Undefined, Source::Regular, 0), &mut diag)
            .unwrap();
        assert!(!r.overridden);
        assert!(pool.get(r.id).is_defined());
    }

    #[test]
    fn strong_beats_weak_in_either_order() {
        let (mut pool, mut diag) = pool();
        pool.insert_symbol(&input(b"a", Binding::Weak, Desc::Defined, Source::Regular, 1), &mut diag)
            .unwrap();
        let r = pool
            .insert_symbol(&input(b"a", Binding::Global, Desc::Defined, Source::Regular, 2), &mut diag)
            .unwrap();
        assert!(r.overridden);
        assert_eq!(pool.get(r.id).binding, Binding::Global);

        pool.insert_symbol(&input(b"b", Binding::Global, Desc::Defined, Source::Regular, 1), &mut diag)
            .unwrap();
        let r = pool
            .insert_symbol(&input(b"b", Binding::Weak, Desc::Defined, Source::Regular, 2), &mut diag)
            .unwrap();
        assert!(!r.overridden);
        assert_eq!(pool.get(r.id).binding, Binding::Global);
        assert_eq!(diag.warning_count(), 0);
    }

    #[test]
    fn two_strong_regular_definitions_abort() {
        let (mut pool, mut diag) = pool();
        pool.insert_symbol(&input(b"dup", Binding::Global, Desc::Defined, Source::Regular, 4), &mut diag)
            .unwrap();
        let err = pool
            .insert_symbol(&input(b"dup", Binding::Global, Desc::Defined, Source::Regular, 4), &mut diag)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkError>(),
            Some(&LinkError::MultipleDefinition("dup".to_string()))
        );
    }

    #[test]
    fn commons_merge_to_larger_size_with_warning() {
        let (mut pool, mut diag) = pool();
        pool.insert_symbol(&input(b"c", Binding::Global, Desc::Common, Source::Regular, 16), &mut diag)
            .unwrap();
        let r = pool
            .insert_symbol(&input(b"c", Binding::Global, Desc::Common, Source::Regular, 32), &mut diag)
            .unwrap();
        assert!(r.overridden);
        assert_eq!(pool.get(r.id).size, 32);
        assert_eq!(diag.warning_count(), 1);

        // Smaller second common keeps the existing record, still warning.
        let r = pool
            .insert_symbol(&input(b"c", Binding::Global, Desc::Common, Source::Regular, 8), &mut diag)
            .unwrap();
        assert!(!r.overridden);
        assert_eq!(pool.get(r.id).size, 32);
        assert_eq!(diag.warning_count(), 2);
    }

    #[test]
    fn real_definition_beats_common() {
        let (mut pool, mut diag) = pool();
        pool.insert_symbol(&input(b"d", Binding::Global, Desc::Common, Source::Regular, 16), &mut diag)
            .unwrap();
        let r = pool
            .insert_symbol(&input(b"d", Binding::Global, Desc::Defined, Source::Regular, 4), &mut diag)
            .unwrap();
        assert!(r.overridden);
        assert!(pool.get(r.id).is_defined());
    }

    #[test]
    fn regular_beats_dynamic_regardless_of_order() {
        let (mut pool, mut diag) = pool();
        let r = pool
            .insert_symbol(&input(b"e", Binding::Global, Desc::Defined, Source::Dynamic, 1), &mut diag)
            .unwrap();
        let id = r.id;
        let r = pool
            .insert_symbol(&input(b"e", Binding::Global, Desc::Defined, Source::Regular, 2), &mut diag)
            .unwrap();
        assert!(r.overridden);
        // Same record, mutated in place, so captured ids see the override.
        assert_eq!(r.id, id);
        assert_eq!(pool.get(id).source, Source::Regular);

        pool.insert_symbol(&input(b"f", Binding::Global, Desc::Defined, Source::Regular, 2), &mut diag)
            .unwrap();
        let r = pool
            .insert_symbol(&input(b"f", Binding::Global, Desc::Defined, Source::Dynamic, 1), &mut diag)
            .unwrap();
        assert!(!r.overridden);
        assert_eq!(pool.get(r.id).source, Source::Regular);
    }

    #[test]
    fn fatal_warning_policy_stops_the_link() {
        let mut pool = SymbolPool::new(WarningPolicy::Fatal);
        let mut diag = Diagnostics::new();
        pool.insert_symbol(&input(b"c", Binding::Global, Desc::Common, Source::Regular, 16), &mut diag)
            .unwrap();
        assert!(pool
            .insert_symbol(&input(b"c", Binding::Global, Desc::Common, Source::Regular, 32), &mut diag)
            .is_err());
    }
}
