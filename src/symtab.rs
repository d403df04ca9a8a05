//! Logical symbol table with cross-input resolution (C4).
//!
//! Builds a `name -> resolved definition` map across every input object,
//! applying the tie-break rules of spec §4.4, then checks that every
//! undefined reference resolves to exactly one definition.

use std::collections::HashMap;

use crate::arena::Arena;
use crate::error::{Error, ErrorContext, ErrorSink, Result};
use crate::format::symbol::{SymbolBinding, SymbolKind, SymbolRecord};
use crate::here;

/// A symbol definition as known to the link driver: which input object
/// it came from and the symbol's local section index within that
/// input, needed later to compute the symbol's final address once
/// section layout has run (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub name: String,
    pub record: SymbolRecord,
    pub input_index: usize,
    pub local_section_index: u16,
}

#[derive(Debug)]
pub struct SymbolTable {
    entries: HashMap<String, Definition>,
    /// Local-bound definitions, scoped per `(input_index, name)` so that
    /// two inputs defining the same-named local (e.g. two translation
    /// units each with a `static` of the same name) never collide —
    /// unlike Global/Weak symbols, locals are never visible outside
    /// their own input (spec §4.4).
    locals: HashMap<(usize, String), Definition>,
    /// Backs every interned symbol name (spec §3/§5: record storage
    /// goes through the arena); each staged name is copied into its
    /// owning `Definition`/map key immediately.
    arena: Arena,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            locals: HashMap::new(),
            arena: Arena::scratch(),
        }
    }

    fn stage_name(&mut self, name: &str) -> Result<String> {
        let bytes = name.as_bytes();
        let mut staged = self.arena.alloc_growing(bytes.len(), 1)?;
        staged.copy_from_slice(bytes);
        String::from_utf8(staged)
            .map_err(|e| Error::InvalidArgument(format!("symbol name is not valid utf-8: {e}")))
    }

    /// Ingest one symbol from input `input_index`. Section symbols
    /// (`SymbolKind::Section`) are scoped to their originating input
    /// and never participate in duplicate detection (spec §4.4 rule 5).
    /// Local-bound symbols are likewise scoped per input rather than
    /// merged into the cross-input resolution map.
    pub fn ingest(&mut self, name: &str, record: SymbolRecord, input_index: usize) -> Result<()> {
        if record.kind == SymbolKind::Section {
            return Ok(());
        }
        if name.is_empty() {
            return Ok(());
        }

        let staged_name = self.stage_name(name)?;

        if record.binding == SymbolBinding::Local {
            let incoming = Definition {
                name: staged_name.clone(),
                record,
                input_index,
                local_section_index: record.section_index,
            };
            self.locals.insert((input_index, staged_name), incoming);
            return Ok(());
        }

        let incoming = Definition {
            name: staged_name.clone(),
            record,
            input_index,
            local_section_index: record.section_index,
        };

        match self.entries.get(&staged_name) {
            None => {
                self.entries.insert(staged_name, incoming);
                Ok(())
            }
            Some(existing) => {
                let resolved = resolve_pair(existing, &incoming, &staged_name)?;
                self.entries.insert(staged_name, resolved);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Definition> {
        self.entries.get(name)
    }

    /// Look up a local-bound definition by the input it came from and
    /// its name. Locals from different inputs never shadow each other.
    pub fn get_local(&self, input_index: usize, name: &str) -> Option<&Definition> {
        self.locals.get(&(input_index, name.to_string()))
    }

    pub fn iter_locals(&self) -> impl Iterator<Item = &Definition> {
        self.locals.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Definition)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolution pass (spec §4.4): every reference to an undefined
    /// symbol must resolve to exactly one definition. Every failure is
    /// reported to `sink` rather than stopping at the first (spec §7)
    /// and a single aggregate error is returned if any were found.
    pub fn resolve(&self, references: &[String], sink: &mut dyn ErrorSink) -> Result<()> {
        let mut failures = Vec::new();
        for name in references {
            match self.entries.get(name) {
                Some(def) if def.record.section_index != crate::format::symbol::UNDEFINED_SECTION => {}
                _ => {
                    let err = Error::SymbolNotFound(name.clone());
                    let ctx = ErrorContext::new(err.clone(), format!("undefined reference to `{name}`"), here!());
                    sink.report(ctx);
                    failures.push(err);
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Unresolved(failures))
        }
    }
}

/// Apply the tie-break table of spec §4.4 to two definitions of the
/// same name.
fn resolve_pair(a: &Definition, b: &Definition, name: &str) -> Result<Definition> {
    let a_defined = a.record.section_index != crate::format::symbol::UNDEFINED_SECTION;
    let b_defined = b.record.section_index != crate::format::symbol::UNDEFINED_SECTION;

    match (a.record.binding, b.record.binding) {
        (SymbolBinding::Global, SymbolBinding::Global) if a_defined && b_defined => {
            Err(Error::DuplicateSymbol(name.to_string()))
        }
        (SymbolBinding::Global, SymbolBinding::Weak) => Ok(a.clone()),
        (SymbolBinding::Weak, SymbolBinding::Global) => Ok(b.clone()),
        (SymbolBinding::Weak, SymbolBinding::Weak) => {
            // First seen wins; `a` is always the incumbent here.
            if a_defined || !b_defined {
                Ok(a.clone())
            } else {
                Ok(b.clone())
            }
        }
        _ => {
            // undefined vs defined: defined wins, in either position.
            // Locals never reach this table (scoped per-input in
            // `ingest`), so the only remaining binding pair here is
            // Global/Global with at least one side undefined.
            if !a_defined && b_defined {
                Ok(b.clone())
            } else if a_defined && !b_defined {
                Ok(a.clone())
            } else {
                // Both undefined — keep the incumbent.
                Ok(a.clone())
            }
        }
    }
}
