//! Assembler symbol table (spec §4.6 "well-known addresses").
//!
//! Grounded on the teacher's `vasm/src/labels.rs` (`LabelMap` plus a
//! shared `:label` prefix handler); extended with the fixed set of
//! `__*_START`/`__*_SIZE` symbols the section manager injects once
//! layout is known.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymbolKind {
    /// A user-defined `:label`.
    Label,
    /// A well-known `__*_START`/`__*_SIZE` symbol injected by the
    /// section manager.
    WellKnown,
}

#[derive(Clone, Debug)]
pub struct Symbol {
    pub value: u32,
    pub kind: SymbolKind,
}

#[derive(Default, Debug)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
}

impl SymbolTable {
    pub fn define(&mut self, name: &str, value: u32, kind: SymbolKind) -> Result<(), String> {
        if let Some(existing) = self.symbols.get(name) {
            if existing.kind != SymbolKind::WellKnown || kind != SymbolKind::WellKnown {
                return Err(format!("duplicate symbol definition: {}", name));
            }
        }
        self.symbols.insert(name.to_string(), Symbol { value, kind });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.symbols.get(name).map(|s| s.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    /// Injects the fixed set of well-known section addresses (spec
    /// §4.6): `__DATA_START`, `__STACK_START`, `__HEAP_START`,
    /// `__CONST_START`, `__CODE_START`, `__INIT_START`, their `_SIZE`
    /// siblings, and `__RET_ADDR_SIZE`.
    pub fn define_well_known(&mut self, name: &str, value: u32) {
        // well-known symbols are recomputed every layout pass; silently
        // overwrite rather than erroring on "redefinition".
        self.symbols.insert(
            name.to_string(),
            Symbol {
                value,
                kind: SymbolKind::WellKnown,
            },
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_user_label_is_rejected() {
        let mut table = SymbolTable::default();
        table.define("loop", 0x100, SymbolKind::Label).unwrap();
        assert!(table.define("loop", 0x200, SymbolKind::Label).is_err());
    }

    #[test]
    fn well_known_symbols_can_be_recomputed() {
        let mut table = SymbolTable::default();
        table.define_well_known("__DATA_START", 0x0000);
        table.define_well_known("__DATA_START", 0x0010);
        assert_eq!(table.get("__DATA_START"), Some(0x0010));
    }
}
