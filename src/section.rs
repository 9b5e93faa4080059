//! Shared section-kind model and bounds bookkeeping (spec §3 "Section",
//! §4.6 "A1 Section Manager"). Both the compiler's asm-op sections and
//! the assembler's source sections are laid out with the same fixed
//! ordering and the same RAM/ROM budget rules, so the bookkeeping lives
//! here instead of being duplicated in `b1c` and `stasm`.

use crate::error::{Code, Diagnostic, Location};
use crate::settings::{TargetProfile, PAGE0_SIZE};

/// Section kinds, processed in the fixed order HEAP -> STACK -> DATA ->
/// CODE INIT -> CONST -> CODE (spec §4.6).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SectionId {
    Heap,
    Stack,
    Data,
    DataPage0,
    CodeInit,
    Const,
    Code,
}

impl SectionId {
    /// Fixed processing order (spec §4.6).
    pub const ORDER: [SectionId; 7] = [
        SectionId::Heap,
        SectionId::Stack,
        SectionId::Data,
        SectionId::DataPage0,
        SectionId::CodeInit,
        SectionId::Const,
        SectionId::Code,
    ];

    pub fn is_ram(self) -> bool {
        matches!(
            self,
            SectionId::Heap | SectionId::Stack | SectionId::Data | SectionId::DataPage0
        )
    }

    pub fn is_rom(self) -> bool {
        !self.is_ram()
    }

    pub fn symbol_prefix(self) -> &'static str {
        match self {
            SectionId::Heap => "__HEAP",
            SectionId::Stack => "__STACK",
            SectionId::Data | SectionId::DataPage0 => "__DATA",
            SectionId::CodeInit => "__INIT",
            SectionId::Const => "__CONST",
            SectionId::Code => "__CODE",
        }
    }
}

/// Running size accumulator for one section kind, with duplicate-section
/// tracking ("multiple `CODE INIT`/`STACK`/`HEAP` sections draw warnings
/// but take the maximum of declared sizes", spec §4.6).
#[derive(Clone, Debug, Default)]
pub struct SectionSize {
    pub max_declared: u32,
    pub occurrences: u32,
    pub running_size: u32,
}

impl SectionSize {
    pub fn record_declaration(&mut self, declared: u32) {
        self.occurrences += 1;
        self.max_declared = self.max_declared.max(declared);
    }
}

/// Aggregated sizes across all section kinds for one compile/assemble
/// run, used to enforce the RAM/ROM budget and the PAGE0 cap.
#[derive(Clone, Debug, Default)]
pub struct SectionLayout {
    pub sizes: std::collections::HashMap<SectionId, SectionSize>,
}

impl SectionLayout {
    pub fn add(&mut self, id: SectionId, bytes: u32) {
        self.sizes.entry(id).or_default().running_size += bytes;
    }

    fn total(&self, ids: &[SectionId]) -> u32 {
        ids.iter()
            .filter_map(|id| self.sizes.get(id))
            .map(|s| s.running_size)
            .sum()
    }

    /// Enforces `DATA+HEAP+STACK <= RAM size`, `INIT+CONST+CODE <= ROM
    /// size`, and the 256-byte PAGE0 cap (spec §4.6). Returns the
    /// fatal [`Diagnostic`] if any bound is violated.
    pub fn check_bounds(
        &self,
        target: &TargetProfile,
        at: Location,
    ) -> Result<(), Diagnostic> {
        let ram_used = self.total(&[
            SectionId::Data,
            SectionId::DataPage0,
            SectionId::Heap,
            SectionId::Stack,
        ]);
        if ram_used > target.ram_size {
            return Err(Diagnostic::with_message(
                Code::EWSecSize,
                at,
                format!(
                    "RAM usage {} exceeds declared RAM size {}",
                    ram_used, target.ram_size
                ),
            ));
        }

        let rom_used = self.total(&[SectionId::CodeInit, SectionId::Const, SectionId::Code]);
        if rom_used > target.rom_size {
            return Err(Diagnostic::with_message(
                Code::EWSecSize,
                at,
                format!(
                    "ROM usage {} exceeds declared ROM size {}",
                    rom_used, target.rom_size
                ),
            ));
        }

        if let Some(page0) = self.sizes.get(&SectionId::DataPage0) {
            if page0.running_size > PAGE0_SIZE {
                return Err(Diagnostic::with_message(
                    Code::EWSecSize,
                    at,
                    format!(
                        "PAGE0 data section {} bytes exceeds the {}-byte page",
                        page0.running_size, PAGE0_SIZE
                    ),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::settings::TargetProfile;

    fn loc() -> Location {
        Location { file_id: 0, line: 1 }
    }

    #[test]
    fn ram_within_budget_passes() {
        let mut layout = SectionLayout::default();
        layout.add(SectionId::Data, 200);
        layout.add(SectionId::Stack, 100);
        let target = TargetProfile {
            ram_size: 1024,
            ..TargetProfile::default()
        };
        assert!(layout.check_bounds(&target, loc()).is_ok());
    }

    #[test]
    fn ram_over_budget_fails() {
        let mut layout = SectionLayout::default();
        layout.add(SectionId::Data, 900);
        layout.add(SectionId::Heap, 200);
        let target = TargetProfile {
            ram_size: 1024,
            ..TargetProfile::default()
        };
        assert!(layout.check_bounds(&target, loc()).is_err());
    }

    #[test]
    fn page0_over_256_bytes_fails() {
        let mut layout = SectionLayout::default();
        layout.add(SectionId::DataPage0, 300);
        let target = TargetProfile::default();
        assert!(layout.check_bounds(&target, loc()).is_err());
    }
}
