//! STM8 assembler pipeline (spec §4.6/§4.7).
//!
//! Grounded on the shape of the teacher's `vasm/src/lib.rs`
//! (`assemble`/`assemble_addressed`/`assemble_parsed`), adapted from a
//! single pest-driven parse-and-emit pass into the multi-pass model
//! spec §4.7 requires: parse once, then iterate layout/select/encode
//! until every statement's size is stable, producing [`ihex::Segment`]s
//! instead of a `vex::Executable`.

pub mod expr;
pub mod inst;
pub mod labels;
pub mod sections;
pub mod token;

use b1common::error::{Code, Diagnostic, Location};
use b1common::section::SectionId;
use b1common::settings::TargetProfile;
use expr::{evaluate, parse_chain, Chain};
use inst::{candidates, encode, long_branch_for, select, ArgType, SelectError};
use labels::{SymbolKind, SymbolTable};
use sections::SectionManager;
use token::{Cursor, Token};

/// One parsed operand, ahead of symbol resolution.
#[derive(Clone, Debug)]
enum Operand {
    Reg(&'static str),
    Imm(Chain),
    Direct(Chain),
    Bare(Chain),
}

#[derive(Clone, Debug)]
struct Statement {
    section: SectionId,
    label: Option<String>,
    mnemonic: Option<String>,
    operands: Vec<Operand>,
    file_id: u32,
    line: u32,
    /// Current best-guess size in bytes; revised by [`fit_sizes`] until
    /// the layout reaches a fixed point.
    size: u32,
    /// Set once a `REL` statement has overflowed and been rewritten as
    /// a long-branch sequence.
    long_branch: bool,
}

const REGISTER_NAMES: &[&str] = &["A", "X", "Y", "SP"];

fn loc(file_id: u32, line: u32) -> Location {
    Location { file_id, line }
}

fn section_for_directive(name: &str) -> Option<SectionId> {
    match name {
        "HEAP" => Some(SectionId::Heap),
        "STACK" => Some(SectionId::Stack),
        "DATA" => Some(SectionId::Data),
        "DATA0" | "PAGE0" => Some(SectionId::DataPage0),
        "INIT" | "CODEINIT" => Some(SectionId::CodeInit),
        "CONST" => Some(SectionId::Const),
        "CODE" => Some(SectionId::Code),
        _ => None,
    }
}

fn parse_operand(cursor: &mut Cursor, file_id: u32) -> Result<Operand, Diagnostic> {
    let to_diag = |e: token::LexError| {
        Diagnostic::with_message(Code::ESyntax, loc(file_id, e.line), e.message)
    };

    if let Token::Ident(name) = cursor.peek().map_err(to_diag)?.clone() {
        let upper = name.to_ascii_uppercase();
        if REGISTER_NAMES.contains(&upper.as_str()) {
            // only treat as a bare register if nothing else follows that
            // would make it part of a larger expression
            cursor.bump().map_err(to_diag)?;
            let reg = REGISTER_NAMES.iter().find(|r| **r == upper).unwrap();
            return Ok(Operand::Reg(reg));
        }
    }

    if matches!(cursor.peek().map_err(to_diag)?, Token::Punct('#')) {
        cursor.bump().map_err(to_diag)?;
        let chain = parse_chain(cursor).map_err(to_diag)?;
        return Ok(Operand::Imm(chain));
    }

    if matches!(cursor.peek().map_err(to_diag)?, Token::Punct('(')) {
        cursor.bump().map_err(to_diag)?;
        let chain = parse_chain(cursor).map_err(to_diag)?;
        match cursor.bump().map_err(to_diag)? {
            Token::Punct(')') => {}
            other => {
                return Err(Diagnostic::with_message(
                    Code::ESyntax,
                    loc(file_id, cursor.line()),
                    format!("expected ')', found {}", other),
                ))
            }
        }
        return Ok(Operand::Direct(chain));
    }

    let chain = parse_chain(cursor).map_err(to_diag)?;
    Ok(Operand::Bare(chain))
}

/// Tokenizes and groups `source` into statements, assigning each to the
/// section directive active at that point in the file (spec §4.6; the
/// default active section before any directive is `CODE`).
fn parse_program(source: &str, file_id: u32) -> Result<Vec<Statement>, Diagnostic> {
    let mut cursor = Cursor::new(source);
    let mut statements = Vec::new();
    let mut active_section = SectionId::Code;

    let to_diag =
        |e: token::LexError| Diagnostic::with_message(Code::ESyntax, loc(file_id, e.line), e.message);

    loop {
        match cursor.peek().map_err(to_diag)?.clone() {
            Token::Eof => break,
            Token::Eol => {
                cursor.bump().map_err(to_diag)?;
                continue;
            }
            Token::Directive(name) => {
                let line = cursor.line();
                cursor.bump().map_err(to_diag)?;
                match section_for_directive(&name) {
                    Some(id) => active_section = id,
                    None => {
                        return Err(Diagnostic::with_message(
                            Code::EWSecName,
                            loc(file_id, line),
                            format!("unknown section directive .{}", name),
                        ))
                    }
                }
            }
            Token::Label(name) => {
                let line = cursor.line();
                cursor.bump().map_err(to_diag)?;
                statements.push(Statement {
                    section: active_section,
                    label: Some(name),
                    mnemonic: None,
                    operands: Vec::new(),
                    file_id,
                    line,
                    size: 0,
                    long_branch: false,
                });
            }
            Token::Ident(name) => {
                let line = cursor.line();
                cursor.bump().map_err(to_diag)?;
                let mnemonic = name.to_ascii_uppercase();
                let mut operands = Vec::new();
                if !matches!(cursor.peek().map_err(to_diag)?, Token::Eol | Token::Eof) {
                    operands.push(parse_operand(&mut cursor, file_id)?);
                    while matches!(cursor.peek().map_err(to_diag)?, Token::Punct(',')) {
                        cursor.bump().map_err(to_diag)?;
                        operands.push(parse_operand(&mut cursor, file_id)?);
                    }
                }
                statements.push(Statement {
                    section: active_section,
                    label: None,
                    mnemonic: Some(mnemonic),
                    operands,
                    file_id,
                    line,
                    size: 0,
                    long_branch: false,
                });
            }
            other => {
                return Err(Diagnostic::with_message(
                    Code::ESyntax,
                    loc(file_id, cursor.line()),
                    format!("unexpected token {}", other),
                ))
            }
        }
    }
    Ok(statements)
}

/// Classifies a statement's operands into the signature string used to
/// key [`inst::build_table`] plus one chain per positional operand
/// (register operands contribute no chain and are not range-checked).
fn classify<'a>(mnemonic: &str, operands: &'a [Operand]) -> (String, Vec<&'a Chain>) {
    let mut sig_parts = Vec::new();
    let mut chains = Vec::new();
    for op in operands {
        match op {
            Operand::Reg(r) => sig_parts.push((*r).to_string()),
            Operand::Imm(c) => {
                sig_parts.push("#".to_string());
                chains.push(c);
            }
            Operand::Direct(c) => {
                sig_parts.push("(V)".to_string());
                chains.push(c);
            }
            Operand::Bare(c) => {
                // bare operands double as jump targets (REL/ADDR) and as
                // the trailing bit-index operand of BSET/BRES
                if mnemonic.starts_with('J') || mnemonic == "CALL" || mnemonic == "CALLR" {
                    sig_parts.push(if mnemonic == "JP" || mnemonic == "JPF" {
                        "ADDR".to_string()
                    } else {
                        "REL".to_string()
                    });
                } else {
                    sig_parts.push("BIT".to_string());
                }
                chains.push(c);
            }
        }
    }
    (sig_parts.join(","), chains)
}

fn resolve_operands(
    chains: &[&Chain],
    symbols: &SymbolTable,
) -> Result<Option<Vec<i64>>, String> {
    let mut out = Vec::with_capacity(chains.len());
    for chain in chains {
        match evaluate(chain, symbols) {
            Ok(v) => out.push(v),
            Err(e) if e.starts_with("unresolved symbol") => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(Some(out))
}

/// Runs the fixed-point layout loop: lay out statement addresses with
/// each statement's current `size`, resolve symbols, re-select each
/// instruction's encoding against the resolved operand values, and
/// repeat while any statement's size changed (spec §4.7 step 3).
/// Bounded by `statements.len() + 2` iterations, matching the bound an
/// address-fix pass needs: at most one statement can grow per pass
/// before the loop reaches a fixed point.
fn fit_sizes(
    statements: &mut [Statement],
    table: &[inst::Inst],
    target: &TargetProfile,
) -> Result<SymbolTable, Diagnostic> {
    // seed every instruction with the cheapest candidate's size so the
    // first layout pass has something to go on
    for stmt in statements.iter_mut() {
        if let Some(mnemonic) = &stmt.mnemonic {
            let (sig, _) = classify(mnemonic, &stmt.operands);
            let cands = candidates(table, mnemonic, &sig);
            if let Some(first) = cands.first() {
                stmt.size = first.size as u32;
            } else if stmt.mnemonic.is_some() && stmt.operands.is_empty() {
                stmt.size = 1;
            }
        }
    }

    let max_iters = statements.len() as u32 + 2;
    for _ in 0..max_iters {
        let symbols = layout_and_collect_symbols(statements, target)?;
        let mut changed = false;

        for i in 0..statements.len() {
            let mnemonic = match statements[i].mnemonic.clone() {
                Some(m) => m,
                None => continue,
            };
            let (sig, chain_refs) = classify(&mnemonic, &statements[i].operands);
            let chains: Vec<Chain> = chain_refs.into_iter().cloned().collect();
            let chain_refs: Vec<&Chain> = chains.iter().collect();
            let resolved = resolve_operands(&chain_refs, &symbols).map_err(|e| {
                Diagnostic::with_message(
                    Code::EUnresSymb,
                    loc(statements[i].file_id, statements[i].line),
                    e,
                )
            })?;
            let operands = match resolved {
                Some(v) => v,
                None => continue, // still unresolved this pass; keep current size
            };

            if mnemonic.starts_with('J') && sig == "REL" && !statements[i].long_branch {
                let this_addr = address_of(statements, i, target)?;
                let target_addr = operands[0];
                let rel = target_addr - (this_addr as i64 + 2);
                if !ArgType::REL8.is_valid_value(rel) {
                    statements[i].long_branch = true;
                    let lb = long_branch_for(&mnemonic, target.memory_model);
                    let jp_size = if target.memory_model == b1common::settings::MemoryModel::Small {
                        3
                    } else {
                        4
                    };
                    let new_size = lb.bytes_before_jp.len() as u32 + jp_size;
                    if new_size != statements[i].size {
                        statements[i].size = new_size;
                        changed = true;
                    }
                    continue;
                }
            }

            let cands = candidates(table, &mnemonic, &sig);
            match select(&cands, &operands) {
                Ok(inst) => {
                    if inst.size as u32 != statements[i].size {
                        statements[i].size = inst.size as u32;
                        changed = true;
                    }
                }
                Err(SelectError::RelOffsetOverflow) => {
                    // handled above for REL; anything else overflowing
                    // this way has no long-form fallback
                    return Err(Diagnostic::with_message(
                        Code::ERelOutRange,
                        loc(statements[i].file_id, statements[i].line),
                        format!("{} operand out of range", mnemonic),
                    ));
                }
                Err(SelectError::NoCandidate) => {
                    return Err(Diagnostic::with_message(
                        Code::EInvInst,
                        loc(statements[i].file_id, statements[i].line),
                        format!("no matching encoding for {} {}", mnemonic, sig),
                    ));
                }
            }
        }

        if !changed {
            return Ok(symbols);
        }
    }

    Err(Diagnostic::with_message(
        Code::EIntErr,
        loc(0, 0),
        "instruction layout did not converge",
    ))
}

fn address_of(statements: &[Statement], index: usize, target: &TargetProfile) -> Result<u32, Diagnostic> {
    let mut addr_by_section: std::collections::HashMap<SectionId, u32> =
        std::collections::HashMap::new();
    let mut ram_cursor = target.ram_start;
    let mut rom_cursor = target.rom_start;
    for id in SectionId::ORDER.iter() {
        if id.is_ram() {
            addr_by_section.insert(*id, ram_cursor);
            ram_cursor += section_size(statements, *id);
        } else {
            addr_by_section.insert(*id, rom_cursor);
            rom_cursor += section_size(statements, *id);
        }
    }
    let mut cursor = addr_by_section[&statements[index].section];
    for (i, stmt) in statements.iter().enumerate() {
        if stmt.section != statements[index].section {
            continue;
        }
        if i == index {
            return Ok(cursor);
        }
        cursor += stmt.size;
    }
    unreachable!("statement index must belong to its own section's statement list")
}

fn section_size(statements: &[Statement], id: SectionId) -> u32 {
    statements
        .iter()
        .filter(|s| s.section == id)
        .map(|s| s.size)
        .sum()
}

fn build_manager(statements: &[Statement]) -> SectionManager {
    let mut mgr = SectionManager::default();
    for id in SectionId::ORDER.iter() {
        let size = section_size(statements, *id);
        if size > 0 {
            mgr.section_mut(*id).statements.push(sections::SourceStatement {
                file_id: 0,
                line: 0,
                bytes: vec![0; size as usize],
            });
        }
    }
    mgr
}

/// Parses and lays out `source` without encoding it, returning the
/// `__*_START`/`__*_SIZE` symbol pairs for `-print_memory_usage`.
pub fn memory_usage(
    source: &str,
    target: &TargetProfile,
) -> Result<Vec<(String, u32)>, Diagnostic> {
    let mut statements = parse_program(source, 0)?;
    let table = inst::build_table();
    fit_sizes(&mut statements, &table, target)?;
    let mut mgr = build_manager(&statements);
    Ok(mgr.compute_addresses(target))
}

/// Computes every statement's address and every label's resolved value
/// for the current set of statement sizes, without re-selecting
/// instruction encodings.
fn layout_and_collect_symbols(
    statements: &[Statement],
    target: &TargetProfile,
) -> Result<SymbolTable, Diagnostic> {
    let mut symbols = SymbolTable::default();
    let mut ram_cursor = target.ram_start;
    let mut rom_cursor = target.rom_start;
    let mut section_bases: std::collections::HashMap<SectionId, u32> =
        std::collections::HashMap::new();

    for id in SectionId::ORDER.iter() {
        let size = section_size(statements, *id);
        let base = if id.is_ram() {
            let b = ram_cursor;
            ram_cursor += size;
            b
        } else {
            let b = rom_cursor;
            rom_cursor += size;
            b
        };
        section_bases.insert(*id, base);
        symbols.define_well_known(&format!("{}_START", id.symbol_prefix()), base);
        symbols.define_well_known(&format!("{}_SIZE", id.symbol_prefix()), size);
    }
    symbols.define_well_known("__RET_ADDR_SIZE", target.memory_model.return_addr_size());

    let mut cursors = section_bases.clone();
    for stmt in statements {
        let cur = cursors.get_mut(&stmt.section).unwrap();
        if let Some(name) = &stmt.label {
            symbols
                .define(name, *cur, SymbolKind::Label)
                .map_err(|e| Diagnostic::with_message(Code::EDupSym, loc(stmt.file_id, stmt.line), e))?;
        }
        *cur += stmt.size;
    }

    let layout = target;
    let mut section_layout = b1common::section::SectionLayout::default();
    for id in SectionId::ORDER.iter() {
        section_layout.add(*id, section_size(statements, *id));
    }
    section_layout.check_bounds(layout, Location { file_id: 0, line: 0 })?;

    Ok(symbols)
}

/// Final pass: with a stable symbol table, encode every statement and
/// concatenate by section into [`ihex::Segment`]s.
fn encode_program(
    statements: &[Statement],
    table: &[inst::Inst],
    target: &TargetProfile,
    symbols: &SymbolTable,
) -> Result<Vec<ihex::Segment>, Diagnostic> {
    let mut by_section: std::collections::HashMap<SectionId, Vec<u8>> =
        std::collections::HashMap::new();
    let mut addr = std::collections::HashMap::new();
    let mut ram_cursor = target.ram_start;
    let mut rom_cursor = target.rom_start;
    for id in SectionId::ORDER.iter() {
        if id.is_ram() {
            addr.insert(*id, ram_cursor);
            ram_cursor += section_size(statements, *id);
        } else {
            addr.insert(*id, rom_cursor);
            rom_cursor += section_size(statements, *id);
        }
    }

    let mut position: std::collections::HashMap<SectionId, u32> = addr.clone();
    for stmt in statements {
        let mnemonic = match &stmt.mnemonic {
            Some(m) => m,
            None => continue,
        };
        let (sig, chain_refs) = classify(mnemonic, &stmt.operands);
        let chains: Vec<Chain> = chain_refs.into_iter().cloned().collect();
        let chain_refs: Vec<&Chain> = chains.iter().collect();
        let operands = resolve_operands(&chain_refs, symbols)
            .map_err(|e| Diagnostic::with_message(Code::EUnresSymb, loc(stmt.file_id, stmt.line), e))?
            .ok_or_else(|| {
                Diagnostic::with_message(Code::EUnresSymb, loc(stmt.file_id, stmt.line), "unresolved symbol")
            })?;

        let bytes = if stmt.long_branch {
            let lb = long_branch_for(mnemonic, target.memory_model);
            let mut out = lb.bytes_before_jp;
            let jp_cands = candidates(table, lb.jp_mnemonic, "ADDR");
            let jp_inst = select(&jp_cands, &operands)
                .map_err(|_| Diagnostic::with_message(Code::EInvInst, loc(stmt.file_id, stmt.line), "no JP encoding"))?;
            out.extend(encode(jp_inst, &operands));
            out
        } else if mnemonic.starts_with('J') && sig == "REL" {
            let cur = *position.get(&stmt.section).unwrap();
            let rel = operands[0] - (cur as i64 + 2);
            let cands = candidates(table, mnemonic, &sig);
            let inst = select(&cands, &[rel])
                .map_err(|_| Diagnostic::with_message(Code::ERelOutRange, loc(stmt.file_id, stmt.line), "relative branch out of range"))?;
            encode(inst, &[rel])
        } else {
            let cands = candidates(table, mnemonic, &sig);
            let inst = select(&cands, &operands)
                .map_err(|_| Diagnostic::with_message(Code::EInvInst, loc(stmt.file_id, stmt.line), format!("no matching encoding for {} {}", mnemonic, sig)))?;
            encode(inst, &operands)
        };

        *position.get_mut(&stmt.section).unwrap() += bytes.len() as u32;
        by_section.entry(stmt.section).or_default().extend(bytes);
    }

    let mut segments = Vec::new();
    for (id, data) in by_section {
        if !data.is_empty() {
            segments.push(ihex::Segment {
                address: addr[&id],
                data,
            });
        }
    }
    Ok(segments)
}

/// Assembles `source` into Intel HEX segments for `target`, running the
/// full parse / fixed-point layout / encode pipeline (spec §4.6-§4.8).
pub fn assemble(source: &str, target: &TargetProfile) -> Result<Vec<ihex::Segment>, Diagnostic> {
    let mut statements = parse_program(source, 0)?;
    let table = inst::build_table();
    let symbols = fit_sizes(&mut statements, &table, target)?;
    encode_program(&statements, &table, target, &symbols)
}

#[cfg(test)]
mod test {
    use super::*;
    use b1common::settings::TargetProfile;

    fn target() -> TargetProfile {
        TargetProfile {
            ram_start: 0,
            rom_start: 0x8000,
            ..TargetProfile::default()
        }
    }

    #[test]
    fn assembles_clr_and_nop_into_a_single_code_segment() {
        let src = ".CODE\nCLR A\nNOP\n";
        let segments = assemble(src, &target()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].address, 0x8000);
        assert_eq!(segments[0].data, vec![0x4F, 0x9D]);
    }

    #[test]
    fn ld_immediate_and_ldw_direct_share_the_code_segment() {
        let src = ".CODE\nLD A, #0x10\nLDW X, #0x1234\nLDW (0x10), X\n";
        let segments = assemble(src, &target()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(
            segments[0].data,
            vec![0xA6, 0x10, 0xAE, 0x12, 0x34, 0xBF, 0x10]
        );
    }

    #[test]
    fn forward_label_reference_resolves_through_the_fixed_point_layout() {
        let src = ".CODE\nJRA target\nNOP\n:target\nNOP\n";
        let segments = assemble(src, &target()).unwrap();
        assert_eq!(segments[0].data, vec![0x20, 0x01, 0x9D, 0x9D]);
    }

    #[test]
    fn unresolved_symbol_is_a_syntax_error() {
        let src = ".CODE\nJRA missing\n";
        let err = assemble(src, &target()).unwrap_err();
        assert_eq!(err.code, Code::EUnresSymb);
    }
}
