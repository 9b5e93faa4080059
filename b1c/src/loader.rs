//! IR loader (spec §4.1).
//!
//! Grounded on `original_source/common/source/c1.h`'s `Load`/
//! `load_next_command` streaming-parse shape (no backtracking, one
//! `B1_ASM_OP`-equivalent [`Record`] produced per source line) and on
//! `vasm/src/lib.rs`'s top-level `assemble`/`parse` pipeline entry
//! points, adapted to a text IR grammar instead of a `pest` grammar
//! file.
//!
//! Grammar: each non-blank, non-comment line is either a label (`:name`)
//! or `OPCODE arg[, arg]*`. An argument is `name[<TYPE>][(args)]*` — a
//! named reference optionally annotated with a type and followed by one
//! or more parenthesized groups, each one more level of [`Expr::Subscript`]
//! nesting. This single grammar serves both array-bounds declarations
//! (`GA V<INT>(0,1)(0,1)`, one group per dimension) and ordinary element
//! access/call argument lists (`V(i,j)`, one group of all indices);
//! [`crate::resolve`] disambiguates by opcode and by whether the base
//! name denotes a declared user function.
//!
//! `ASM`/`ENDASM` are loader-level block delimiters rather than ordinary
//! opcodes: [`load_source`] gathers every raw line between them verbatim
//! into a single [`Record::Op`] carrying an [`Expr::StrLit`] body, since
//! the lines inside an inline-asm block are not IR syntax and must not be
//! run through [`parse_primary`].
//!
//! `NS`/`INL` are resolved here too, by [`load_all`]: `NS <id>` switches
//! the namespace that subsequent `::name` references rewrite against, and
//! `INL "libname"` recursively loads a library file from `lib_dir` under a
//! fresh temporary namespace, restoring the includer's namespace on
//! return. `load_all` tracks the set of files currently open and raises
//! [`Code::ERecurInl`] on reentry, so this module — not [`crate::resolve`]
//! — owns the open-file recursion guard.

use std::path::{Path, PathBuf};

use b1common::error::{Code, Diagnostic, Location};
use b1common::ir::{Expr, Opcode, Record};
use b1common::symbol::B1Type;
use util::EnumFromStr;

struct LineCursor<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
}

impl<'a> LineCursor<'a> {
    fn new(src: &'a str) -> Self {
        LineCursor {
            chars: src.char_indices().peekable(),
            src,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn pos(&mut self) -> usize {
        self.chars.peek().map(|(i, _)| *i).unwrap_or(self.src.len())
    }
}

fn syntax_err(file_id: u32, line: u32, message: impl Into<String>) -> Diagnostic {
    Diagnostic::with_message(Code::ESyntax, Location { file_id, line }, message)
}

/// Splits `text` at top-level commas (not inside `(...)` or `<...>`).
fn split_top_level_commas(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth_paren = 0i32;
    let mut depth_angle = 0i32;
    let mut start = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth_paren += 1,
            ')' => depth_paren -= 1,
            '<' => depth_angle += 1,
            '>' => depth_angle -= 1,
            ',' if depth_paren == 0 && depth_angle == 0 => {
                out.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() || !out.is_empty() {
        out.push(tail);
    }
    out
}

/// Finds the index (byte offset, relative to `text`) of the `)` that
/// closes the `(` at `text[0..]`'s first byte.
fn find_matching_paren(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_primary(text: &str, file_id: u32, line: u32) -> Result<Expr, Diagnostic> {
    let text = text.trim();
    if text.is_empty() {
        return Err(syntax_err(file_id, line, "expected an argument, found nothing"));
    }
    if let Some(stripped) = text.strip_prefix('"') {
        let inner = stripped.strip_suffix('"').ok_or_else(|| {
            syntax_err(file_id, line, format!("unterminated string literal: {}", text))
        })?;
        return Ok(Expr::StrLit(inner.replace("\\n", "\n").replace("\\t", "\t")));
    }
    if text.starts_with(|c: char| c.is_ascii_digit()) || text.starts_with('-') {
        if let Ok(n) = parse_int_literal(text) {
            return Ok(Expr::IntLit(n));
        }
    }

    // name[<TYPE>] followed by zero or more chained (group) subscripts
    let name_end = text
        .find(|c: char| c == '<' || c == '(')
        .unwrap_or(text.len());
    let name = &text[..name_end];
    if name.is_empty() || !name.chars().next().unwrap().is_alphabetic() && !name.starts_with("::") {
        return Err(syntax_err(file_id, line, format!("invalid argument: {}", text)));
    }
    let mut rest = &text[name_end..];

    let mut ty = None;
    if let Some(stripped) = rest.strip_prefix('<') {
        let close = stripped
            .find('>')
            .ok_or_else(|| syntax_err(file_id, line, format!("unterminated type annotation: {}", text)))?;
        let ty_name = &stripped[..close];
        ty = Some(B1Type::from_str(ty_name).map_err(|_| {
            syntax_err(file_id, line, format!("unknown type name: {}", ty_name))
        })?);
        rest = &stripped[close + 1..];
    }

    let mut expr = Expr::Ref {
        name: name.to_string(),
        ty,
    };

    while rest.starts_with('(') {
        let close = find_matching_paren(rest)
            .ok_or_else(|| syntax_err(file_id, line, format!("unbalanced parentheses: {}", text)))?;
        let inner = &rest[1..close];
        let mut indices = Vec::new();
        if !inner.trim().is_empty() {
            for part in split_top_level_commas(inner) {
                indices.push(parse_primary(part, file_id, line)?);
            }
        }
        expr = Expr::Subscript {
            base: Box::new(expr),
            indices,
        };
        rest = &rest[close + 1..];
    }

    Ok(expr)
}

fn parse_int_literal(text: &str) -> Result<i64, std::num::ParseIntError> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16);
    }
    if let Some(neg) = text.strip_prefix("-0x").or_else(|| text.strip_prefix("-0X")) {
        return i64::from_str_radix(neg, 16).map(|v| -v);
    }
    text.parse()
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(i) => &line[..i],
        None => line,
    }
}

/// Parses one source file's text into a flat [`Record`] list. `ASM`
/// blocks are captured whole: every raw line up to (but not including)
/// the matching `ENDASM` becomes a single `Opcode::Asm` record carrying
/// an `Expr::StrLit` of the verbatim body, joined with `\n`.
pub fn load_source(text: &str, file_id: u32) -> Result<Vec<Record>, Diagnostic> {
    let mut records = Vec::new();
    let mut lines = text.lines().enumerate();
    while let Some((idx, raw_line)) = lines.next() {
        let line_no = idx as u32 + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(label) = line.strip_prefix(':') {
            records.push(Record::Label {
                name: label.trim().to_string(),
                line: line_no,
            });
            continue;
        }

        let mut cursor = LineCursor::new(line);
        cursor.skip_ws();
        let mnemonic_start = cursor.pos();
        while matches!(cursor.peek(), Some(c) if !c.is_whitespace()) {
            cursor.chars.next();
        }
        let mnemonic_end = cursor.pos();
        let mnemonic = &line[mnemonic_start..mnemonic_end];

        if mnemonic == "ASM" {
            let start_line = line_no;
            let mut body = Vec::new();
            loop {
                match lines.next() {
                    Some((_, braw)) => {
                        if strip_comment(braw).trim() == "ENDASM" {
                            break;
                        }
                        body.push(braw.to_string());
                    }
                    None => {
                        return Err(syntax_err(file_id, start_line, "ASM block missing ENDASM"))
                    }
                }
            }
            records.push(Record::Op {
                opcode: Opcode::Asm,
                args: vec![Expr::StrLit(body.join("\n"))],
                line: start_line,
            });
            continue;
        }

        let opcode = Opcode::from_str(mnemonic)
            .map_err(|_| syntax_err(file_id, line_no, format!("unknown instruction: {}", mnemonic)))?;

        let arg_text = line[mnemonic_end..].trim();
        let mut args = Vec::new();
        if !arg_text.is_empty() {
            for part in split_top_level_commas(arg_text) {
                args.push(parse_primary(part, file_id, line_no)?);
            }
        }

        records.push(Record::Op {
            opcode,
            args,
            line: line_no,
        });
    }
    Ok(records)
}

/// Rewrites every `::name` reference reachable from `expr` to
/// `{ns}::name` in place (spec §4.1). A no-op when `ns` is empty, which
/// leaves the `::name` spelling as-is — the same outcome as prefixing it
/// with an empty namespace.
fn rewrite_namespace(expr: &mut Expr, ns: &str) {
    match expr {
        Expr::Ref { name, .. } => {
            if let Some(rest) = name.strip_prefix("::") {
                *name = format!("{}::{}", ns, rest);
            }
        }
        Expr::Subscript { base, indices } => {
            rewrite_namespace(base, ns);
            for index in indices {
                rewrite_namespace(index, ns);
            }
        }
        Expr::Call { args, .. } => {
            for arg in args {
                rewrite_namespace(arg, ns);
            }
        }
        Expr::IntLit(_) | Expr::StrLit(_) => {}
    }
}

/// Resolves an `INL` library name to a file under `lib_dir`, trying the
/// name verbatim first and then with a `.b1i` extension.
fn resolve_library_path(lib_name: &str, lib_dir: Option<&Path>) -> Option<PathBuf> {
    let base = lib_dir.unwrap_or_else(|| Path::new("."));
    let candidate = base.join(lib_name);
    if candidate.is_file() {
        return Some(candidate);
    }
    let with_ext = base.join(format!("{}.b1i", lib_name));
    if with_ext.is_file() {
        return Some(with_ext);
    }
    None
}

/// Threaded state for [`load_all`]'s recursive `INL` expansion: the next
/// fresh `file_id` to hand out, the files currently open (the recursion
/// guard), and a counter for generating fresh temporary namespace names.
struct LoadState {
    next_file_id: u32,
    open_files: Vec<PathBuf>,
    next_temp_ns: u32,
}

/// Loads `text` (already read from `file_id`), expanding `INL` and
/// applying `NS`-driven `::name` rewriting, appending every resulting
/// record to `out`. `current_ns` is this file's own namespace state; an
/// `INL`'d file gets its own fresh copy and cannot leak namespace changes
/// back to its includer, matching spec §4.1's save/restore semantics.
fn load_file(
    text: &str,
    file_id: u32,
    mut current_ns: String,
    lib_dir: Option<&Path>,
    state: &mut LoadState,
    out: &mut Vec<(u32, Record)>,
) -> Result<(), Diagnostic> {
    for record in load_source(text, file_id)? {
        match record {
            Record::Op {
                opcode: Opcode::Ns,
                args,
                ..
            } => {
                if let Some(name) = args.first().and_then(Expr::root_name) {
                    current_ns = name.to_string();
                }
            }
            Record::Op {
                opcode: Opcode::Inl,
                args,
                line,
            } => {
                let lib_name = match args.first() {
                    Some(Expr::StrLit(s)) => s.clone(),
                    Some(expr) => expr.root_name().unwrap_or_default().to_string(),
                    None => {
                        return Err(syntax_err(file_id, line, "INL requires a library name"))
                    }
                };
                let path = resolve_library_path(&lib_name, lib_dir).ok_or_else(|| {
                    Diagnostic::with_message(
                        Code::EFOpen,
                        Location { file_id, line },
                        format!("library not found: {}", lib_name),
                    )
                })?;
                if state.open_files.contains(&path) {
                    return Err(Diagnostic::with_message(
                        Code::ERecurInl,
                        Location { file_id, line },
                        format!("recursive INL of {}", lib_name),
                    ));
                }
                let inc_text = std::fs::read_to_string(&path).map_err(|_| {
                    Diagnostic::with_message(
                        Code::EFOpen,
                        Location { file_id, line },
                        format!("failed to read {}", path.display()),
                    )
                })?;
                let inc_file_id = state.next_file_id;
                state.next_file_id += 1;
                let temp_ns = format!("__inl_{}", state.next_temp_ns);
                state.next_temp_ns += 1;
                state.open_files.push(path.clone());
                load_file(&inc_text, inc_file_id, temp_ns, lib_dir, state, out)?;
                state.open_files.pop();
            }
            Record::Op {
                opcode,
                mut args,
                line,
            } => {
                for arg in &mut args {
                    rewrite_namespace(arg, &current_ns);
                }
                out.push((file_id, Record::Op { opcode, args, line }));
            }
            Record::Label { name, line } => {
                out.push((file_id, Record::Label { name, line }));
            }
        }
    }
    Ok(())
}

/// Loads every file in `sources` in order, returning one flat record
/// stream paired with the `file_id` it came from (spec §4.1). Expands
/// `INL` recursively against `lib_dir`, guarding against reentrant
/// inclusion, and rewrites `::name` references against the namespace
/// most recently switched to by `NS`.
pub fn load_all(
    sources: &[(String, String)],
    lib_dir: Option<&Path>,
) -> Result<Vec<(u32, Record)>, Diagnostic> {
    let mut state = LoadState {
        next_file_id: sources.len() as u32,
        open_files: Vec::new(),
        next_temp_ns: 0,
    };
    let mut all = Vec::new();
    for (file_id, (name, text)) in sources.iter().enumerate() {
        let path = PathBuf::from(name);
        state.open_files.push(path.clone());
        load_file(text, file_id as u32, String::new(), lib_dir, &mut state, &mut all)?;
        state.open_files.pop();
    }
    Ok(all)
}

#[cfg(test)]
mod test {
    use super::*;
    use b1common::ir::Opcode;

    #[test]
    fn label_line_becomes_a_label_record() {
        let records = load_source(":loop\nNOP\n", 0).unwrap();
        assert!(matches!(&records[0], Record::Label { name, .. } if name == "loop"));
    }

    #[test]
    fn ga_with_two_chained_dimension_groups_parses_as_nested_subscript() {
        let records = load_source("GA V<INT>(0,1)(0,1)\n", 0).unwrap();
        match &records[0] {
            Record::Op { opcode, args, .. } => {
                assert_eq!(*opcode, Opcode::Ga);
                match &args[0] {
                    Expr::Subscript { base, indices } => {
                        assert_eq!(indices.len(), 2);
                        assert!(matches!(**base, Expr::Subscript { .. }));
                    }
                    other => panic!("expected nested subscript, got {:?}", other),
                }
            }
            other => panic!("expected an Op record, got {:?}", other),
        }
    }

    #[test]
    fn arithmetic_opcode_parses_with_three_operands() {
        let records = load_source("+ R<INT>, A<INT>, B<INT>\n", 0).unwrap();
        match &records[0] {
            Record::Op { opcode, args, .. } => {
                assert_eq!(*opcode, Opcode::BinOp(b1common::ir::BinOp::Add));
                assert_eq!(args.len(), 3);
            }
            other => panic!("expected an Op record, got {:?}", other),
        }
    }

    #[test]
    fn unknown_mnemonic_is_a_syntax_error() {
        let err = load_source("FROBNICATE A\n", 0).unwrap_err();
        assert_eq!(err.code, Code::ESyntax);
    }

    #[test]
    fn comment_only_and_blank_lines_are_skipped() {
        let records = load_source("; just a comment\n\nNOP\n", 0).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn asm_block_is_captured_as_one_verbatim_record() {
        let records = load_source("ASM\nLD A, #1\nNOP\nENDASM\n", 0).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Op { opcode, args, .. } => {
                assert_eq!(*opcode, Opcode::Asm);
                assert_eq!(args[0], Expr::StrLit("LD A, #1\nNOP".to_string()));
            }
            other => panic!("expected an Op record, got {:?}", other),
        }
    }

    #[test]
    fn ns_switch_rewrites_double_colon_prefixed_names() {
        let sources = vec![("main.b1c".to_string(), "NS foo\n= ::X<INT>, 1\n".to_string())];
        let records = load_all(&sources, None).unwrap();
        let (_, record) = records
            .iter()
            .find(|(_, r)| matches!(r, Record::Op { opcode: Opcode::Assign, .. }))
            .unwrap();
        if let Record::Op { args, .. } = record {
            assert_eq!(args[0].root_name(), Some("foo::X"));
        }
    }

    #[test]
    fn inl_self_reference_is_a_recursive_include_error() {
        let dir = std::env::temp_dir().join(format!("b1c_loader_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let lib_path = dir.join("selfref.b1i");
        std::fs::write(&lib_path, "INL \"selfref.b1i\"\n").unwrap();

        let sources = vec![("main.b1c".to_string(), "INL \"selfref.b1i\"\n".to_string())];
        let err = load_all(&sources, Some(dir.as_path())).unwrap_err();
        assert_eq!(err.code, Code::ERecurInl);

        std::fs::remove_dir_all(&dir).ok();
    }
}
