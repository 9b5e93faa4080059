//! BASIC-IR-to-STM8-assembly compiler (spec §4 "Compiler pipeline").
//!
//! The pipeline is four stages, one module each: [`loader`] turns IR
//! text into a flat [`b1common::ir::Record`] stream, [`resolve`] runs
//! the three semantic-resolution passes over that stream, [`lower`]
//! walks the resolved program and emits STM8 assembly text statement by
//! statement, and [`optimize`] runs the peephole passes over that text
//! before it is handed to `stasm`.

pub mod loader;
pub mod lower;
pub mod optimize;
pub mod resolve;

use std::path::Path;

use b1common::error::Diagnostic;
use b1common::settings::OptLevel;

/// Runs the full loader → resolve → lower → optimize pipeline and
/// returns the STM8 assembly source text ready for `stasm::assemble`.
/// `lib_dir` is where `INL` library files are resolved from.
pub fn compile(
    sources: &[(String, String)],
    opt_level: OptLevel,
    lib_dir: Option<&Path>,
) -> Result<String, Diagnostic> {
    let records = loader::load_all(sources, lib_dir)?;
    let program = resolve::resolve(records, opt_level)?;
    let asm = lower::lower(&program)?;
    Ok(optimize::optimize(asm))
}
