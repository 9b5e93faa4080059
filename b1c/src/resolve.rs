//! Semantic resolution (spec §4.2): three linear passes over the loaded
//! IR that populate the variable table, the user-function table, and
//! the string-literal table before lowering begins.
//!
//! Grounded on `original_source/common/source/c1.h`'s `read_ufns`/
//! `read_and_check_locals`/`read_and_check_vars`/`process_imm_str_values`
//! pass sequence; the variable/bound/storage types themselves live in
//! `b1common::symbol` since both this crate and `stasm` share the
//! section-layout rules that consume them.

use std::collections::HashMap;

use b1common::error::{Code, Diagnostic, Location};
use b1common::ir::{Expr, Opcode, Record};
use b1common::settings::OptLevel;
use b1common::symbol::{Bound, SourceLoc, StorageKind, StringTable, Variable};

#[derive(Clone, Debug)]
pub struct UserFunction {
    pub name: String,
    pub params: Vec<(String, Option<b1common::symbol::B1Type>)>,
    pub declared_at: SourceLoc,
}

#[derive(Debug, Default)]
pub struct Program {
    pub records: Vec<(u32, Record)>,
    pub vars: HashMap<String, Variable>,
    pub ufns: HashMap<String, UserFunction>,
    pub strings: StringTable,
}

fn loc(file_id: u32, line: u32) -> Location {
    Location { file_id, line }
}

/// Pass 1 (spec §4.2 step 1): collect `DEF` signatures.
fn collect_user_functions(
    records: &[(u32, Record)],
) -> Result<HashMap<String, UserFunction>, Diagnostic> {
    let mut ufns = HashMap::new();
    for (file_id, record) in records {
        if let Record::Op {
            opcode: Opcode::Def,
            args,
            line,
        } = record
        {
            let name = args
                .first()
                .and_then(Expr::root_name)
                .ok_or_else(|| Diagnostic::with_message(Code::EInvCmdName, loc(*file_id, *line), "DEF missing a name"))?
                .to_string();
            if ufns.contains_key(&name) {
                return Err(Diagnostic::with_message(
                    Code::EUfnRedef,
                    loc(*file_id, *line),
                    format!("function {} redefined", name),
                ));
            }
            let params = args[1..]
                .iter()
                .map(|a| match a {
                    Expr::Ref { name, ty } => (name.clone(), *ty),
                    other => (other.root_name().unwrap_or("").to_string(), None),
                })
                .collect();
            ufns.insert(
                name.clone(),
                UserFunction {
                    name,
                    params,
                    declared_at: SourceLoc {
                        file_id: *file_id,
                        line: *line,
                    },
                },
            );
        }
    }
    Ok(ufns)
}

/// Pass 2 (spec §4.2 step 2): collect and type-check `LA`/`LF` locals.
fn collect_locals(
    records: &[(u32, Record)],
    vars: &mut HashMap<String, Variable>,
) -> Result<(), Diagnostic> {
    for (file_id, record) in records {
        let (opcode, args, line) = match record {
            Record::Op { opcode, args, line } => (opcode, args, *line),
            Record::Label { .. } => continue,
        };
        if *opcode != Opcode::La && *opcode != Opcode::Lf {
            continue;
        }
        let (name, ty) = match args.first() {
            Some(Expr::Ref { name, ty }) => (name.clone(), *ty),
            _ => {
                return Err(Diagnostic::with_message(
                    Code::EInvLbName,
                    loc(*file_id, line),
                    "LA/LF argument must be a typed reference",
                ))
            }
        };

        if *opcode == Opcode::La {
            if let Some(existing) = vars.get(&name) {
                if existing.storage == StorageKind::StackLocal {
                    return Err(Diagnostic::with_message(
                        Code::ELclRedef,
                        loc(*file_id, line),
                        format!("local {} redefined", name),
                    ));
                }
            }
            vars.insert(
                name.clone(),
                Variable {
                    name,
                    ty: ty.ok_or_else(|| {
                        Diagnostic::with_message(Code::EInvTypName, loc(*file_id, line), "LA requires a type")
                    })?,
                    dims: Vec::new(),
                    volatile: false,
                    is_const: false,
                    storage: StorageKind::StackLocal,
                    ga_count: 0,
                    declared_at: SourceLoc {
                        file_id: *file_id,
                        line,
                    },
                },
            );
        }
    }
    Ok(())
}

/// Returns `true` if every element of `exprs` is an `IntLit`.
fn all_literal(exprs: &[Expr]) -> bool {
    exprs.iter().all(|e| matches!(e, Expr::IntLit(_)))
}

/// Flattens the chain of `(lower,upper)` dimension groups produced by
/// the loader's `GA`/`MA` grammar into a `Bound` list, innermost group
/// (the first dimension) first.
fn collect_dims(expr: &Expr, file_id: u32, line: u32) -> Result<(String, Option<b1common::symbol::B1Type>, Vec<Bound>, bool), Diagnostic> {
    let mut groups = Vec::new();
    let mut cur = expr;
    loop {
        match cur {
            Expr::Subscript { base, indices } => {
                groups.push(indices.as_slice());
                cur = base;
            }
            _ => break,
        }
    }
    groups.reverse();

    let (name, ty) = match cur {
        Expr::Ref { name, ty } => (name.clone(), *ty),
        _ => {
            return Err(Diagnostic::with_message(
                Code::EInvLbName,
                loc(file_id, line),
                "expected a variable name",
            ))
        }
    };

    let mut all_literal_subscripts = true;
    let mut dims = Vec::with_capacity(groups.len());
    for group in groups {
        if group.len() != 2 {
            return Err(Diagnostic::with_message(
                Code::EVarDimMis,
                loc(file_id, line),
                "array bound group must be (lower,upper)",
            ));
        }
        all_literal_subscripts &= all_literal(group);
        let lower = match &group[0] {
            Expr::IntLit(n) => *n as i32,
            _ => 0,
        };
        let upper = match &group[1] {
            Expr::IntLit(n) => *n as i32,
            _ => 10,
        };
        dims.push(Bound { lower, upper });
    }

    Ok((name, ty, dims, all_literal_subscripts))
}

/// Pass 3 (spec §4.2 step 3): resolve `GA`/`MA`/`GF` into the variable
/// table, verify subscript arity on every other argument reference,
/// and intern every string literal encountered.
fn resolve_vars_and_strings(
    records: &[(u32, Record)],
    vars: &mut HashMap<String, Variable>,
    strings: &mut StringTable,
    opt_level: OptLevel,
) -> Result<(), Diagnostic> {
    for (file_id, record) in records {
        let (opcode, args, line) = match record {
            Record::Op { opcode, args, line } => (*opcode, args, *line),
            Record::Label { .. } => continue,
        };

        match opcode {
            Opcode::Ga => {
                let (name, ty, dims, all_literal_subscripts) =
                    collect_dims(&args[0], *file_id, line)?;
                let entry = vars.entry(name.clone()).or_insert_with(|| Variable {
                    name: name.clone(),
                    ty: ty.unwrap_or(b1common::symbol::B1Type::Int),
                    dims: dims.clone(),
                    volatile: false,
                    is_const: false,
                    storage: StorageKind::Global,
                    ga_count: 0,
                    declared_at: SourceLoc {
                        file_id: *file_id,
                        line,
                    },
                });
                entry.ga_count += 1;
                if !dims.is_empty() {
                    entry.dims = dims;
                }
                let explicit_option = opt_level == OptLevel::Explicit;
                entry.storage = if !entry.is_array() {
                    StorageKind::Global
                } else if entry.is_fixed_size_array(all_literal_subscripts, explicit_option) {
                    StorageKind::FixedArray
                } else {
                    StorageKind::DynamicArray
                };
            }
            Opcode::Ma => {
                let (name, ty, dims, _) = collect_dims(&args[0], *file_id, line)?;
                let addr = match args.get(1) {
                    Some(Expr::IntLit(n)) => *n as u32,
                    _ => 0,
                };
                vars.insert(
                    name.clone(),
                    Variable {
                        name,
                        ty: ty.unwrap_or(b1common::symbol::B1Type::Int),
                        dims,
                        volatile: false,
                        is_const: false,
                        storage: StorageKind::FixedAddress(addr),
                        ga_count: 0,
                        declared_at: SourceLoc {
                            file_id: *file_id,
                            line,
                        },
                    },
                );
            }
            Opcode::Gf => {
                let name = args
                    .first()
                    .and_then(Expr::root_name)
                    .ok_or_else(|| Diagnostic::with_message(Code::EInvLbName, loc(*file_id, line), "GF missing a name"))?;
                if !vars.contains_key(name) {
                    return Err(Diagnostic::with_message(
                        Code::EInvLbName,
                        loc(*file_id, line),
                        format!("GF references undeclared variable {}", name),
                    ));
                }
            }
            _ => {
                for arg in args {
                    walk_expr(arg, *file_id, line, strings, vars)?;
                }
            }
        }
    }
    Ok(())
}

/// Verifies an element-access subscript's arity matches `var`'s declared
/// dimension count, and that any literal index falls within its
/// dimension's declared bounds (spec §4.2 step 3).
fn check_subscript(var: &Variable, indices: &[Expr], file_id: u32, line: u32) -> Result<(), Diagnostic> {
    if indices.len() != var.dims.len() {
        return Err(Diagnostic::with_message(
            Code::EVarDimMis,
            loc(file_id, line),
            format!(
                "{} expects {} subscript(s), found {}",
                var.name,
                var.dims.len(),
                indices.len()
            ),
        ));
    }
    for (index, bound) in indices.iter().zip(&var.dims) {
        if let Expr::IntLit(n) = index {
            let n = *n as i32;
            if n < bound.lower || n > bound.upper {
                return Err(Diagnostic::with_message(
                    Code::ESubscriptOutOfRange,
                    loc(file_id, line),
                    format!(
                        "{} subscript {} out of range [{},{}]",
                        var.name, n, bound.lower, bound.upper
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Interns string literals and checks array-element-access subscripts
/// against their variable's declared dimensions (spec §4.2 step 3).
/// `GA`/`MA`'s own bound-group arguments never reach this walk — they are
/// consumed directly by `resolve_vars_and_strings`'s own match arms.
fn walk_expr(
    expr: &Expr,
    file_id: u32,
    line: u32,
    strings: &mut StringTable,
    vars: &HashMap<String, Variable>,
) -> Result<(), Diagnostic> {
    match expr {
        Expr::StrLit(s) => {
            strings.intern(s, file_id, line);
        }
        Expr::Subscript { base, indices } => {
            walk_expr(base, file_id, line, strings, vars)?;
            for i in indices {
                walk_expr(i, file_id, line, strings, vars)?;
            }
            if let Some(name) = base.root_name() {
                if let Some(var) = vars.get(name) {
                    if var.is_array() {
                        check_subscript(var, indices, file_id, line)?;
                    }
                }
            }
        }
        Expr::Call { args, .. } => {
            for a in args {
                walk_expr(a, file_id, line, strings, vars)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Runs all three passes and returns the fully resolved program, ready
/// for [`crate::lower`].
pub fn resolve(records: Vec<(u32, Record)>, opt_level: OptLevel) -> Result<Program, Diagnostic> {
    let ufns = collect_user_functions(&records)?;
    let mut vars = HashMap::new();
    collect_locals(&records, &mut vars)?;
    let mut strings = StringTable::default();
    resolve_vars_and_strings(&records, &mut vars, &mut strings, opt_level)?;

    Ok(Program {
        records,
        vars,
        ufns,
        strings,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::loader::load_source;

    #[test]
    fn single_ga_with_literal_subscripts_is_a_fixed_array() {
        let records: Vec<(u32, Record)> = load_source("GA V<INT>(0,1)(0,1)\n", 0)
            .unwrap()
            .into_iter()
            .map(|r| (0, r))
            .collect();
        let program = resolve(records, OptLevel::NoCheck).unwrap();
        let v = &program.vars["V"];
        assert_eq!(v.storage, StorageKind::FixedArray);
        assert_eq!(v.flat_size(), 8);
    }

    #[test]
    fn second_ga_on_same_name_makes_it_dynamic() {
        let mut records: Vec<(u32, Record)> = Vec::new();
        for r in load_source("GA V<INT>(0,1)\nGA V<INT>(0,2)\n", 0).unwrap() {
            records.push((0, r));
        }
        let program = resolve(records, OptLevel::NoCheck).unwrap();
        assert_eq!(program.vars["V"].storage, StorageKind::DynamicArray);
    }

    #[test]
    fn out_of_range_subscript_is_rejected() {
        let mut records: Vec<(u32, Record)> = Vec::new();
        for r in load_source("GA V<INT>(0,1)(0,1)\n", 0).unwrap() {
            records.push((0, r));
        }
        for r in load_source("OUT V(2,0)\n", 0).unwrap() {
            records.push((0, r));
        }
        assert_eq!(
            resolve(records, OptLevel::NoCheck).unwrap_err().code,
            Code::ESubscriptOutOfRange
        );
    }

    #[test]
    fn wrong_subscript_arity_is_rejected() {
        let mut records: Vec<(u32, Record)> = Vec::new();
        for r in load_source("GA V<INT>(0,1)(0,1)\n", 0).unwrap() {
            records.push((0, r));
        }
        for r in load_source("OUT V(0)\n", 0).unwrap() {
            records.push((0, r));
        }
        assert_eq!(
            resolve(records, OptLevel::NoCheck).unwrap_err().code,
            Code::EVarDimMis
        );
    }

    #[test]
    fn duplicate_def_is_rejected() {
        let mut records: Vec<(u32, Record)> = Vec::new();
        for r in load_source("DEF F<INT>\nDEF F<INT>\n", 0).unwrap() {
            records.push((0, r));
        }
        assert_eq!(
            resolve(records, OptLevel::NoCheck).unwrap_err().code,
            Code::EUfnRedef
        );
    }

    #[test]
    fn string_literals_intern_into_the_string_table() {
        let mut records: Vec<(u32, Record)> = Vec::new();
        for r in load_source("OUT \"hi\"\n", 0).unwrap() {
            records.push((0, r));
        }
        let program = resolve(records, OptLevel::NoCheck).unwrap();
        assert_eq!(program.strings.iter().count(), 1);
    }
}
