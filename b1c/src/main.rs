//! CLI for the BASIC-IR-to-STM8 compiler (spec §6 "CLI of the compiler").
//!
//! Grounded on `vasm/src/main.rs`'s read-file/invoke-library/
//! write-file/report-error shape, shared with `stasm::main` and
//! extended with the compiler-only optimizer/target flags.

#[macro_use]
extern crate clap;

use clap::Arg;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;

use b1common::error::Diagnostic;
use b1common::settings::{MemoryModel, OptLevel, TargetProfile};
use util::EnumFromStr;

fn build_target(matches: &clap::ArgMatches) -> TargetProfile {
    let mut target = TargetProfile::default();
    if let Some(name) = matches.value_of("mcu") {
        target.mcu_name = name.to_string();
    }
    if matches.is_present("ms") {
        target.memory_model = MemoryModel::Small;
    }
    if matches.is_present("ml") {
        target.memory_model = MemoryModel::Large;
    }
    if let Some(v) = matches.value_of("ram_size") {
        target.ram_size = parse_numeric(v).unwrap_or(target.ram_size);
    }
    if let Some(v) = matches.value_of("ram_start") {
        target.ram_start = parse_numeric(v).unwrap_or(target.ram_start);
    }
    if let Some(v) = matches.value_of("rom_size") {
        target.rom_size = parse_numeric(v).unwrap_or(target.rom_size);
    }
    if let Some(v) = matches.value_of("rom_start") {
        target.rom_start = parse_numeric(v).unwrap_or(target.rom_start);
    }
    if let Some(v) = matches.value_of("ss") {
        target.stack_size = parse_numeric(v).unwrap_or(target.stack_size);
    }
    if let Some(v) = matches.value_of("hs") {
        target.heap_size = parse_numeric(v).unwrap_or(target.heap_size);
    }
    target
}

fn parse_numeric(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let matches = app_from_crate!()
        .arg(
            Arg::with_name("INPUT")
                .help("IR source files")
                .required_unless("version")
                .multiple(true)
                .index(1),
        )
        .arg(Arg::with_name("d").short("d").help("Print error descriptions"))
        .arg(Arg::with_name("fr").long("fr").help("Fix residual stack at RET"))
        .arg(Arg::with_name("hs").long("hs").takes_value(true).value_name("N"))
        .arg(
            Arg::with_name("lib_dir")
                .short("l")
                .takes_value(true)
                .value_name("DIR"),
        )
        .arg(
            Arg::with_name("mcu")
                .short("m")
                .takes_value(true)
                .value_name("NAME"),
        )
        .arg(Arg::with_name("ms").long("ms").help("Small memory model"))
        .arg(Arg::with_name("ml").long("ml").help("Large memory model"))
        .arg(Arg::with_name("mu").long("mu").help("Print memory usage"))
        .arg(Arg::with_name("na").long("na").help("Skip assembler invocation"))
        .arg(Arg::with_name("no").long("no").help("Disable optimizer"))
        .arg(
            Arg::with_name("output")
                .short("o")
                .takes_value(true)
                .value_name("OUTPUT"),
        )
        .arg(
            Arg::with_name("ol")
                .long("ol")
                .takes_value(true)
                .value_name("PATH")
                .help("Optimizer rule-usage log file"),
        )
        .arg(
            Arg::with_name("op")
                .long("op")
                .takes_value(true)
                .value_name("OPT")
                .help("EXPLICIT|BASE1|NOCHECK"),
        )
        .arg(Arg::with_name("ram_size").long("ram_size").takes_value(true))
        .arg(Arg::with_name("ram_start").long("ram_start").takes_value(true))
        .arg(Arg::with_name("rom_size").long("rom_size").takes_value(true))
        .arg(Arg::with_name("rom_start").long("rom_start").takes_value(true))
        .arg(Arg::with_name("s").short("s").help("Emit source lines as comments"))
        .arg(Arg::with_name("ss").long("ss").takes_value(true).value_name("N"))
        .arg(
            Arg::with_name("target")
                .short("t")
                .takes_value(true)
                .value_name("TARGET"),
        )
        .arg(Arg::with_name("version").short("v").help("Print version"))
        .get_matches();

    if matches.is_present("version") {
        println!("{}", crate_version!());
        return;
    }

    let target = build_target(&matches);
    let opt_level = matches
        .value_of("op")
        .and_then(|s| OptLevel::from_str(s).ok())
        .unwrap_or(OptLevel::NoCheck);
    let describe = matches.is_present("d");
    let inputs: Vec<&str> = matches.values_of("INPUT").unwrap().collect();

    let mut sources = Vec::new();
    for path in &inputs {
        match fs::read_to_string(Path::new(path)) {
            Ok(text) => sources.push((path.to_string(), text)),
            Err(err) => {
                eprintln!("reading \"{}\" failed: {}", path, err);
                exit(Diagnostic::new(
                    b1common::error::Code::EFOpen,
                    b1common::error::Location { file_id: 0, line: 0 },
                )
                .exit_code());
            }
        }
    }

    let lib_dir = matches.value_of("lib_dir").map(Path::new);
    let asm = match b1c::compile(&sources, opt_level, lib_dir) {
        Ok(asm) => asm,
        Err(err) => report_and_exit(&err, describe),
    };

    if matches.is_present("na") {
        let output_path: PathBuf = matches
            .value_of("output")
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(inputs[0]).with_extension("asm"));
        if let Err(err) = fs::write(&output_path, &asm) {
            eprintln!("writing \"{}\" failed: {}", output_path.display(), err);
            exit(
                Diagnostic::new(
                    b1common::error::Code::EFWrite,
                    b1common::error::Location { file_id: 0, line: 0 },
                )
                .exit_code(),
            );
        }
        tracing::info!(path = %output_path.display(), "wrote assembly");
        return;
    }

    let segments = match stasm::assemble(&asm, &target) {
        Ok(segments) => segments,
        Err(err) => report_and_exit(&err, describe),
    };

    let output_path: PathBuf = matches
        .value_of("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(inputs[0]).with_extension("hex"));

    if let Err(err) = ihex::write_image_file(&output_path, &segments) {
        eprintln!("writing \"{}\" failed: {}", output_path.display(), err);
        exit(
            Diagnostic::new(
                b1common::error::Code::EFWrite,
                b1common::error::Location { file_id: 0, line: 0 },
            )
            .exit_code(),
        );
    }
    tracing::info!(path = %output_path.display(), "compiled");
}

fn report_and_exit(err: &Diagnostic, describe: bool) -> ! {
    if describe {
        eprintln!("{}: {}", err.location, err.code);
        if let Some(message) = &err.message {
            eprintln!("  {}", message);
        }
    } else {
        eprintln!("{}", err);
    }
    exit(err.exit_code());
}
