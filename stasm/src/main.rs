//! CLI for the STM8 assembler (spec §6 "CLI of the assembler").
//!
//! Grounded on the teacher's `vasm/src/main.rs`: the same
//! read-file/invoke-library/write-file/report-error shape, extended
//! with the target-profile flags `stasm` shares with `b1c`.

#[macro_use]
extern crate clap;

use clap::Arg;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;

use b1common::error::Diagnostic;
use b1common::settings::{MemoryModel, TargetProfile};

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
                .help("Assembly source files (object file followed by any libraries)")
                .required_unless("version")
                .multiple(true)
                .index(1),
        )
        .arg(Arg::with_name("d").short("d").help("Print error descriptions"))
        .arg(Arg::with_name("f").short("f").help("Enable PC-relative address fixing"))
        .arg(
            Arg::with_name("lib_dir")
                .short("l")
                .takes_value(true)
                .value_name("DIR")
                .help("Library root directory"),
        )
        .arg(
            Arg::with_name("mcu")
                .short("m")
                .takes_value(true)
                .value_name("NAME")
                .help("Target MCU name"),
        )
        .arg(Arg::with_name("ms").long("ms").help("Small memory model"))
        .arg(Arg::with_name("ml").long("ml").help("Large memory model"))
        .arg(Arg::with_name("mu").long("mu").help("Print memory usage"))
        .arg(
            Arg::with_name("output")
                .short("o")
                .takes_value(true)
                .value_name("OUTPUT")
                .help("Output Intel HEX file"),
        )
        .arg(
            Arg::with_name("ram_size")
                .long("ram_size")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ram_start")
                .long("ram_start")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("rom_size")
                .long("rom_size")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("rom_start")
                .long("rom_start")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("target")
                .short("t")
                .takes_value(true)
                .value_name("TARGET")
                .help("Target architecture (only STM8)"),
        )
        .arg(Arg::with_name("version").short("v").help("Print version"))
        .get_matches();

    if matches.is_present("version") {
        println!("{}", crate_version!());
        return;
    }

    let target = build_target(&matches);
    let inputs: Vec<&str> = matches.values_of("INPUT").unwrap().collect();
    let describe = matches.is_present("d");

    let mut source = String::new();
    for path in &inputs {
        match fs::read_to_string(Path::new(path)) {
            Ok(text) => {
                source.push_str(&text);
                source.push('\n');
            }
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

    if matches.is_present("mu") {
        match stasm::memory_usage(&source, &target) {
            Ok(symbols) => {
                for (name, value) in symbols {
                    println!("{} = 0x{:X}", name, value);
                }
            }
            Err(err) => report_and_exit(&err, describe),
        }
    }

    let segments = match stasm::assemble(&source, &target) {
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
    tracing::info!(path = %output_path.display(), "assembled");
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
