//! Assembly to script-image compiler CLI.
//!
//! Reads duel-VM assembly source and writes the big-endian instruction
//! image that gets embedded in a transaction output or input.
//!
//! # Usage
//! ```text
//! asm <input.asm> [OPTIONS]
//! ```
//!
//! # Options
//! - `-o, --output <file>`: Output file path (defaults to `<input>.bin`)

use duelchain::vm::assembler::{assemble_source, encode_image, render_diagnostic};
use std::env;
use std::fs;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut output_path: Option<String> = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                i += 1;
                if i >= args.len() {
                    eprintln!("{k} requires an argument");
                    process::exit(1);
                }
                output_path = Some(args[i].clone());
                i += 1;
            }
            other => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let output_path = output_path.unwrap_or_else(|| {
        let p = Path::new(input_path);
        let stem = p.file_stem().unwrap_or_default().to_string_lossy();
        let parent = p.parent().unwrap_or(Path::new("."));
        parent
            .join(format!("{}.bin", stem))
            .to_string_lossy()
            .into_owned()
    });

    let source = match fs::read_to_string(input_path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Failed to read {}: {}", input_path, e);
            process::exit(1);
        }
    };

    let image = match assemble_source(&source) {
        Ok(words) => encode_image(&words),
        Err(e) => {
            eprint!("{}", render_diagnostic(input_path, &source, &e));
            process::exit(1);
        }
    };

    if let Err(e) = fs::write(&output_path, &image) {
        eprintln!("Failed to write output file: {}", e);
        process::exit(1);
    }

    println!(
        "Compiled {} -> {} ({} words)",
        input_path,
        output_path,
        image.len() / 2
    );
}

const USAGE: &str = "\
Duel-VM Assembler

USAGE:
    {program} <input.asm> [OPTIONS]

ARGS:
    <input.asm>    Assembly source file to compile

OPTIONS:
    -o, --output <file>    Output file path (defaults to <input>.bin)
    -h, --help             Print this help message

EXAMPLES:
    # Compile to default output name
    {program} lock.asm

    # Compile with explicit output
    {program} lock.asm -o lock.bin
";

fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
