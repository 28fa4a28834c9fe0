//! Duelchain execution-core CLI.
//!
//! Verifies spend attempts through the isolated interpreter pool, and
//! doubles as the pool's worker executable.
//!
//! # Usage
//! ```text
//! duelchain verify <hash-hex> <output.bin> [input.bin] [OPTIONS]
//! duelchain worker
//! ```
//!
//! # Arguments
//! - `hash-hex`: 64-character hex transaction hash
//! - `output.bin`: assembled output (lock) script image
//! - `input.bin`: assembled input script image (defaults to empty)
//!
//! # Options
//! - `--workers <n>`: size of the interpreter pool (default 1)
//!
//! The `worker` subcommand is spawned by the pool itself; it reads
//! framed verification requests on stdin and answers on stdout.

use duelchain::pool::supervisor::{InterpreterPool, PoolOptions};
use duelchain::pool::worker;
use duelchain::types::hash::TxHash;
use duelchain::vm::machine::Job;
use duelchain::{error, info};
use std::env;
use std::fs;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("worker") => {
            if let Err(e) = worker::run() {
                eprintln!("worker terminated: {e}");
                process::exit(1);
            }
        }
        Some("verify") => {
            let exit = run_verify(&args[2..]);
            process::exit(exit);
        }
        Some("--help" | "-h") => {
            print_usage(&args[0]);
        }
        _ => {
            print_usage(&args[0]);
            process::exit(1);
        }
    }
}

fn run_verify(args: &[String]) -> i32 {
    let mut positional = Vec::new();
    let mut workers = 1usize;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--workers" => {
                i += 1;
                let Some(count) = args.get(i).and_then(|a| a.parse().ok()) else {
                    eprintln!("--workers requires a positive integer");
                    return 1;
                };
                workers = count;
                i += 1;
            }
            other if other.starts_with("--") => {
                eprintln!("Unexpected option: {other}");
                return 1;
            }
            _ => {
                positional.push(args[i].clone());
                i += 1;
            }
        }
    }

    if positional.len() < 2 || positional.len() > 3 {
        eprintln!("verify expects <hash-hex> <output.bin> [input.bin]");
        return 1;
    }

    let Some(hash) = TxHash::from_hex(&positional[0]) else {
        eprintln!("Invalid transaction hash: {}", positional[0]);
        return 1;
    };

    let output = match fs::read(&positional[1]) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", positional[1]);
            return 1;
        }
    };
    let input = match positional.get(2) {
        Some(path) => match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("Failed to read {path}: {e}");
                return 1;
            }
        },
        None => Vec::new(),
    };

    let job = match Job::new(hash, output, input) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("Invalid job: {e}");
            return 1;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            return 1;
        }
    };

    runtime.block_on(async move {
        let pool = match InterpreterPool::start(PoolOptions {
            workers,
            ..PoolOptions::default()
        })
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                error!("failed to start pool: {e}");
                return 1;
            }
        };
        info!("verifying spend across {workers} worker(s)");

        let exit = match pool.submit(job).await {
            Ok(verdict) => {
                if let Some(reason) = &verdict.error {
                    error!("verification error: {reason}");
                }
                println!("{}", if verdict.result { "valid" } else { "invalid" });
                if verdict.result { 0 } else { 1 }
            }
            Err(e) => {
                error!("pool error: {e}");
                1
            }
        };
        pool.shutdown().await;
        exit
    })
}

const USAGE: &str = "\
Duelchain Execution Core

USAGE:
    {program} verify <hash-hex> <output.bin> [input.bin] [OPTIONS]
    {program} worker

ARGS:
    <hash-hex>      64-character hex transaction hash
    <output.bin>    assembled output (lock) script image
    [input.bin]     assembled input script image (defaults to empty)

OPTIONS:
    --workers <n>   Size of the interpreter pool (default 1)
    -h, --help      Print this help message

SUBCOMMANDS:
    verify    Run one spend verification through the pool
    worker    Internal: interpreter worker loop on stdin/stdout

EXAMPLES:
    # Verify a spend with no input script
    {program} verify $(printf '00%.0s' {1..32}) lock.bin

    # Duel a lock script against an input script, four workers
    {program} verify <hash> lock.bin key.bin --workers 4
";

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
