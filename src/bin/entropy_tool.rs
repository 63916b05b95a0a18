//! Operator tool for the deterministic entropy stream.
//!
//! The service never extends the stream on its own; when a session runs
//! dry (`EntropyExhausted`), an operator runs `extend` here. `check`
//! validates stream shape and `audit` verifies a changelog never reuses
//! an index.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use turnkeeper::core::entropy;

#[derive(Parser)]
#[command(name = "entropy-tool", about = "Verify and extend deterministic entropy")]
struct Cli {
    /// Path to the entropy stream.
    #[arg(long, default_value = "data/dice/entropy.ndjson")]
    file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the stream: dense 1-based indices, well-formed pools.
    Check,
    /// Deterministically append N entries from the fixed seed.
    Extend { count: u64 },
    /// Audit a changelog for unique, in-range entropy indices.
    Audit { changelog: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Check => {
            let entries = entropy::read_stream(&cli.file)?;
            println!("Validated {} entropy lines", entries.len());
        }
        Command::Extend { count } => {
            let total = entropy::extend_stream(&cli.file, count)?;
            println!("Appended {count} lines; new total {total}");
        }
        Command::Audit { changelog } => {
            let max_index = entropy::stream_length(&cli.file)?;
            let raw = std::fs::read_to_string(&changelog)?;
            let lines: Vec<String> = raw.lines().map(String::from).collect();
            let used = entropy::audit_changelog(&lines, max_index)?;
            println!("Audit passed: {used} unique entropy indices referenced");
        }
    }
    Ok(())
}
