//! Tilecascade CLI.
//!
//! Thin command-line surface over the `tilecascade` library: pick a
//! registered process, a pyramid and a zoom range, then run the batch
//! against a tile directory output.

mod commands;
mod error;

use clap::{Parser, Subcommand};

use crate::commands::execute::ExecuteArgs;
use crate::error::CliError;

#[derive(Debug, Parser)]
#[command(name = "tilecascade", version, about = "Tile pyramid batch processing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a batch: process tiles into a tile directory
    Execute(ExecuteArgs),
}

fn main() {
    tilecascade::telemetry::init_logging("info");

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Execute(args) => commands::execute::run(args),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        std::process::exit(1);
    }
}
