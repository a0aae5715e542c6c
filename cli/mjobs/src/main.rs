//! mjobs - CLI for the managed-jobs scheduler
//!
//! Submits, cancels and inspects jobs by reading and writing the job store
//! directly; the scheduler picks changes up on its next tick.

use anyhow::Result;
use clap::Parser;

mod commands;
mod error;
mod output;

use commands::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run() {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
