//! Appraisal CLI — assemble an appraisal report record from a case file.
//!
//! Runs the fixed stage plan against one subject property and prints a
//! per-stage status table with review flags.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
