//! Gatehouse - unified CLI entrypoint.
//!
//! Usage:
//!   gatehouse start --mqtt --remote-host auth.internal --protocol http
//!   gatehouse start -w --config gatehouse.toml
//!   gatehouse probe --token alice --key secret sensors/temp

use anyhow::Result;
use clap::Parser;
use gatehouse::cli::commands::{run_probe, run_start};
use gatehouse::cli::{Cli, Commands};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Probe(args) => run_probe(args).await,
    }
}
