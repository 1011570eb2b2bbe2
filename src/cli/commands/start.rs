//! Start command - launches the broker.

use crate::cli::args::{Cli, StartArgs};
use crate::config::NoListenerEnabled;
use crate::runtime::Runtime;
use crate::telemetry;
use anyhow::Result;
use clap::CommandFactory;
use std::process::ExitCode;

pub async fn run_start(args: StartArgs) -> Result<ExitCode> {
    let config = args.resolve()?;
    if let Err(err) = config.validate() {
        if err.is::<NoListenerEnabled>() {
            eprintln!("error: {err}\n");
            let mut cli = Cli::command();
            if let Some(start) = cli.find_subcommand_mut("start") {
                let _ = start.print_help();
            }
            return Ok(ExitCode::from(2));
        }
        return Err(err);
    }
    telemetry::init_tracing(&config.telemetry)?;
    config.log_effective();
    let mut runtime = Runtime::new(config)?;
    runtime.run().await?;
    Ok(ExitCode::SUCCESS)
}
