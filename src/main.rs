mod cli;
mod commands;
mod error;

use crate::cli::{Cli, Command};
use crate::error::{ErrorKind, Result};
use clap::Parser;
use exn::ResultExt;
use mirage_config::Config;
use mirage_policy::Verdict;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    tracing::debug!(cache = %config.cache.directory.display(), policy = %config.policy, "Loaded configuration");

    match cli.command {
        Command::Cache(command) => commands::cache(command, &config).await?,
        Command::Gate(args) => {
            let verdict = commands::gate(args, &config);
            match &verdict {
                Verdict::Ok => println!("ok"),
                Verdict::Warn(dimensions) | Verdict::AutoPause(dimensions) => {
                    let label = if verdict.is_paused() { "auto-pause" } else { "warn" };
                    let names: Vec<String> = dimensions.iter().map(ToString::to_string).collect();
                    println!("{label}: {}", names.join(", "));
                },
            }
            if verdict.is_paused() {
                return Ok(ExitCode::from(2));
            }
        },
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        },
    }
}
