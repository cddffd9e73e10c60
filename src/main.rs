//! Commune - content-addressed transformation cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use commune::cli::{Cli, Commands};
use commune::config::{Config, ConfigManager};
use commune::error::CommuneResult;
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CommuneResult<()> {
    let cli = Cli::parse();

    match cli.command {
        // Worker processes only talk JSON lines and never read the config
        Commands::Worker => {
            init_logging(cli.verbose, false);
            commune::cli::commands::worker().await
        }
        Commands::Serve(args) => {
            let (config, _) = load_config(cli.config, cli.verbose).await?;
            commune::cli::commands::serve(args, &config).await
        }
        Commands::Run(args) => {
            let (config, _) = load_config(cli.config, cli.verbose).await?;
            commune::cli::commands::run(args, &config).await
        }
        Commands::Checksum(args) => {
            load_config(cli.config, cli.verbose).await?;
            commune::cli::commands::checksum(args).await
        }
        Commands::Config(args) => {
            let (config, manager) = load_config(cli.config, cli.verbose).await?;
            commune::cli::commands::config(args, &config, &manager).await
        }
    }
}

/// Load the configuration and start logging in its format
async fn load_config(
    path: Option<PathBuf>,
    verbose: u8,
) -> CommuneResult<(Config, ConfigManager)> {
    let manager = match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    };
    let config = manager.load().await?;
    init_logging(verbose, config.general.log_format == "json");
    Ok((config, manager))
}

/// 0 = warn, 1 = info, 2+ = debug; always on stderr
fn init_logging(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("commune=warn"),
        1 => EnvFilter::new("commune=info"),
        _ => EnvFilter::new("commune=debug"),
    };

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }
}
