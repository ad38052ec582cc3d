//! Stevedore - stages storage, cache and synchronization
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use stevedore::cli::{Cli, Commands};
use stevedore::config::{Config, ConfigManager};
use stevedore::error::StevedoreResult;
use tracing::debug;
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

fn init_logging(verbose: u8, config: &Config) {
    // 0 = warn, 1 = info, 2+ = debug
    let level = verbose.max(u8::from(config.general.verbose));
    let filter = match level {
        0 => EnvFilter::new("stevedore=warn"),
        1 => EnvFilter::new("stevedore=info"),
        _ => EnvFilter::new("stevedore=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

async fn run() -> StevedoreResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config);
    debug!("Loaded configuration from {}", config_manager.path().display());

    match cli.command {
        Commands::Serve(args) => stevedore::cli::commands::serve(args, &config).await,
        Commands::Cache(args) => stevedore::cli::commands::cache(args, &config).await,
        Commands::Stages(args) => stevedore::cli::commands::stages(args, &config).await,
        Commands::Config(args) => {
            stevedore::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
