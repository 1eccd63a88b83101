// Autocoder
// Main entry point for the autocoder binary

use autocoder_engine::cli::{Cli, Command};
use autocoder_engine::config::Config;
use autocoder_engine::handlers::{handle_history, handle_run, handle_setup, OutputFormat};
use autocoder_engine::telemetry::init_telemetry_with_level;
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // API keys may live in a local .env file
    dotenvy::dotenv().ok();

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(log_level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");
    tracing::info!("Autocoder v{} ({} - {})", version, commit, timestamp);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Handle commands
    match cli.command {
        Command::Run(args) => {
            tracing::info!("Executing task: {}", args.task);
            let succeeded = handle_run(args, &config, format).await?;
            Ok(if succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::History { limit } => {
            tracing::info!("Showing last {} tasks", limit);
            handle_history(limit, &config, format).await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Setup => {
            tracing::info!("Running setup...");
            handle_setup(&config, format).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
