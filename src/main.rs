//! ClipMirror - clipboard mirroring between two endpoints
//!
//! This is the main entry point for the `clipmirror` binary.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipmirror::cli::{Cli, CliHandler};
use clipmirror::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        Config::load_config(cli.config.as_deref())
            .map(|config| config.log_level)
            .unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clipmirror={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("ClipMirror v{} ({})", clipmirror::VERSION, env!("TARGET"));

    let mut handler = CliHandler::new(cli.config);
    handler.handle_command(cli.command).await?;

    Ok(())
}
