//! Sidecar CLI
//!
//! Command-line entry point for the Sidecar binding-driven forwarder.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Execute command
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cli::run::run(&cli.node).await?,
        Commands::Check { json } => cli::check::run(&cli.node, json)?,
        Commands::Info => cli::info::run(&cli.node)?,
    }

    Ok(())
}
