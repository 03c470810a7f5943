//! netgate: admin command line for the captive-portal access controller
//!
//! Each invocation runs one lifecycle operation:
//! - Loads config and the JSON state file
//! - Applies the change and persists it
//! - Inserts or deletes the iptables accept rule for the affected MAC
//!
//! Results are printed as JSON on stdout; logs go to stderr.

mod cli;
mod state;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

/// Filter used when `RUST_LOG` is unset; targets are the binary and core crate
const DEFAULT_LOG_FILTER: &str = "netgate=info,netgate_core=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = state::load_config(cli.config.as_deref())?;
    let service = state::build_service(&config, cli.state.as_deref(), cli.dry_run)?;

    let output = cli::run(&service, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
