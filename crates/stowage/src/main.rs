//! Stowage CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use stowage::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output
    let directive = if cli.debug { "stowage=debug" } else { "stowage=info" };
    let output = if cli.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };
    tracing_subscriber::registry()
        .with(output)
        .with(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    cli.execute().await
}
