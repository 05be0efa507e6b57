#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names
)]

use anyhow::{Context, Result};
use clap::Parser;
use neuronbroker::app;
use neuronbroker::cli::Cli;
use neuronbroker::config::BrokerConfig;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let mut config = BrokerConfig::load(cli.config.as_deref())?;
    cli.command.apply(&mut config);

    let adapter = cli.command.adapter();
    tracing::info!(adapter = %adapter, host = config.message.host.as_str(), "Starting broker");
    app::run(adapter, config).await
}
