mod auth;
mod cache;
mod chain;
mod cli;
mod config;
mod error;
mod output;
mod providers;
mod tracked;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    output::print_banner();

    let cli = Cli::parse();
    info!("Starting ChainLens");
    cli.execute().await?;

    Ok(())
}
