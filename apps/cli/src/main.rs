//! Cartograph CLI: run the enrichment pipeline over a feed of domains and
//! inspect what it has learned.

mod commands;
mod feed;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
