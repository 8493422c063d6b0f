//! tgkb CLI: Telegram channel exports to a Markdown knowledge base.
//!
//! Combines CSV exports, titles every post through OpenRouter with model
//! fallback, and renders one navigable Markdown document.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
