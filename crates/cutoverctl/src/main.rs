//! Cutover Control - operator CLI for resumable network upgrades
//!
//! Maps resume / status / clear-state / force-restart onto the resume facade.

use anyhow::Result;
use clap::Parser;
use cutover_common::CutoverConfig;
use cutoverctl::cli::Cli;
use cutoverctl::{commands, logging};
use owo_colors::OwoColorize;
use tracing::info_span;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{}  {:#}", "✗".bright_red(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = CutoverConfig::load(cli.config.as_deref(), cli.home.as_deref())?;
    let run_id = uuid::Uuid::new_v4();
    let root = info_span!("cutoverctl", %run_id);
    commands::run(cli.command, &config, &root).await
}
