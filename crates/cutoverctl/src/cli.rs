//! CLI - Command-line argument parsing
//!
//! Keeps argument parsing separate from execution logic.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Shown for the commands that need the upgrade lock to reset state
pub const STALE_LOCK_HELP: &str = "Takes the upgrade lock (<home>/upgrade-state.lock). \
On platforms without flock a crashed run leaves that file behind; \
delete it by hand if no cutoverctl process is running.";

/// Resumable validator network upgrades
#[derive(Parser, Debug)]
#[command(name = "cutoverctl")]
#[command(about = "Resume, inspect or reset an in-flight network upgrade", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Deployment home directory (overrides the config file)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Config file (overrides $CUTOVER_CONFIG and <home>/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging (overridden by $CUTOVER_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resume the saved upgrade from its reconciled stage
    Resume {
        /// Refuse to resume unless the saved upgrade has this name
        #[arg(long)]
        upgrade_name: Option<String>,

        /// Refuse to resume unless the saved upgrade targets this version
        #[arg(long)]
        target_version: Option<String>,
    },

    /// Show the saved upgrade state
    Status {
        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Delete the saved upgrade state
    #[command(after_help = STALE_LOCK_HELP)]
    ClearState,

    /// Discard the saved upgrade state and start over
    #[command(after_help = STALE_LOCK_HELP)]
    ForceRestart,

    /// Record a new upgrade
    Init {
        #[arg(long)]
        name: String,

        /// docker or local
        #[arg(long)]
        mode: String,

        #[arg(long)]
        skip_governance: bool,

        #[arg(long)]
        target_version: Option<String>,

        #[arg(long)]
        target_binary: Option<String>,

        #[arg(long)]
        target_image: Option<String>,
    },
}
