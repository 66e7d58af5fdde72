//! CLI argument parsing for boardflow

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bf")]
#[command(version, about = "Board-driven development workflow orchestrator", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the orchestrator and webhook ingress
    Serve,

    /// Print a summary of the store contents
    Status,

    /// Print the effective configuration
    Config,
}
