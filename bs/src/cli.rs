//! CLI argument parsing for boardstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "boardstore")]
#[command(version, about = "Inspect a boardstore database", long_about = None)]
pub struct Cli {
    /// Path to the store directory
    #[arg(short, long, default_value = ".boardstore")]
    pub store: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List all collections with record counts
    Collections,

    /// Dump records of a collection as JSON lines
    List {
        /// Collection name
        #[arg(required = true)]
        collection: String,

        /// Maximum records to print
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Print a single record by id
    Get {
        /// Collection name
        #[arg(required = true)]
        collection: String,

        /// Record id
        #[arg(required = true)]
        id: String,
    },
}
