use clap::Parser;
use eyre::{Context, Result};
use tracing_subscriber::EnvFilter;

use boardflow::app::Orchestrator;
use boardflow::cli::{Cli, Command};
use boardflow::config::Config;
use boardflow::domain::QueueStatus;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Serve => {
            let orchestrator = Orchestrator::start(config).await?;
            orchestrator.serve().await?;
        }
        Command::Status => {
            let store = boardstore::Store::open(&config.storage.store_dir).context("Failed to open store")?;

            println!("Collections:");
            for c in store.collections()? {
                println!("  {:30} {}", c.name, c.count);
            }

            let live: Vec<boardflow::domain::QueueEntry> = store
                .list(&[])?
                .into_iter()
                .filter(|e: &boardflow::domain::QueueEntry| !e.is_terminal())
                .collect();
            if live.is_empty() {
                println!("\nNo live queue entries");
            } else {
                println!("\nLive queue entries:");
                for entry in live {
                    let age_s = (boardstore::now_ms() - entry.queued_at) / 1000;
                    let marker = match entry.status {
                        QueueStatus::Running => ">",
                        QueueStatus::WaitingValidation => "?",
                        _ => "-",
                    };
                    println!(
                        "  {} {} item={} prio={} status={} age={}s",
                        marker, entry.id, entry.external_item_id, entry.priority, entry.status, age_s
                    );
                }
            }
        }
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}
